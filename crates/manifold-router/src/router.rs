//! The connection router: path-template registration, mount handling,
//! nested sub-resource resolution, and the connect lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use manifold_core::error::{BoxError, DefinitionError};
use manifold_core::hooks::{HookCollection, HookContext, HookEvent};
use manifold_core::state::{Params, SharedState};
use manifold_core::transport::{WsConn, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL};

use crate::lifecycle::{close_quietly, HookManager, Session};
use crate::resource::{
    build_table, BoxedResource, FactoryContext, Resource, ResourceCell, SubrouteFactory,
};
use crate::template::{canonical_path, RouteTemplate, UrlError};

/// Close-code configuration for router-driven lifecycles.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Close code used when `on_connect` declines the connection.
    pub reject_close_code: u16,
    /// Close code used when resolution, a hook, or a handler fails.
    pub error_close_code: u16,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            reject_close_code: CLOSE_NORMAL,
            error_close_code: CLOSE_INTERNAL_ERROR,
        }
    }
}

/// The connection request handed over by the external transport after the
/// WebSocket handshake headers arrived.
#[derive(Clone, Debug, Default)]
pub struct ConnectRequest {
    /// Full request path.
    pub path: String,
    /// The mount prefix under which the transport dispatched this request.
    pub mount: String,
    /// Subprotocol to accept with, if any.
    pub subprotocol: Option<String>,
}

impl ConnectRequest {
    pub fn new(path: impl Into<String>, mount: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mount: mount.into(),
            subprotocol: None,
        }
    }
}

/// Errors from connection resolution and the connect lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("no websocket route matches path {0:?}")]
    NotFound(String),
    #[error("on_connect failed: {0}")]
    Connect(#[source] BoxError),
    #[error("lifecycle hook failed: {0}")]
    Hook(#[source] BoxError),
    #[error("transport accept failed: {0}")]
    Transport(#[source] BoxError),
}

impl ConnectError {
    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Connect(_) => "connect",
            Self::Hook(_) => "hook",
            Self::Transport(_) => "transport",
        }
    }
}

/// Metadata about a matched route, handed to a [`ResourceFactory`].
pub struct RouteInfo<'a> {
    pub path: &'a str,
    pub name: Option<&'a str>,
}

/// Builds resource instances for matched routes.
///
/// The router's default behaviour runs the constructor given at
/// registration time; inject an implementation to observe or wrap root
/// instantiation (for example to seed connection state from shared
/// services). `construct` runs the registered constructor.
pub trait ResourceFactory: Send + Sync {
    fn build(
        &self,
        route: RouteInfo<'_>,
        ctx: &FactoryContext<'_>,
        construct: &dyn Fn(&FactoryContext<'_>) -> BoxedResource,
    ) -> BoxedResource;
}

struct Route {
    template: RouteTemplate,
    name: Option<String>,
    construct: SubrouteFactory,
}

/// Routes WebSocket connections registered under a mount prefix.
///
/// Routes are tried in registration order; the first one that resolves the
/// whole path (directly or through nested subroutes) wins.
pub struct Router {
    config: RouterConfig,
    mount: Option<String>,
    routes: Vec<Route>,
    global_hooks: Arc<HookCollection>,
    factory: Option<Arc<dyn ResourceFactory>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    pub fn with_config(config: RouterConfig) -> Self {
        Self {
            config,
            mount: None,
            routes: Vec::new(),
            global_hooks: Arc::new(HookCollection::new()),
            factory: None,
        }
    }

    /// The router-scope hook collection. Hooks added here wrap every
    /// connection this router resolves.
    pub fn global_hooks(&self) -> &Arc<HookCollection> {
        &self.global_hooks
    }

    /// Inject a construction hook for root resources.
    pub fn set_resource_factory(&mut self, factory: Arc<dyn ResourceFactory>) {
        self.factory = Some(factory);
    }

    /// Bind the base prefix under which this router's routes live. May be
    /// called at most once.
    pub fn mount(&mut self, prefix: &str) -> Result<(), DefinitionError> {
        if let Some(existing) = &self.mount {
            return Err(DefinitionError::AlreadyMounted(existing.clone()));
        }
        self.mount = Some(canonical_path(prefix));
        Ok(())
    }

    /// Register `make` to build the resource handling `path`.
    pub fn add_route<C, F>(&mut self, path: &str, make: F) -> Result<(), DefinitionError>
    where
        C: Resource,
        F: Fn(&FactoryContext<'_>) -> C + Send + Sync + 'static,
    {
        self.add_route_inner(path, None, make)
    }

    /// Register a named route; the name is usable with [`Router::url_for`].
    pub fn add_route_named<C, F>(
        &mut self,
        path: &str,
        name: &str,
        make: F,
    ) -> Result<(), DefinitionError>
    where
        C: Resource,
        F: Fn(&FactoryContext<'_>) -> C + Send + Sync + 'static,
    {
        self.add_route_inner(path, Some(name.to_string()), make)
    }

    fn add_route_inner<C, F>(
        &mut self,
        path: &str,
        name: Option<String>,
        make: F,
    ) -> Result<(), DefinitionError>
    where
        C: Resource,
        F: Fn(&FactoryContext<'_>) -> C + Send + Sync + 'static,
    {
        let template = RouteTemplate::parse(path)?;
        if self
            .routes
            .iter()
            .any(|route| route.template.path() == template.path())
        {
            return Err(DefinitionError::DuplicateRoute(template.path().to_string()));
        }
        if let Some(name) = &name {
            if self
                .routes
                .iter()
                .any(|route| route.name.as_deref() == Some(name.as_str()))
            {
                return Err(DefinitionError::DuplicateRouteName(name.clone()));
            }
        }
        let table = build_table::<C>()?;
        let construct: SubrouteFactory = Arc::new(move |ctx: &FactoryContext<'_>| {
            let resource = make(ctx);
            BoxedResource(Box::new(ResourceCell {
                resource,
                table: Arc::clone(&table),
                state: ctx.state.clone(),
            }))
        });
        self.routes.push(Route {
            template,
            name,
            construct,
        });
        Ok(())
    }

    /// Reverse-generate the relative path for a named route.
    pub fn url_for(&self, name: &str, params: &Params) -> Result<String, UrlError> {
        let route = self
            .routes
            .iter()
            .find(|route| route.name.as_deref() == Some(name))
            .ok_or_else(|| UrlError::UnknownRoute(name.to_string()))?;
        route.template.format(params)
    }

    /// Resolve an inbound connection and drive the connect lifecycle.
    ///
    /// Returns `Ok(None)` when `on_connect` declined (the socket is closed
    /// with the reject code). Every error path closes the socket before
    /// returning.
    pub async fn handle_connection(
        &self,
        req: &ConnectRequest,
        ws: Arc<dyn WsConn>,
    ) -> Result<Option<Session>, ConnectError> {
        let remaining = match self.strip_mount(req) {
            Some(path) => path,
            None => {
                debug!(path = %req.path, mount = %req.mount, "mount context mismatch");
                close_quietly(&*ws, self.config.error_close_code).await;
                return Err(ConnectError::NotFound(req.path.clone()));
            }
        };

        let Some((mut chain, params)) = self.resolve(&remaining) else {
            debug!(path = %remaining, "no websocket route matched");
            close_quietly(&*ws, self.config.error_close_code).await;
            return Err(ConnectError::NotFound(remaining));
        };

        let manager = HookManager::new(
            Arc::clone(&self.global_hooks),
            chain.iter().map(|resource| resource.0.hooks()).collect(),
        );
        let mut ctx = HookContext::connect(params);
        if let Err(err) = manager.run_before(HookEvent::BeforeConnect, &mut ctx).await {
            close_quietly(&*ws, self.config.error_close_code).await;
            return Err(ConnectError::Hook(err));
        }

        let Some(target) = chain.last_mut() else {
            close_quietly(&*ws, self.config.error_close_code).await;
            return Err(ConnectError::NotFound(remaining));
        };
        match target.0.connect(req, &*ws, &ctx.params).await {
            Ok(accepted) => {
                ctx.result = Some(accepted);
                if let Err(err) = manager.run_after(HookEvent::AfterConnect, &mut ctx).await {
                    close_quietly(&*ws, self.config.error_close_code).await;
                    return Err(ConnectError::Hook(err));
                }
                if !accepted {
                    debug!(path = %req.path, "connection declined by on_connect");
                    close_quietly(&*ws, self.config.reject_close_code).await;
                    return Ok(None);
                }
                if let Err(err) = ws.accept(req.subprotocol.as_deref()).await {
                    close_quietly(&*ws, self.config.error_close_code).await;
                    return Err(ConnectError::Transport(err));
                }
                info!(path = %req.path, depth = chain.len(), "websocket connection accepted");
                Ok(Some(Session::new(
                    chain,
                    manager,
                    ws,
                    ctx.params,
                    self.config.clone(),
                )))
            }
            Err(err) => {
                ctx.attach_error(err);
                let _ = manager.run_after(HookEvent::AfterConnect, &mut ctx).await;
                close_quietly(&*ws, self.config.error_close_code).await;
                let original = ctx
                    .take_error()
                    .unwrap_or_else(|| BoxError::from("on_connect failed"));
                Err(ConnectError::Connect(original))
            }
        }
    }

    /// Verify the request's mount context and return the path remainder
    /// relative to this router's prefix.
    fn strip_mount(&self, req: &ConnectRequest) -> Option<String> {
        let mount = self
            .mount
            .clone()
            .unwrap_or_else(|| "/".to_string());
        if canonical_path(&req.mount) != mount {
            return None;
        }
        let path = canonical_path(&req.path);
        if mount == "/" {
            return Some(path);
        }
        match path.strip_prefix(&mount) {
            Some("") => Some("/".to_string()),
            Some(rest) if rest.starts_with('/') => Some(rest.to_string()),
            _ => None,
        }
    }

    fn resolve(&self, path: &str) -> Option<(Vec<BoxedResource>, Params)> {
        for route in &self.routes {
            if let Some(params) = route.template.match_full(path) {
                let resource = self.instantiate(route, &params, SharedState::new());
                return Some((vec![resource], params));
            }
            if let Some((params, rest)) = route.template.match_prefix(path) {
                if rest.is_empty() {
                    continue;
                }
                let mut merged = params;
                let root = self.instantiate(route, &merged, SharedState::new());
                let mut chain = vec![root];
                if resolve_nested(&mut chain, &rest, &mut merged) {
                    return Some((chain, merged));
                }
                // Nested resolution failed; the next route may still match.
            }
        }
        None
    }

    fn instantiate(&self, route: &Route, params: &Params, state: SharedState) -> BoxedResource {
        let values = HashMap::new();
        let ctx = FactoryContext {
            params,
            values: &values,
            state,
        };
        match &self.factory {
            Some(factory) => factory.build(
                RouteInfo {
                    path: route.template.path(),
                    name: route.name.as_deref(),
                },
                &ctx,
                &*route.construct,
            ),
            None => (route.construct)(&ctx),
        }
    }
}

/// Walk a parent's subroutes against the remaining path, accumulating the
/// chain and merging parameters (deeper levels shadow outer ones).
fn resolve_nested(chain: &mut Vec<BoxedResource>, path: &str, merged: &mut Params) -> bool {
    let Some(parent) = chain.last() else {
        return false;
    };
    let subs: Vec<(RouteTemplate, SubrouteFactory)> = parent
        .0
        .subroutes()
        .iter()
        .map(|sub| (sub.template.clone(), Arc::clone(&sub.construct)))
        .collect();
    let child_ctx = parent.0.child_context();
    let parent_state = parent.0.state();

    for (template, construct) in &subs {
        if let Some(child_params) = template.match_full(path) {
            merged.extend(child_params);
            let state = child_ctx
                .state
                .clone()
                .unwrap_or_else(|| parent_state.clone());
            let ctx = FactoryContext {
                params: merged,
                values: &child_ctx.values,
                state,
            };
            chain.push((construct)(&ctx));
            return true;
        }
        if let Some((child_params, rest)) = template.match_prefix(path) {
            if rest.is_empty() {
                continue;
            }
            let saved_len = chain.len();
            let saved_params = merged.clone();
            merged.extend(child_params);
            let state = child_ctx
                .state
                .clone()
                .unwrap_or_else(|| parent_state.clone());
            let ctx = FactoryContext {
                params: merged,
                values: &child_ctx.values,
                state,
            };
            let child = (construct)(&ctx);
            chain.push(child);
            if resolve_nested(chain, &rest, merged) {
                return true;
            }
            chain.truncate(saved_len);
            *merged = saved_params;
        }
    }
    false
}

/// Convenience: parameters for [`Router::url_for`] from string pairs.
pub fn url_params<const N: usize>(pairs: [(&str, &str); N]) -> Params {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use crate::resource::{ChildContext, ResourceConfig};
    use crate::testutil::RecorderConn;

    #[derive(Clone, Default)]
    struct Seen {
        params: Arc<Mutex<Vec<Params>>>,
    }

    struct Leaf {
        seen: Seen,
        accept: bool,
    }

    #[async_trait]
    impl Resource for Leaf {
        async fn on_connect(
            &mut self,
            _req: &ConnectRequest,
            _ws: &dyn WsConn,
            params: &Params,
        ) -> Result<bool, BoxError> {
            self.seen.params.lock().push(params.clone());
            Ok(self.accept)
        }
    }

    fn leaf_route(
        seen: &Seen,
        accept: bool,
    ) -> impl Fn(&FactoryContext<'_>) -> Leaf + Send + Sync + 'static {
        let seen = seen.clone();
        move |_ctx| Leaf {
            seen: seen.clone(),
            accept,
        }
    }

    #[tokio::test]
    async fn dispatches_to_matching_route() {
        let seen = Seen::default();
        let mut router = Router::new();
        router.add_route("/{id}", leaf_route(&seen, true)).unwrap();
        router.mount("/ws").unwrap();

        let ws = Arc::new(RecorderConn::default());
        let req = ConnectRequest::new("/ws/42", "/ws");
        let session = router
            .handle_connection(&req, ws.clone())
            .await
            .unwrap()
            .unwrap();

        assert!(ws.is_accepted());
        assert_eq!(session.params()["id"], json!("42"));
        assert_eq!(seen.params.lock()[0]["id"], json!("42"));
        assert_eq!(session.depth(), 1);
    }

    #[tokio::test]
    async fn unmatched_path_is_not_found_and_closes() {
        let seen = Seen::default();
        let mut router = Router::new();
        router.add_route("/things", leaf_route(&seen, true)).unwrap();
        router.mount("/").unwrap();

        let ws = Arc::new(RecorderConn::default());
        let req = ConnectRequest::new("/nothing", "/");
        let err = router.handle_connection(&req, ws.clone()).await.unwrap_err();

        assert_eq!(err.kind(), "not_found");
        assert!(!ws.is_accepted());
        assert_eq!(ws.close_codes(), vec![CLOSE_INTERNAL_ERROR]);
    }

    #[tokio::test]
    async fn mount_context_mismatch_is_not_found() {
        let seen = Seen::default();
        let mut router = Router::new();
        router.add_route("/things", leaf_route(&seen, true)).unwrap();
        router.mount("/ws").unwrap();

        let ws = Arc::new(RecorderConn::default());
        let req = ConnectRequest::new("/other/things", "/other");
        let err = router.handle_connection(&req, ws).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn declined_connection_closes_with_reject_code() {
        let seen = Seen::default();
        let mut router = Router::new();
        router.add_route("/no", leaf_route(&seen, false)).unwrap();
        router.mount("/").unwrap();

        let ws = Arc::new(RecorderConn::default());
        let req = ConnectRequest::new("/no", "/");
        let outcome = router.handle_connection(&req, ws.clone()).await.unwrap();

        assert!(outcome.is_none());
        assert!(!ws.is_accepted());
        assert_eq!(ws.close_codes(), vec![CLOSE_NORMAL]);
    }

    #[tokio::test]
    async fn on_connect_error_closes_and_propagates() {
        struct Exploder;

        #[async_trait]
        impl Resource for Exploder {
            async fn on_connect(
                &mut self,
                _req: &ConnectRequest,
                _ws: &dyn WsConn,
                _params: &Params,
            ) -> Result<bool, BoxError> {
                Err("refused loudly".into())
            }
        }

        let mut router = Router::new();
        router.add_route("/boom", |_ctx| Exploder).unwrap();
        router.mount("/").unwrap();

        let ws = Arc::new(RecorderConn::default());
        let req = ConnectRequest::new("/boom", "/");
        let err = router.handle_connection(&req, ws.clone()).await.unwrap_err();

        assert_eq!(err.kind(), "connect");
        assert!(err.to_string().contains("refused loudly"));
        assert_eq!(ws.close_codes(), vec![CLOSE_INTERNAL_ERROR]);
    }

    #[test]
    fn mount_twice_fails() {
        let mut router = Router::new();
        router.mount("/ws").unwrap();
        let err = router.mount("/other").unwrap_err();
        assert_eq!(err.kind(), "already_mounted");
    }

    #[test]
    fn duplicate_path_fails() {
        let seen = Seen::default();
        let mut router = Router::new();
        router.add_route("/a", leaf_route(&seen, true)).unwrap();
        let err = router.add_route("/a/", leaf_route(&seen, true)).unwrap_err();
        assert_eq!(err.kind(), "duplicate_route");
    }

    #[test]
    fn duplicate_name_fails() {
        let seen = Seen::default();
        let mut router = Router::new();
        router
            .add_route_named("/a", "thing", leaf_route(&seen, true))
            .unwrap();
        let err = router
            .add_route_named("/b", "thing", leaf_route(&seen, true))
            .unwrap_err();
        assert_eq!(err.kind(), "duplicate_route_name");
    }

    #[test]
    fn url_for_generates_and_fails_cleanly() {
        let seen = Seen::default();
        let mut router = Router::new();
        router
            .add_route_named("/things/{tid}", "thing", leaf_route(&seen, true))
            .unwrap();

        let path = router.url_for("thing", &url_params([("tid", "99")])).unwrap();
        assert_eq!(path, "/things/99");

        assert!(matches!(
            router.url_for("nope", &Params::new()),
            Err(UrlError::UnknownRoute(_))
        ));
        assert!(matches!(
            router.url_for("thing", &Params::new()),
            Err(UrlError::MissingParameter(_))
        ));
    }

    // --- nested subroutes ---

    struct NestParent;

    impl Resource for NestParent {
        fn configure(cfg: &mut ResourceConfig<Self>) {
            cfg.subroute("child/{cid}", |_ctx| NestChild);
        }
    }

    struct NestChild;

    impl Resource for NestChild {}

    #[tokio::test]
    async fn nested_subroute_merges_params() {
        let mut router = Router::new();
        router.add_route("/parent/{pid}", |_ctx| NestParent).unwrap();
        router.mount("/").unwrap();

        let ws = Arc::new(RecorderConn::default());
        let req = ConnectRequest::new("/parent/1/child/2", "/");
        let session = router
            .handle_connection(&req, ws)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(session.depth(), 2);
        assert_eq!(session.params()["pid"], json!("1"));
        assert_eq!(session.params()["cid"], json!("2"));
    }

    #[tokio::test]
    async fn unmatched_nested_paths_are_not_found() {
        for path in ["/parent/1/oops", "/parent/1child/2"] {
            let mut router = Router::new();
            router.add_route("/parent/{pid}", |_ctx| NestParent).unwrap();
            router.mount("/").unwrap();

            let ws = Arc::new(RecorderConn::default());
            let req = ConnectRequest::new(path, "/");
            let err = router.handle_connection(&req, ws).await.unwrap_err();
            assert_eq!(err.kind(), "not_found", "path: {path}");
        }
    }

    struct CtxParent;

    impl Resource for CtxParent {
        fn configure(cfg: &mut ResourceConfig<Self>) {
            cfg.subroute("child", |ctx| {
                let project = ctx.values.get("project").cloned().unwrap_or(Value::Null);
                ctx.state.insert("project", project);
                CtxChild
            });
        }

        fn child_context(&self) -> ChildContext {
            ChildContext::new().with_value("project", json!("acme"))
        }
    }

    struct CtxChild;

    impl Resource for CtxChild {}

    #[tokio::test]
    async fn child_context_values_reach_the_child_constructor() {
        let mut router = Router::new();
        router
            .add_route("/ctx", |ctx| {
                ctx.state.insert("parent", json!(true));
                CtxParent
            })
            .unwrap();
        router.mount("/").unwrap();

        let ws = Arc::new(RecorderConn::default());
        let req = ConnectRequest::new("/ctx/child", "/");
        let session = router.handle_connection(&req, ws).await.unwrap().unwrap();

        // The child shares the parent's state reference and saw the
        // parent-supplied constructor value.
        let state = session.state();
        assert_eq!(state.get("parent"), Some(json!(true)));
        assert_eq!(state.get("project"), Some(json!("acme")));
        assert_eq!(session.depth(), 2);
    }

    struct InjParent;

    impl Resource for InjParent {
        fn configure(cfg: &mut ResourceConfig<Self>) {
            cfg.subroute("child", |ctx| {
                ctx.state.insert("child_saw_injected", ctx.state.get("injected").unwrap_or(json!(false)));
                InjChild
            });
        }

        fn child_context(&self) -> ChildContext {
            let replacement = SharedState::new();
            replacement.insert("injected", json!(true));
            ChildContext::new().with_state(replacement)
        }
    }

    struct InjChild;

    impl Resource for InjChild {}

    #[tokio::test]
    async fn replacement_state_overrides_the_parent_reference() {
        let mut router = Router::new();
        router
            .add_route("/inj", |ctx| {
                ctx.state.insert("parent", json!(true));
                InjParent
            })
            .unwrap();
        router.mount("/").unwrap();

        let ws = Arc::new(RecorderConn::default());
        let req = ConnectRequest::new("/inj/child", "/");
        let session = router.handle_connection(&req, ws).await.unwrap().unwrap();

        let state = session.state();
        assert_eq!(state.get("injected"), Some(json!(true)));
        assert_eq!(state.get("child_saw_injected"), Some(json!(true)));
        assert!(state.get("parent").is_none());
    }

    struct ShadowParent;

    impl Resource for ShadowParent {
        fn configure(cfg: &mut ResourceConfig<Self>) {
            cfg.subroute("{id}/leaf", |_ctx| ShadowLeaf);
        }
    }

    struct ShadowLeaf;

    impl Resource for ShadowLeaf {}

    #[tokio::test]
    async fn deeper_parameter_shadows_the_outer_one() {
        let mut router = Router::new();
        router.add_route("/s/{id}", |_ctx| ShadowParent).unwrap();
        router.mount("/").unwrap();

        let ws = Arc::new(RecorderConn::default());
        let req = ConnectRequest::new("/s/outer/inner/leaf", "/");
        let session = router.handle_connection(&req, ws).await.unwrap().unwrap();

        assert_eq!(session.params()["id"], json!("inner"));
    }

    struct GParent;

    impl Resource for GParent {
        fn configure(cfg: &mut ResourceConfig<Self>) {
            cfg.subroute("child", |_ctx| GChild);
        }
    }

    struct GChild;

    impl Resource for GChild {
        fn configure(cfg: &mut ResourceConfig<Self>) {
            cfg.subroute("{cid}/grandchild", |_ctx| GGrand);
        }
    }

    struct GGrand;

    impl Resource for GGrand {}

    #[tokio::test]
    async fn grandchild_accumulates_ancestor_params() {
        let mut router = Router::new();
        router.add_route("/parent/{pid}", |_ctx| GParent).unwrap();
        router.mount("/").unwrap();

        let ws = Arc::new(RecorderConn::default());
        let req = ConnectRequest::new("/parent/1/child/2/grandchild", "/");
        let session = router.handle_connection(&req, ws).await.unwrap().unwrap();

        assert_eq!(session.depth(), 3);
        assert_eq!(session.params()["pid"], json!("1"));
        assert_eq!(session.params()["cid"], json!("2"));
    }

    #[tokio::test]
    async fn later_route_matches_when_nested_resolution_fails() {
        let seen = Seen::default();
        let mut router = Router::new();
        // Prefix-matches /x/fixed/y but has no subroutes, so resolution
        // falls through to the later, fully-matching route.
        router.add_route("/x/{a}", leaf_route(&seen, true)).unwrap();
        router.add_route("/x/fixed/y", leaf_route(&seen, true)).unwrap();
        router.mount("/").unwrap();

        let ws = Arc::new(RecorderConn::default());
        let req = ConnectRequest::new("/x/fixed/y", "/");
        let session = router.handle_connection(&req, ws).await.unwrap().unwrap();

        assert!(session.params().is_empty());
        assert_eq!(session.depth(), 1);
    }

    #[tokio::test]
    async fn resource_factory_wraps_instantiation() {
        struct CountingFactory {
            built: AtomicUsize,
        }

        impl ResourceFactory for CountingFactory {
            fn build(
                &self,
                route: RouteInfo<'_>,
                ctx: &FactoryContext<'_>,
                construct: &dyn Fn(&FactoryContext<'_>) -> BoxedResource,
            ) -> BoxedResource {
                assert_eq!(route.path, "/{id}");
                self.built.fetch_add(1, Ordering::Relaxed);
                construct(ctx)
            }
        }

        let factory = Arc::new(CountingFactory {
            built: AtomicUsize::new(0),
        });
        let seen = Seen::default();
        let mut router = Router::new();
        router.add_route("/{id}", leaf_route(&seen, true)).unwrap();
        router.mount("/").unwrap();
        router.set_resource_factory(factory.clone());

        let ws = Arc::new(RecorderConn::default());
        let req = ConnectRequest::new("/7", "/");
        router.handle_connection(&req, ws).await.unwrap().unwrap();

        assert_eq!(factory.built.load(Ordering::Relaxed), 1);
    }
}
