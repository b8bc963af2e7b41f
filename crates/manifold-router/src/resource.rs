//! The per-connection resource model: typed message-handler registration,
//! registration-time composition, nested subroutes, and the type-erased
//! form the router traffics in.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;

use manifold_core::codec::{struct_fields, DecodeError};
use manifold_core::error::{BoxError, DefinitionError};
use manifold_core::hooks::HookCollection;
use manifold_core::state::{Params, SharedState};
use manifold_core::transport::WsConn;

use crate::router::ConnectRequest;
use crate::template::RouteTemplate;

/// Future returned by a message handler.
pub type HandlerResult<'a> = BoxFuture<'a, Result<(), BoxError>>;

/// A message handler: an async method written with an explicit boxed
/// future so it can live in the handler table.
///
/// ```ignore
/// fn on_echo<'a>(&'a mut self, ws: &'a dyn WsConn, payload: Echo) -> HandlerResult<'a> {
///     Box::pin(async move { ws.send_media(&serde_json::json!({"ok": true})).await })
/// }
/// ```
pub type HandlerFn<R, T> = for<'a> fn(&'a mut R, &'a dyn WsConn, T) -> HandlerResult<'a>;

/// Outcome of feeding a decoded payload to a registered handler.
pub(crate) enum Invocation {
    /// The handler ran; its own failure surfaces through the outer `Result`.
    Completed,
    /// The payload failed conversion; route the raw frame to the fallback.
    Rejected(DecodeError),
}

type ErasedHandler<R> = Arc<
    dyn for<'a> Fn(&'a mut R, &'a dyn WsConn, Value) -> BoxFuture<'a, Result<Invocation, BoxError>>
        + Send
        + Sync,
>;

/// One registered handler plus the payload metadata captured at
/// registration time (the substitute for signature reflection).
pub(crate) struct HandlerEntry<R> {
    pub(crate) invoke: ErasedHandler<R>,
    pub(crate) payload_type: TypeId,
    pub(crate) payload_name: &'static str,
    pub(crate) fields: Option<&'static [&'static str]>,
    pub(crate) strict: bool,
}

impl<R> Clone for HandlerEntry<R> {
    fn clone(&self) -> Self {
        Self {
            invoke: Arc::clone(&self.invoke),
            payload_type: self.payload_type,
            payload_name: self.payload_name,
            fields: self.fields,
            strict: self.strict,
        }
    }
}

fn erase<R, T>(f: HandlerFn<R, T>) -> ErasedHandler<R>
where
    R: Resource,
    T: DeserializeOwned + Send + 'static,
{
    Arc::new(move |resource: &mut R, ws: &dyn WsConn, payload: Value| {
        match serde_json::from_value::<T>(payload) {
            Ok(typed) => {
                let fut = f(resource, ws, typed);
                Box::pin(async move { fut.await.map(|()| Invocation::Completed) })
            }
            Err(err) => {
                Box::pin(async move { Ok(Invocation::Rejected(DecodeError::Conversion(err))) })
            }
        }
    })
}

/// Values a parent forwards to a nested child at construction time.
#[derive(Default)]
pub struct ChildContext {
    /// Keyword-style values for the child's constructor.
    pub values: HashMap<String, Value>,
    /// Replacement shared state; `None` propagates the parent's state
    /// reference unchanged.
    pub state: Option<SharedState>,
}

impl ChildContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn with_state(mut self, state: SharedState) -> Self {
        self.state = Some(state);
        self
    }
}

/// Everything a resource constructor sees at match time.
pub struct FactoryContext<'a> {
    /// Path parameters merged across nesting levels so far.
    pub params: &'a Params,
    /// Values supplied by the parent via [`Resource::child_context`];
    /// empty for root resources.
    pub values: &'a HashMap<String, Value>,
    /// Connection-scoped shared state (the parent's, unless replaced).
    pub state: SharedState,
}

/// A per-connection WebSocket handler.
///
/// One instance exists per logical connection (or per nested sub-resource
/// segment within it); instances are dropped when the connection ends.
#[async_trait]
pub trait Resource: Send + 'static {
    /// Declarative registration of handlers, subroutes, hooks, and schema.
    ///
    /// Runs once per concrete type when a route referencing it is
    /// registered, producing an immutable merged table. Definition problems
    /// recorded here surface as errors from route registration.
    fn configure(cfg: &mut ResourceConfig<Self>)
    where
        Self: Sized,
    {
        let _ = cfg;
    }

    /// Decide whether the connection should be accepted. Default accepts.
    async fn on_connect(
        &mut self,
        req: &ConnectRequest,
        ws: &dyn WsConn,
        params: &Params,
    ) -> Result<bool, BoxError> {
        let _ = (req, ws, params);
        Ok(true)
    }

    /// Cleanup when the connection closes. Default no-op.
    async fn on_disconnect(&mut self, ws: &dyn WsConn, close_code: u16) {
        let _ = (ws, close_code);
    }

    /// Catch-all for frames that fail decoding or match no handler.
    async fn on_unhandled(&mut self, ws: &dyn WsConn, raw: &Bytes) {
        let _ = ws;
        tracing::debug!(len = raw.len(), "unhandled frame dropped");
    }

    /// Values (and optionally a replacement state) forwarded to nested
    /// children constructed under this resource.
    fn child_context(&self) -> ChildContext {
        ChildContext::default()
    }
}

pub(crate) type SubrouteFactory =
    Arc<dyn Fn(&FactoryContext<'_>) -> BoxedResource + Send + Sync>;

/// A nested sub-resource registration: a prefix template plus the child
/// constructor (which carries the child's pre-built table).
pub(crate) struct Subroute {
    pub(crate) template: RouteTemplate,
    pub(crate) construct: SubrouteFactory,
}

/// Collects a resource type's registrations; consumed into an immutable
/// [`ResourceTable`] when the referencing route is added.
///
/// The first definition problem is recorded and reported when the table is
/// built, so a misdeclared handler fails the route registration rather than
/// a live connection.
pub struct ResourceConfig<R: Resource> {
    handlers: HashMap<String, (usize, HandlerEntry<R>)>,
    methods: HashMap<String, (usize, HandlerEntry<R>)>,
    subroutes: Vec<Subroute>,
    hooks: Option<Arc<HookCollection>>,
    schema_tag: Option<&'static str>,
    layer: usize,
    error: Option<DefinitionError>,
}

impl<R: Resource> ResourceConfig<R> {
    fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            methods: HashMap::new(),
            subroutes: Vec::new(),
            hooks: None,
            schema_tag: None,
            layer: 0,
            error: None,
        }
    }

    /// Register a strict handler for a message-type tag.
    pub fn handle<T>(&mut self, tag: impl Into<String>, f: HandlerFn<R, T>) -> &mut Self
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.handle_with(tag, true, f)
    }

    /// Register a handler, choosing strict or lenient payload validation.
    ///
    /// Strict handlers reject mapping payloads carrying fields not declared
    /// on the payload type; lenient handlers ignore extras.
    pub fn handle_with<T>(
        &mut self,
        tag: impl Into<String>,
        strict: bool,
        f: HandlerFn<R, T>,
    ) -> &mut Self
    where
        T: DeserializeOwned + Send + 'static,
    {
        let tag = tag.into();
        if self.error.is_some() {
            return self;
        }
        let entry = Self::entry(strict, f);
        match self.handlers.get(&tag) {
            Some((layer, _)) if *layer == self.layer => {
                self.error = Some(DefinitionError::DuplicateHandler(tag));
            }
            _ => {
                self.handlers.insert(tag, (self.layer, entry));
            }
        }
        self
    }

    /// Register a conventional handler under a method-style name.
    ///
    /// Consulted only when no tagged handler matches, under the name
    /// `on_{to_snake_case(tag)}`, the explicit stand-in for resolving an
    /// un-registered method by naming convention.
    pub fn method<T>(&mut self, name: impl Into<String>, f: HandlerFn<R, T>) -> &mut Self
    where
        T: DeserializeOwned + Send + 'static,
    {
        let name = name.into();
        if self.error.is_some() {
            return self;
        }
        let entry = Self::entry(true, f);
        match self.methods.get(&name) {
            Some((layer, _)) if *layer == self.layer => {
                self.error = Some(DefinitionError::DuplicateMethod(name));
            }
            _ => {
                self.methods.insert(name, (self.layer, entry));
            }
        }
        self
    }

    /// Run a shared registration function as an earlier layer.
    ///
    /// Entries it registers may be overridden by later registrations for
    /// the same tag without error, the explicit form of a derived type
    /// taking over a base handler. Duplicates within one layer still fail.
    pub fn compose(&mut self, f: impl FnOnce(&mut Self)) -> &mut Self {
        f(self);
        self.layer += 1;
        self
    }

    /// Declare tagged-union dispatch: frames carry their discriminator in
    /// `tag_field` and the whole object is the handler payload.
    pub fn schema(&mut self, tag_field: &'static str) -> &mut Self {
        self.schema_tag = Some(tag_field);
        self
    }

    /// Attach this resource type's hook collection.
    pub fn hooks(&mut self, hooks: Arc<HookCollection>) -> &mut Self {
        self.hooks = Some(hooks);
        self
    }

    /// Register a nested sub-resource under a path template relative to
    /// this resource.
    pub fn subroute<C, F>(&mut self, path: &str, make: F) -> &mut Self
    where
        C: Resource,
        F: Fn(&FactoryContext<'_>) -> C + Send + Sync + 'static,
    {
        if self.error.is_some() {
            return self;
        }
        let template = match RouteTemplate::parse(path) {
            Ok(template) => template,
            Err(err) => {
                self.error = Some(err);
                return self;
            }
        };
        if self
            .subroutes
            .iter()
            .any(|s| s.template.path() == template.path())
        {
            self.error = Some(DefinitionError::DuplicateSubroute(
                template.path().to_string(),
            ));
            return self;
        }
        let table = match build_table::<C>() {
            Ok(table) => table,
            Err(err) => {
                self.error = Some(err);
                return self;
            }
        };
        let construct: SubrouteFactory = Arc::new(move |ctx: &FactoryContext<'_>| {
            let resource = make(ctx);
            BoxedResource(Box::new(ResourceCell {
                resource,
                table: Arc::clone(&table),
                state: ctx.state.clone(),
            }))
        });
        self.subroutes.push(Subroute {
            template,
            construct,
        });
        self
    }

    fn entry<T>(strict: bool, f: HandlerFn<R, T>) -> HandlerEntry<R>
    where
        T: DeserializeOwned + Send + 'static,
    {
        HandlerEntry {
            invoke: erase(f),
            payload_type: TypeId::of::<T>(),
            payload_name: std::any::type_name::<T>(),
            fields: struct_fields::<T>(),
            strict,
        }
    }

    fn build(self) -> Result<ResourceTable<R>, DefinitionError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.schema_tag.is_some() {
            // Under a schema, one payload type may back at most one handler.
            let mut seen: HashMap<TypeId, String> = HashMap::new();
            let mut tags: Vec<&String> = self.handlers.keys().collect();
            tags.sort();
            for tag in tags {
                let (_, entry) = &self.handlers[tag];
                if entry.fields.is_none() {
                    continue;
                }
                if let Some(first) = seen.insert(entry.payload_type, tag.clone()) {
                    return Err(DefinitionError::DuplicatePayloadType {
                        payload: entry.payload_name,
                        first,
                        second: tag.clone(),
                    });
                }
            }
        }
        Ok(ResourceTable {
            handlers: self
                .handlers
                .into_iter()
                .map(|(tag, (_, entry))| (tag, entry))
                .collect(),
            methods: self
                .methods
                .into_iter()
                .map(|(name, (_, entry))| (name, entry))
                .collect(),
            subroutes: self.subroutes,
            hooks: self.hooks.unwrap_or_default(),
            schema_tag: self.schema_tag,
        })
    }
}

/// The immutable product of [`Resource::configure`], shared by every
/// instance of the resource type created for a given registration.
pub(crate) struct ResourceTable<R> {
    pub(crate) handlers: HashMap<String, HandlerEntry<R>>,
    pub(crate) methods: HashMap<String, HandlerEntry<R>>,
    pub(crate) subroutes: Vec<Subroute>,
    pub(crate) hooks: Arc<HookCollection>,
    pub(crate) schema_tag: Option<&'static str>,
}

impl<R> std::fmt::Debug for ResourceTable<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTable")
            .field("handlers", &self.handlers.len())
            .field("methods", &self.methods.len())
            .field("subroutes", &self.subroutes.len())
            .field("schema_tag", &self.schema_tag)
            .finish()
    }
}

/// Run `R::configure` and freeze the result.
pub(crate) fn build_table<R: Resource>() -> Result<Arc<ResourceTable<R>>, DefinitionError> {
    let mut cfg = ResourceConfig::new();
    R::configure(&mut cfg);
    cfg.build().map(Arc::new)
}

/// Object-safe engine-facing face of a configured resource instance.
#[async_trait]
pub(crate) trait AnyResource: Send {
    async fn connect(
        &mut self,
        req: &ConnectRequest,
        ws: &dyn WsConn,
        params: &Params,
    ) -> Result<bool, BoxError>;
    async fn disconnect(&mut self, ws: &dyn WsConn, close_code: u16);
    async fn dispatch(&mut self, ws: &dyn WsConn, raw: &Bytes) -> Result<(), BoxError>;
    fn hooks(&self) -> Arc<HookCollection>;
    fn subroutes(&self) -> &[Subroute];
    fn child_context(&self) -> ChildContext;
    fn state(&self) -> SharedState;
}

/// A user resource paired with its frozen table and connection state.
pub(crate) struct ResourceCell<R: Resource> {
    pub(crate) resource: R,
    pub(crate) table: Arc<ResourceTable<R>>,
    pub(crate) state: SharedState,
}

#[async_trait]
impl<R: Resource> AnyResource for ResourceCell<R> {
    async fn connect(
        &mut self,
        req: &ConnectRequest,
        ws: &dyn WsConn,
        params: &Params,
    ) -> Result<bool, BoxError> {
        self.resource.on_connect(req, ws, params).await
    }

    async fn disconnect(&mut self, ws: &dyn WsConn, close_code: u16) {
        self.resource.on_disconnect(ws, close_code).await;
    }

    async fn dispatch(&mut self, ws: &dyn WsConn, raw: &Bytes) -> Result<(), BoxError> {
        crate::dispatch::dispatch_cell(self, ws, raw).await
    }

    fn hooks(&self) -> Arc<HookCollection> {
        Arc::clone(&self.table.hooks)
    }

    fn subroutes(&self) -> &[Subroute] {
        &self.table.subroutes
    }

    fn child_context(&self) -> ChildContext {
        self.resource.child_context()
    }

    fn state(&self) -> SharedState {
        self.state.clone()
    }
}

/// An erased, fully-configured resource instance.
pub struct BoxedResource(pub(crate) Box<dyn AnyResource>);

impl BoxedResource {
    /// Erase a resource instance, building its type's table. Useful inside
    /// a custom resource factory; route registration does this for you.
    pub fn new<R: Resource>(resource: R, state: SharedState) -> Result<Self, DefinitionError> {
        let table = build_table::<R>()?;
        Ok(Self(Box::new(ResourceCell {
            resource,
            table,
            state,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Ping {
        #[allow(dead_code)]
        seq: u64,
    }

    #[derive(Deserialize)]
    struct Pong {
        #[allow(dead_code)]
        seq: u64,
    }

    #[derive(Default)]
    struct Probe;

    impl Probe {
        fn on_ping<'a>(&'a mut self, _ws: &'a dyn WsConn, _p: Ping) -> HandlerResult<'a> {
            Box::pin(async move { Ok(()) })
        }

        fn on_pong<'a>(&'a mut self, _ws: &'a dyn WsConn, _p: Pong) -> HandlerResult<'a> {
            Box::pin(async move { Ok(()) })
        }
    }

    impl Resource for Probe {}

    fn fresh_cfg() -> ResourceConfig<Probe> {
        ResourceConfig::new()
    }

    #[test]
    fn duplicate_tag_in_one_layer_fails() {
        let mut cfg = fresh_cfg();
        cfg.handle::<Ping>("ping", Probe::on_ping)
            .handle::<Ping>("ping", Probe::on_ping);
        let err = cfg.build().unwrap_err();
        assert_eq!(err.kind(), "duplicate_handler");
    }

    #[test]
    fn later_layer_overrides_without_error() {
        let mut cfg = fresh_cfg();
        cfg.compose(|cfg| {
            cfg.handle::<Ping>("ping", Probe::on_ping);
        })
        .handle::<Ping>("ping", Probe::on_ping);
        let table = cfg.build().unwrap();
        assert_eq!(table.handlers.len(), 1);
    }

    #[test]
    fn schema_rejects_duplicate_payload_types() {
        let mut cfg = fresh_cfg();
        cfg.schema("type")
            .handle::<Ping>("ping", Probe::on_ping)
            .handle::<Ping>("ping2", Probe::on_ping);
        let err = cfg.build().unwrap_err();
        assert_eq!(err.kind(), "duplicate_payload_type");
    }

    #[test]
    fn distinct_payload_types_pass_schema_validation() {
        let mut cfg = fresh_cfg();
        cfg.schema("type")
            .handle::<Ping>("ping", Probe::on_ping)
            .handle::<Pong>("pong", Probe::on_pong);
        assert!(cfg.build().is_ok());
    }

    #[test]
    fn duplicate_subroute_fails() {
        let mut cfg = fresh_cfg();
        cfg.subroute("child", |_ctx| Probe)
            .subroute("child/", |_ctx| Probe);
        let err = cfg.build().unwrap_err();
        assert_eq!(err.kind(), "duplicate_subroute");
    }

    #[test]
    fn malformed_subroute_template_fails() {
        let mut cfg = fresh_cfg();
        cfg.subroute("{}", |_ctx| Probe);
        assert!(cfg.build().is_err());
    }

    #[test]
    fn first_definition_error_wins() {
        let mut cfg = fresh_cfg();
        cfg.handle::<Ping>("ping", Probe::on_ping)
            .handle::<Ping>("ping", Probe::on_ping)
            .subroute("{}", |_ctx| Probe);
        let err = cfg.build().unwrap_err();
        assert_eq!(err.kind(), "duplicate_handler");
    }

    #[test]
    fn boxed_resource_builds_table() {
        let boxed = BoxedResource::new(Probe, SharedState::new()).unwrap();
        assert!(boxed.0.subroutes().is_empty());
    }

    #[test]
    fn child_context_builder() {
        let state = SharedState::new();
        let ctx = ChildContext::new()
            .with_value("project", serde_json::json!("acme"))
            .with_state(state.clone());
        assert_eq!(ctx.values["project"], serde_json::json!("acme"));
        assert!(ctx.state.unwrap().same_instance(&state));
    }
}
