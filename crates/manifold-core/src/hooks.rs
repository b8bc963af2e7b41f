//! Lifecycle hook primitives: the event vocabulary, the per-operation
//! context record, and the scope-local hook registry.
//!
//! Hooks wrap connect, receive, and disconnect in onion order: before-hooks
//! run outer-to-inner (router-global first, target resource last), the
//! matching after-hooks unwind in exact reverse. The chain executor lives
//! with the router; this module only defines the pieces it runs.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::BoxError;
use crate::state::Params;

/// Supported lifecycle events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookEvent {
    BeforeConnect,
    AfterConnect,
    BeforeReceive,
    AfterReceive,
    BeforeDisconnect,
}

impl HookEvent {
    pub const ALL: [HookEvent; 5] = [
        HookEvent::BeforeConnect,
        HookEvent::AfterConnect,
        HookEvent::BeforeReceive,
        HookEvent::AfterReceive,
        HookEvent::BeforeDisconnect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeConnect => "before_connect",
            Self::AfterConnect => "after_connect",
            Self::BeforeReceive => "before_receive",
            Self::AfterReceive => "after_receive",
            Self::BeforeDisconnect => "before_disconnect",
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for a hook event name outside the supported set.
#[derive(Debug, thiserror::Error)]
#[error("unsupported hook event: {0:?}")]
pub struct UnsupportedHookEvent(pub String);

impl FromStr for HookEvent {
    type Err = UnsupportedHookEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookEvent::ALL
            .iter()
            .copied()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| UnsupportedHookEvent(s.to_string()))
    }
}

/// Which layer of a resource chain is currently executing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookScope {
    /// Router-level hooks, outside any resource.
    Global,
    /// Hooks of the resource at `depth` in the chain (0 = root; the target
    /// sits at the deepest depth).
    Resource { depth: usize },
}

/// Mutable record threaded through one full hook-wrapped operation.
///
/// Created fresh per connect, per received frame, or per disconnect; the
/// `event` field advances from the before-event to the matching after-event
/// as the chain unwinds.
#[derive(Debug)]
pub struct HookContext {
    pub event: HookEvent,
    /// Layer currently executing; maintained by the chain runner.
    pub scope: HookScope,
    /// Depth of the innermost (target) resource; maintained by the runner.
    pub target_depth: usize,
    /// Route parameters. `before_connect` hooks may inject defaults here
    /// and both `on_connect` and every later hook will observe them.
    pub params: Params,
    /// Raw frame for receive events.
    pub raw: Option<Bytes>,
    /// Boolean outcome of `on_connect`, present on `after_connect`.
    pub result: Option<bool>,
    /// Close code for disconnect events.
    pub close_code: Option<u16>,
    error: Option<BoxError>,
}

impl HookContext {
    pub fn connect(params: Params) -> Self {
        Self {
            event: HookEvent::BeforeConnect,
            scope: HookScope::Global,
            target_depth: 0,
            params,
            raw: None,
            result: None,
            close_code: None,
            error: None,
        }
    }

    pub fn receive(raw: Bytes) -> Self {
        Self {
            event: HookEvent::BeforeReceive,
            scope: HookScope::Global,
            target_depth: 0,
            params: Params::new(),
            raw: Some(raw),
            result: None,
            close_code: None,
            error: None,
        }
    }

    pub fn disconnect(close_code: u16) -> Self {
        Self {
            event: HookEvent::BeforeDisconnect,
            scope: HookScope::Global,
            target_depth: 0,
            params: Params::new(),
            raw: None,
            result: None,
            close_code: Some(close_code),
            error: None,
        }
    }

    /// The error raised by the wrapped operation, if any. After-hooks can
    /// observe it but never remove it; the chain runner re-raises it once
    /// the chain completes.
    pub fn error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.error.as_deref()
    }

    /// Attach the wrapped operation's error. For use by the chain runner.
    pub fn attach_error(&mut self, error: BoxError) {
        self.error = Some(error);
    }

    /// Take back the attached error. For use by the chain runner.
    pub fn take_error(&mut self) -> Option<BoxError> {
        self.error.take()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A lifecycle callback. Errors propagate to the connection lifecycle the
/// hook wraps, so observational hooks should swallow their own failures.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn call(&self, ctx: &mut HookContext) -> Result<(), BoxError>;
}

struct FnHook<F>(F);

#[async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(&mut HookContext) + Send + Sync,
{
    async fn call(&self, ctx: &mut HookContext) -> Result<(), BoxError> {
        (self.0)(ctx);
        Ok(())
    }
}

/// Adapt a synchronous closure into a [`Hook`]. Async hooks implement the
/// trait directly.
pub fn hook_fn<F>(f: F) -> Arc<dyn Hook>
where
    F: Fn(&mut HookContext) + Send + Sync + 'static,
{
    Arc::new(FnHook(f))
}

/// Ordered lifecycle hooks registered at one scope (router-global or one
/// resource), optionally chained to a parent collection.
#[derive(Default)]
pub struct HookCollection {
    parent: Option<Arc<HookCollection>>,
    registry: RwLock<HashMap<HookEvent, Vec<Arc<dyn Hook>>>>,
}

impl HookCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new collection whose iteration yields `parent`'s hooks first.
    ///
    /// Chaining is live, not a snapshot: hooks added to the parent after
    /// this call are still seen by the child.
    pub fn inherit(parent: &Arc<HookCollection>) -> Self {
        Self {
            parent: Some(Arc::clone(parent)),
            registry: RwLock::new(HashMap::new()),
        }
    }

    /// Register `hook` for `event`, after any hooks already registered at
    /// this scope.
    pub fn add(&self, event: HookEvent, hook: Arc<dyn Hook>) {
        self.registry.write().entry(event).or_default().push(hook);
    }

    /// Register a synchronous closure for `event`.
    pub fn add_fn<F>(&self, event: HookEvent, f: F)
    where
        F: Fn(&mut HookContext) + Send + Sync + 'static,
    {
        self.add(event, hook_fn(f));
    }

    /// The hooks for `event`: parent chain first, then this collection's
    /// own, each in registration order. Snapshot at call time.
    pub fn snapshot(&self, event: HookEvent) -> Vec<Arc<dyn Hook>> {
        let mut hooks = match &self.parent {
            Some(parent) => parent.snapshot(event),
            None => Vec::new(),
        };
        if let Some(own) = self.registry.read().get(&event) {
            hooks.extend(own.iter().cloned());
        }
        hooks
    }

    /// Number of hooks visible for `event`, including the parent chain.
    pub fn len(&self, event: HookEvent) -> usize {
        let own = self.registry.read().get(&event).map_or(0, Vec::len);
        let inherited = self.parent.as_ref().map_or(0, |p| p.len(event));
        own + inherited
    }

    pub fn is_empty(&self, event: HookEvent) -> bool {
        self.len(event) == 0
    }
}
