//! Per-connection lifecycle: the onion-ordered hook runner and the
//! `Session` object the external receive loop drives.

use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use manifold_core::error::BoxError;
use manifold_core::hooks::{HookCollection, HookContext, HookEvent, HookScope};
use manifold_core::state::{Params, SharedState};
use manifold_core::transport::WsConn;

use crate::resource::BoxedResource;
use crate::router::RouterConfig;

/// Errors surfaced from a session's receive/disconnect lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("message handler failed: {0}")]
    Handler(#[source] BoxError),
    #[error("lifecycle hook failed: {0}")]
    Hook(#[source] BoxError),
}

impl DispatchError {
    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handler(_) => "handler",
            Self::Hook(_) => "hook",
        }
    }
}

/// Runs hooks across the layers of one resolved connection.
///
/// Layers are `[global, root, .., target]`. Before-events run forward, so
/// the outermost registrant observes the first before; after-events run in
/// exact reverse, so it also observes the last after.
pub(crate) struct HookManager {
    global: Arc<HookCollection>,
    layers: Vec<Arc<HookCollection>>,
}

impl HookManager {
    pub(crate) fn new(global: Arc<HookCollection>, layers: Vec<Arc<HookCollection>>) -> Self {
        Self { global, layers }
    }

    /// Run a before-event. The first hook error aborts the chain and
    /// propagates.
    pub(crate) async fn run_before(
        &self,
        event: HookEvent,
        ctx: &mut HookContext,
    ) -> Result<(), BoxError> {
        ctx.event = event;
        ctx.target_depth = self.layers.len().saturating_sub(1);
        ctx.scope = HookScope::Global;
        for hook in self.global.snapshot(event) {
            hook.call(ctx).await?;
        }
        for (depth, layer) in self.layers.iter().enumerate() {
            ctx.scope = HookScope::Resource { depth };
            for hook in layer.snapshot(event) {
                hook.call(ctx).await?;
            }
        }
        ctx.scope = HookScope::Global;
        Ok(())
    }

    /// Run an after-event in reverse layer order.
    ///
    /// Every hook runs even when one fails. If the wrapped operation's
    /// error is attached to `ctx` it always wins (the caller re-raises it)
    /// and hook failures are only logged. Without an operation error, the
    /// first hook failure is returned after the chain completes.
    pub(crate) async fn run_after(
        &self,
        event: HookEvent,
        ctx: &mut HookContext,
    ) -> Result<(), BoxError> {
        ctx.event = event;
        ctx.target_depth = self.layers.len().saturating_sub(1);
        let mut hook_error: Option<BoxError> = None;
        for (depth, layer) in self.layers.iter().enumerate().rev() {
            ctx.scope = HookScope::Resource { depth };
            for hook in layer.snapshot(event) {
                if let Err(err) = hook.call(ctx).await {
                    note_hook_error(ctx, &mut hook_error, err);
                }
            }
        }
        ctx.scope = HookScope::Global;
        for hook in self.global.snapshot(event) {
            if let Err(err) = hook.call(ctx).await {
                note_hook_error(ctx, &mut hook_error, err);
            }
        }
        match hook_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn note_hook_error(ctx: &HookContext, slot: &mut Option<BoxError>, err: BoxError) {
    if ctx.has_error() || slot.is_some() {
        warn!(
            event = %ctx.event,
            error = %err,
            "after-hook failed; keeping earlier error"
        );
    } else {
        *slot = Some(err);
    }
}

pub(crate) async fn close_quietly(ws: &dyn WsConn, code: u16) {
    if let Err(err) = ws.close(code).await {
        tracing::debug!(error = %err, code, "socket close failed");
    }
}

/// One accepted connection: the resolved resource chain plus its hook
/// manager, driven from outside.
///
/// The engine never runs the receive loop: the transport reads frames and
/// feeds them to [`Session::dispatch`], then calls [`Session::disconnect`]
/// when the peer goes away.
pub struct Session {
    chain: Vec<BoxedResource>,
    hooks: HookManager,
    ws: Arc<dyn WsConn>,
    params: Params,
    config: RouterConfig,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("chain", &self.chain.len())
            .field("params", &self.params)
            .field("config", &self.config)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        chain: Vec<BoxedResource>,
        hooks: HookManager,
        ws: Arc<dyn WsConn>,
        params: Params,
        config: RouterConfig,
    ) -> Self {
        Self {
            chain,
            hooks,
            ws,
            params,
            config,
        }
    }

    /// Route parameters captured at connect time, including values injected
    /// by `before_connect` hooks.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// The target resource's shared state.
    pub fn state(&self) -> SharedState {
        self.chain
            .last()
            .map(|resource| resource.0.state())
            .unwrap_or_default()
    }

    /// Number of resources in the chain (1 for an un-nested route).
    pub fn depth(&self) -> usize {
        self.chain.len()
    }

    /// Decode and dispatch one inbound frame on the target resource,
    /// wrapped in `before_receive`/`after_receive` hooks.
    ///
    /// Decode and validation failures are absorbed by the resource's
    /// fallback. Handler and hook errors close the socket and propagate;
    /// after-hooks still run first, observing the error via the context.
    pub async fn dispatch(&mut self, raw: Bytes) -> Result<(), DispatchError> {
        let mut ctx = HookContext::receive(raw.clone());
        if let Err(err) = self.hooks.run_before(HookEvent::BeforeReceive, &mut ctx).await {
            close_quietly(&*self.ws, self.config.error_close_code).await;
            return Err(DispatchError::Hook(err));
        }

        let Some(target) = self.chain.last_mut() else {
            return Ok(());
        };
        match target.0.dispatch(&*self.ws, &raw).await {
            Ok(()) => {
                if let Err(err) = self.hooks.run_after(HookEvent::AfterReceive, &mut ctx).await {
                    close_quietly(&*self.ws, self.config.error_close_code).await;
                    return Err(DispatchError::Hook(err));
                }
                Ok(())
            }
            Err(handler_err) => {
                ctx.attach_error(handler_err);
                let _ = self.hooks.run_after(HookEvent::AfterReceive, &mut ctx).await;
                close_quietly(&*self.ws, self.config.error_close_code).await;
                let original = ctx
                    .take_error()
                    .unwrap_or_else(|| BoxError::from("handler failed"));
                Err(DispatchError::Handler(original))
            }
        }
    }

    /// Run `before_disconnect` hooks, then every resource's
    /// `on_disconnect` from the target up to the root.
    ///
    /// Cleanup always runs; a hook failure is reported afterwards.
    pub async fn disconnect(&mut self, close_code: u16) -> Result<(), DispatchError> {
        let mut ctx = HookContext::disconnect(close_code);
        let hooks_result = self
            .hooks
            .run_before(HookEvent::BeforeDisconnect, &mut ctx)
            .await;
        for resource in self.chain.iter_mut().rev() {
            resource.0.disconnect(&*self.ws, close_code).await;
        }
        hooks_result.map_err(DispatchError::Hook)
    }
}
