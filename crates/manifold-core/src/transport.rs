use async_trait::async_trait;
use serde_json::Value;

use crate::error::BoxError;

/// Close code for a normal shutdown, also used when `on_connect` declines.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code reported when the engine fails mid-lifecycle.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Minimal interface for an already-handshaken WebSocket connection.
///
/// The host transport implements this in production; tests use a recorder.
/// The engine never runs the receive loop itself; the external caller
/// reads frames and feeds them into the session's dispatch.
#[async_trait]
pub trait WsConn: Send + Sync {
    /// Accept the WebSocket handshake.
    async fn accept(&self, subprotocol: Option<&str>) -> Result<(), BoxError>;

    /// Close the connection with the given close code.
    async fn close(&self, code: u16) -> Result<(), BoxError>;

    /// Send structured data over the connection.
    async fn send_media(&self, data: &Value) -> Result<(), BoxError>;
}
