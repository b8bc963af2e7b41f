//! Shared test doubles for this crate's unit tests.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use manifold_core::error::BoxError;
use manifold_core::transport::WsConn;

/// WebSocket stub that records every call made against it.
#[derive(Default)]
pub(crate) struct RecorderConn {
    accepted: AtomicBool,
    sent: Mutex<Vec<Value>>,
    closed: Mutex<Vec<u16>>,
}

impl RecorderConn {
    pub(crate) fn is_accepted(&self) -> bool {
        self.accepted.load(Ordering::Relaxed)
    }

    pub(crate) fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    pub(crate) fn close_codes(&self) -> Vec<u16> {
        self.closed.lock().clone()
    }
}

#[async_trait]
impl WsConn for RecorderConn {
    async fn accept(&self, _subprotocol: Option<&str>) -> Result<(), BoxError> {
        self.accepted.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self, code: u16) -> Result<(), BoxError> {
        self.closed.lock().push(code);
        Ok(())
    }

    async fn send_media(&self, data: &Value) -> Result<(), BoxError> {
        self.sent.lock().push(data.clone());
        Ok(())
    }
}
