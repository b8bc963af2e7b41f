//! Connection/room tracking with targeted send and room broadcast.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, Stream};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use manifold_core::error::BoxError;
use manifold_core::transport::WsConn;

use crate::backend::{ConnectionBackend, InProcessBackend};

/// Unique connection identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// A fresh, time-ordered id.
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Errors from connection and room operations.
#[derive(Debug, thiserror::Error)]
pub enum RoomsError {
    #[error("connection already registered: {0}")]
    DuplicateConnection(ConnectionId),
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),
    #[error("send to {id} failed: {source}")]
    Send {
        id: ConnectionId,
        #[source]
        source: BoxError,
    },
    #[error("broadcast failed for {} of {total} connections", failures.len())]
    Broadcast {
        total: usize,
        failures: Vec<(ConnectionId, BoxError)>,
    },
}

impl RoomsError {
    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateConnection(_) => "duplicate_connection",
            Self::ConnectionNotFound(_) => "connection_not_found",
            Self::Send { .. } => "send",
            Self::Broadcast { .. } => "broadcast",
        }
    }
}

/// Tracks live connections and their room memberships, delivering targeted
/// and room-wide messages.
///
/// Constructed once and shared by reference with whatever needs it; all
/// cross-task state lives behind the backend's lock.
pub struct ConnectionManager {
    backend: Arc<dyn ConnectionBackend>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    /// A manager over the in-process backend.
    pub fn new() -> Self {
        Self::with_backend(Arc::new(InProcessBackend::new()))
    }

    /// A manager over a custom backend.
    pub fn with_backend(backend: Arc<dyn ConnectionBackend>) -> Self {
        Self { backend }
    }

    /// Register a connection. Duplicate ids fail.
    pub async fn add_connection(
        &self,
        id: impl Into<ConnectionId>,
        conn: Arc<dyn WsConn>,
    ) -> Result<(), RoomsError> {
        self.backend.add(id.into(), conn).await
    }

    /// Deregister a connection and purge it from every room.
    pub async fn remove_connection(&self, id: &ConnectionId) {
        self.backend.remove(id).await;
    }

    /// Add a connection to a room. Unknown connection ids fail.
    pub async fn join_room(&self, id: &ConnectionId, room: &str) -> Result<(), RoomsError> {
        self.backend.join(id, room).await
    }

    /// Remove a connection from a room; silently ignores unknown rooms and
    /// non-members.
    pub async fn leave_room(&self, id: &ConnectionId, room: &str) {
        self.backend.leave(id, room).await;
    }

    /// Send `data` to one connection. Unknown ids fail with a not-found
    /// error; transport failures propagate.
    pub async fn send_to_connection(
        &self,
        id: &ConnectionId,
        data: &Value,
    ) -> Result<(), RoomsError> {
        let conn = self
            .backend
            .get(id)
            .await
            .ok_or_else(|| RoomsError::ConnectionNotFound(id.clone()))?;
        conn.send_media(data).await.map_err(|source| RoomsError::Send {
            id: id.clone(),
            source,
        })
    }

    /// Send `data` to every member of `room` except `exclude`.
    ///
    /// Membership is snapshotted before any send, then all sends run
    /// concurrently against that frozen view. A single failure is returned
    /// directly; multiple concurrent failures are aggregated, none dropped.
    pub async fn broadcast_to_room(
        &self,
        room: &str,
        data: &Value,
        exclude: &HashSet<ConnectionId>,
    ) -> Result<(), RoomsError> {
        let members: Vec<(ConnectionId, Arc<dyn WsConn>)> = self
            .backend
            .snapshot(Some(room))
            .await
            .into_iter()
            .filter(|(id, _)| !exclude.contains(id))
            .collect();
        let total = members.len();

        let sends = members.into_iter().map(|(id, conn)| async move {
            let result = conn.send_media(data).await;
            (id, result)
        });
        let mut failures: Vec<(ConnectionId, BoxError)> = futures::future::join_all(sends)
            .await
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|err| (id, err)))
            .collect();

        match failures.len() {
            0 => Ok(()),
            1 => {
                let (id, source) = failures.remove(0);
                Err(RoomsError::Send { id, source })
            }
            n => {
                warn!(room, failed = n, total, "broadcast partially failed");
                Err(RoomsError::Broadcast { total, failures })
            }
        }
    }

    /// A lazy, one-shot sequence of live sockets matching the filter,
    /// frozen to the membership at call time.
    pub async fn connections(
        &self,
        room: Option<&str>,
        exclude: &HashSet<ConnectionId>,
    ) -> impl Stream<Item = Arc<dyn WsConn>> {
        let members: Vec<Arc<dyn WsConn>> = self
            .backend
            .snapshot(room)
            .await
            .into_iter()
            .filter(|(id, _)| !exclude.contains(id))
            .map(|(_, conn)| conn)
            .collect();
        stream::iter(members)
    }

    /// Ids of all live connections.
    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        self.backend.connection_ids().await
    }

    /// Names of all non-empty rooms.
    pub async fn rooms(&self) -> Vec<String> {
        self.backend.rooms().await
    }
}
