//! Storage backends for connection and room membership state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use manifold_core::transport::WsConn;

use crate::manager::{ConnectionId, RoomsError};

/// Storage behind the connection manager.
///
/// The in-process default suits a single process; a distributed
/// implementation can replace it without changing manager call sites.
/// Implementations must keep the connection and room maps mutually
/// consistent and serve `snapshot` from one consistent view.
#[async_trait]
pub trait ConnectionBackend: Send + Sync {
    /// Register a connection. Duplicate ids fail.
    async fn add(&self, id: ConnectionId, conn: Arc<dyn WsConn>) -> Result<(), RoomsError>;

    /// Deregister a connection, purging it from every room. Rooms left
    /// empty are deleted. Unknown ids are a no-op.
    async fn remove(&self, id: &ConnectionId);

    /// Add a connection to a room. Unknown connection ids fail.
    async fn join(&self, id: &ConnectionId, room: &str) -> Result<(), RoomsError>;

    /// Remove a connection from a room. Unknown rooms or non-members are
    /// a silent no-op.
    async fn leave(&self, id: &ConnectionId, room: &str);

    /// Look up a single connection.
    async fn get(&self, id: &ConnectionId) -> Option<Arc<dyn WsConn>>;

    /// A consistent snapshot of (id, socket) pairs, optionally filtered to
    /// one room. An unknown room yields an empty snapshot.
    async fn snapshot(&self, room: Option<&str>) -> Vec<(ConnectionId, Arc<dyn WsConn>)>;

    /// Ids of all live connections.
    async fn connection_ids(&self) -> Vec<ConnectionId>;

    /// Names of all non-empty rooms.
    async fn rooms(&self) -> Vec<String>;
}

#[derive(Default)]
struct BackendState {
    connections: HashMap<ConnectionId, Arc<dyn WsConn>>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

/// The default backend: both maps behind one cooperative lock, so
/// concurrent tasks never observe a half-applied membership edit.
#[derive(Default)]
pub struct InProcessBackend {
    state: Mutex<BackendState>,
}

impl InProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionBackend for InProcessBackend {
    async fn add(&self, id: ConnectionId, conn: Arc<dyn WsConn>) -> Result<(), RoomsError> {
        let mut state = self.state.lock().await;
        if state.connections.contains_key(&id) {
            return Err(RoomsError::DuplicateConnection(id));
        }
        state.connections.insert(id, conn);
        Ok(())
    }

    async fn remove(&self, id: &ConnectionId) {
        let mut state = self.state.lock().await;
        state.connections.remove(id);
        state.rooms.retain(|_, members| {
            members.remove(id);
            !members.is_empty()
        });
    }

    async fn join(&self, id: &ConnectionId, room: &str) -> Result<(), RoomsError> {
        let mut state = self.state.lock().await;
        if !state.connections.contains_key(id) {
            return Err(RoomsError::ConnectionNotFound(id.clone()));
        }
        state
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(id.clone());
        Ok(())
    }

    async fn leave(&self, id: &ConnectionId, room: &str) {
        let mut state = self.state.lock().await;
        let emptied = match state.rooms.get_mut(room) {
            Some(members) => {
                members.remove(id);
                members.is_empty()
            }
            None => false,
        };
        if emptied {
            state.rooms.remove(room);
        }
    }

    async fn get(&self, id: &ConnectionId) -> Option<Arc<dyn WsConn>> {
        self.state.lock().await.connections.get(id).cloned()
    }

    async fn snapshot(&self, room: Option<&str>) -> Vec<(ConnectionId, Arc<dyn WsConn>)> {
        let state = self.state.lock().await;
        match room {
            None => state
                .connections
                .iter()
                .map(|(id, conn)| (id.clone(), Arc::clone(conn)))
                .collect(),
            Some(room) => match state.rooms.get(room) {
                None => Vec::new(),
                Some(members) => members
                    .iter()
                    .filter_map(|id| {
                        state
                            .connections
                            .get(id)
                            .map(|conn| (id.clone(), Arc::clone(conn)))
                    })
                    .collect(),
            },
        }
    }

    async fn connection_ids(&self) -> Vec<ConnectionId> {
        self.state.lock().await.connections.keys().cloned().collect()
    }

    async fn rooms(&self) -> Vec<String> {
        self.state.lock().await.rooms.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::DummyConn;

    #[tokio::test]
    async fn add_and_duplicate() {
        let backend = InProcessBackend::new();
        let id = ConnectionId::from("a");
        backend.add(id.clone(), Arc::new(DummyConn::default())).await.unwrap();

        let err = backend
            .add(id.clone(), Arc::new(DummyConn::default()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "duplicate_connection");
    }

    #[tokio::test]
    async fn remove_purges_rooms_and_prunes_empties() {
        let backend = InProcessBackend::new();
        let a = ConnectionId::from("a");
        let b = ConnectionId::from("b");
        backend.add(a.clone(), Arc::new(DummyConn::default())).await.unwrap();
        backend.add(b.clone(), Arc::new(DummyConn::default())).await.unwrap();
        backend.join(&a, "lobby").await.unwrap();
        backend.join(&b, "lobby").await.unwrap();
        backend.join(&a, "solo").await.unwrap();

        backend.remove(&a).await;

        let rooms = backend.rooms().await;
        assert_eq!(rooms, vec!["lobby".to_string()]);
        assert!(backend.get(&a).await.is_none());
        assert_eq!(backend.snapshot(Some("lobby")).await.len(), 1);
    }

    #[tokio::test]
    async fn join_unknown_connection_fails() {
        let backend = InProcessBackend::new();
        let err = backend
            .join(&ConnectionId::from("ghost"), "lobby")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "connection_not_found");
    }

    #[tokio::test]
    async fn leave_unknown_room_or_member_is_silent() {
        let backend = InProcessBackend::new();
        let a = ConnectionId::from("a");
        backend.add(a.clone(), Arc::new(DummyConn::default())).await.unwrap();

        backend.leave(&a, "ghost-room").await;
        backend.join(&a, "lobby").await.unwrap();
        backend.leave(&ConnectionId::from("other"), "lobby").await;

        assert_eq!(backend.rooms().await, vec!["lobby".to_string()]);
    }

    #[tokio::test]
    async fn leaving_last_member_prunes_the_room() {
        let backend = InProcessBackend::new();
        let a = ConnectionId::from("a");
        backend.add(a.clone(), Arc::new(DummyConn::default())).await.unwrap();
        backend.join(&a, "lobby").await.unwrap();

        backend.leave(&a, "lobby").await;
        assert!(backend.rooms().await.is_empty());
    }

    #[tokio::test]
    async fn snapshot_unknown_room_is_empty() {
        let backend = InProcessBackend::new();
        assert!(backend.snapshot(Some("ghost")).await.is_empty());
    }
}
