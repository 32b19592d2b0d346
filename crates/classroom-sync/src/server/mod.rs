use axum::{
    extract::{Path, State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{Action, ChannelMessage};
use crate::{SyncError, SyncResult};

pub mod classroom;
pub mod handler;

pub use classroom::{Classroom, Delivery, Member};
pub use handler::WebSocketHandler;

/// Axum state for the classroom relay
#[derive(Clone)]
pub struct RelayState {
    classrooms: Arc<ClassroomRegistry>,
    connections: Arc<ConnectionManager>,
}

impl RelayState {
    pub fn new(classrooms: Arc<ClassroomRegistry>) -> Self {
        Self {
            classrooms,
            connections: Arc::new(ConnectionManager::new()),
        }
    }

    pub fn classrooms(&self) -> &Arc<ClassroomRegistry> {
        &self.classrooms
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Send every delivery to its connection
    pub async fn deliver(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            self.connections
                .send_to_connection(&delivery.connection_id, delivery.message)
                .await;
        }
    }
}

/// Classrooms known to the relay, keyed by classroom id
pub struct ClassroomRegistry {
    classrooms: DashMap<String, Classroom>,
}

impl ClassroomRegistry {
    pub fn new() -> Self {
        Self {
            classrooms: DashMap::new(),
        }
    }

    pub fn contains(&self, classroom_id: &str) -> bool {
        self.classrooms.contains_key(classroom_id)
    }

    /// Drop the classroom once it is deleted or nobody is connected
    ///
    /// Returns true if it was removed.
    fn close_if_idle(&self, classroom_id: &str) -> bool {
        let removed = self
            .classrooms
            .remove_if(classroom_id, |_, classroom| {
                classroom.is_deleted() || !classroom.has_online_members()
            })
            .is_some();
        if removed {
            tracing::info!("Closed classroom '{}'", classroom_id);
        }
        removed
    }

    pub fn classroom_count(&self) -> usize {
        self.classrooms.len()
    }

    /// Read a classroom's state
    pub fn with_classroom<R>(&self, classroom_id: &str, f: impl FnOnce(&Classroom) -> R) -> Option<R> {
        self.classrooms.get(classroom_id).map(|classroom| f(&classroom))
    }

    /// Route one message through a classroom
    ///
    /// A join opens the classroom if needed, any other action requires it to
    /// exist. A classroom left deleted or empty is dropped from the registry.
    pub fn dispatch(
        &self,
        classroom_id: &str,
        connection_id: &str,
        message: ChannelMessage,
    ) -> SyncResult<Vec<Delivery>> {
        let result = {
            let mut classroom = match message.action {
                Action::Join | Action::TeacherJoin => self
                    .classrooms
                    .entry(classroom_id.to_string())
                    .or_insert_with(|| {
                        tracing::info!("Opened classroom '{}'", classroom_id);
                        Classroom::new(classroom_id)
                    }),
                _ => self.classrooms.get_mut(classroom_id).ok_or_else(|| {
                    SyncError::ClassroomNotFound {
                        id: classroom_id.to_string(),
                    }
                })?,
            };
            classroom.handle(connection_id, message)
        };

        self.close_if_idle(classroom_id);
        result
    }

    /// Forget a connection, returns the LEAVE notifications to send
    pub fn disconnect(&self, classroom_id: &str, connection_id: &str) -> Vec<Delivery> {
        let departures = self
            .classrooms
            .get_mut(classroom_id)
            .map(|mut classroom| classroom.disconnect(connection_id))
            .unwrap_or_default();
        self.close_if_idle(classroom_id);
        departures
    }
}

impl Default for ClassroomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Manages connected WebSocket clients
pub struct ConnectionManager {
    connections: RwLock<HashMap<String, ConnectionInfo>>,
}

/// Information about a connected client
pub struct ConnectionInfo {
    pub id: String,
    pub classroom_id: String,
    pub sender: mpsc::UnboundedSender<ChannelMessage>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new connection to `classroom_id`
    pub async fn register_connection(
        &self,
        classroom_id: &str,
        sender: mpsc::UnboundedSender<ChannelMessage>,
    ) -> String {
        let connection_id = Uuid::new_v4().to_string();
        let info = ConnectionInfo {
            id: connection_id.clone(),
            classroom_id: classroom_id.to_string(),
            sender,
        };

        self.connections
            .write()
            .await
            .insert(connection_id.clone(), info);
        tracing::info!(
            "Registered connection {} for classroom '{}'",
            connection_id,
            classroom_id
        );
        connection_id
    }

    pub async fn unregister_connection(&self, connection_id: &str) {
        self.connections.write().await.remove(connection_id);
        tracing::info!("Unregistered connection: {}", connection_id);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Send a message to a specific connection
    pub async fn send_to_connection(&self, connection_id: &str, message: ChannelMessage) {
        let connections = self.connections.read().await;
        if let Some(info) = connections.get(connection_id) {
            if info.sender.send(message).is_err() {
                tracing::warn!("Failed to send message to connection {}", connection_id);
            }
        }
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a router with the classroom WebSocket endpoint
pub fn router_with_relay(classrooms: Arc<ClassroomRegistry>) -> Router {
    let state = RelayState::new(classrooms);
    router_with_relay_state(state.clone()).with_state(state)
}

/// Create a router with the classroom WebSocket endpoint using an existing state
///
/// Share the state with any extra routes so they see the same classrooms and
/// connections.
pub fn router_with_relay_state(state: RelayState) -> Router<RelayState> {
    Router::new()
        .route("/ws/{classroom_id}", get(websocket_handler))
        .with_state(state)
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(classroom_id): Path<String>,
    State(state): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| WebSocketHandler::new(socket, state, classroom_id).handle())
}
