use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use chatty_types::events::ChatEvent;

pub type ConnId = Uuid;

/// Room every connection of a user joins on connect.
pub fn user_room(user_id: &str) -> String {
    format!("user:{user_id}")
}

/// Room a connection joins via `joinChat`.
pub fn chat_room(chat_id: &str) -> String {
    format!("chat:{chat_id}")
}

struct Connection {
    user_id: String,
    tx: mpsc::UnboundedSender<ChatEvent>,
}

/// Tracks live connections and their room memberships, and fans events out
/// to rooms.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    /// conn_id -> owning user and outbound channel
    connections: RwLock<HashMap<ConnId, Connection>>,

    /// room name -> member connections
    rooms: RwLock<HashMap<String, HashSet<ConnId>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `user_id` and put it in the user's room.
    /// Returns (conn_id, receiver).
    pub async fn register(&self, user_id: &str) -> (ConnId, mpsc::UnboundedReceiver<ChatEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.connections.write().await.insert(
            conn_id,
            Connection {
                user_id: user_id.to_string(),
                tx,
            },
        );
        self.join(conn_id, &user_room(user_id)).await;
        (conn_id, rx)
    }

    /// Drop the connection and remove it from every room.
    pub async fn unregister(&self, conn_id: ConnId) {
        self.inner.connections.write().await.remove(&conn_id);
        let mut rooms = self.inner.rooms.write().await;
        rooms.retain(|_, members| {
            members.remove(&conn_id);
            !members.is_empty()
        });
    }

    pub async fn join(&self, conn_id: ConnId, room: &str) {
        self.inner
            .rooms
            .write()
            .await
            .entry(room.to_string())
            .or_default()
            .insert(conn_id);
    }

    pub async fn leave(&self, conn_id: ConnId, room: &str) {
        let mut rooms = self.inner.rooms.write().await;
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&conn_id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    /// Remove every connection of `user_id` from `room`.
    pub async fn leave_user(&self, user_id: &str, room: &str) {
        let conns: Vec<ConnId> = self
            .inner
            .connections
            .read()
            .await
            .iter()
            .filter(|(_, c)| c.user_id == user_id)
            .map(|(id, _)| *id)
            .collect();
        for conn_id in conns {
            self.leave(conn_id, room).await;
        }
    }

    /// Forget a room entirely (e.g. the chat was deleted).
    pub async fn close_room(&self, room: &str) {
        self.inner.rooms.write().await.remove(room);
    }

    pub async fn is_member(&self, conn_id: ConnId, room: &str) -> bool {
        self.inner
            .rooms
            .read()
            .await
            .get(room)
            .is_some_and(|members| members.contains(&conn_id))
    }

    pub async fn room_size(&self, room: &str) -> usize {
        self.inner.rooms.read().await.get(room).map_or(0, HashSet::len)
    }

    /// Send an event to every connection in the room.
    pub async fn emit(&self, room: &str, event: ChatEvent) {
        self.emit_filtered(room, None, event).await;
    }

    /// Send an event to every connection in the room except `except`.
    pub async fn emit_except(&self, room: &str, except: ConnId, event: ChatEvent) {
        self.emit_filtered(room, Some(except), event).await;
    }

    /// Targeted event to all of a user's connections.
    pub async fn emit_to_user(&self, user_id: &str, event: ChatEvent) {
        self.emit(&user_room(user_id), event).await;
    }

    /// Event to a single connection, regardless of rooms.
    pub async fn emit_to_conn(&self, conn_id: ConnId, event: ChatEvent) {
        if let Some(conn) = self.inner.connections.read().await.get(&conn_id) {
            let _ = conn.tx.send(event);
        }
    }

    async fn emit_filtered(&self, room: &str, except: Option<ConnId>, event: ChatEvent) {
        let members: Vec<ConnId> = match self.inner.rooms.read().await.get(room) {
            Some(members) => members.iter().copied().collect(),
            None => return,
        };
        let connections = self.inner.connections.read().await;
        for conn_id in members {
            if Some(conn_id) == except {
                continue;
            }
            if let Some(conn) = connections.get(&conn_id) {
                // Receiver gone means the connection is shutting down.
                let _ = conn.tx.send(event.clone());
            }
        }
    }
}
