use serde::{Deserialize, Serialize};

use crate::models::{Chat, ChatMessage};

/// Events sent over the socket, server to client.
/// Wire form: `{"event": "<name>", "data": <payload>}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ChatEvent {
    /// Handshake accepted
    Connected,

    /// Handshake or command failure; carries a human readable reason
    SocketError(String),

    /// Someone in the chat room started typing (payload: chat id)
    Typing(String),

    /// Someone in the chat room stopped typing (payload: chat id)
    StopTyping(String),

    MessageReceived(ChatMessage),

    MessageDeleted(ChatMessage),

    /// The recipient was added to a chat
    NewChat(Chat),

    /// The recipient left, was removed from, or lost a chat
    LeaveChat(Chat),

    UpdateGroupName(Chat),
}

impl ChatEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::SocketError(_) => "socketError",
            Self::Typing(_) => "typing",
            Self::StopTyping(_) => "stopTyping",
            Self::MessageReceived(_) => "messageReceived",
            Self::MessageDeleted(_) => "messageDeleted",
            Self::NewChat(_) => "newChat",
            Self::LeaveChat(_) => "leaveChat",
            Self::UpdateGroupName(_) => "updateGroupName",
        }
    }
}

/// Commands sent FROM client TO server over the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientCommand {
    /// Subscribe this connection to a chat room (payload: chat id)
    JoinChat(String),

    Typing(String),

    StopTyping(String),
}
