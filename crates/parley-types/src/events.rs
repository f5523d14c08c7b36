use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::MessageResponse;

/// Events sent from the server over the WebSocket gateway.
///
/// These are notifications only — the message store is the durable record.
/// A client may receive the same message both here and in its own send
/// response; consumers deduplicate by message id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// A message was durably stored
    NewMessage { message: MessageResponse },

    /// Another connection joined a room this client is in
    UserJoined {
        user_id: Uuid,
        username: String,
        room_id: String,
    },

    /// Another connection left a room this client is in
    UserLeft {
        user_id: Uuid,
        username: String,
        room_id: String,
    },

    UserTyping {
        user_id: Uuid,
        username: String,
        room_id: String,
    },

    UserStoppedTyping {
        user_id: Uuid,
        username: String,
        room_id: String,
    },

    /// A user's first connection came up
    UserOnline { user_id: Uuid, username: String },

    /// A user's last connection went away
    UserOffline { user_id: Uuid, username: String },

    /// Connection-level failure surfaced to the client
    Error { message: String },
}

/// Commands sent from client to server over the WebSocket.
///
/// There is deliberately no send-message command: messages are written over
/// HTTP and the server broadcasts `newMessage` after the durable write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum GatewayCommand {
    /// Authenticate the connection with a bearer token
    Identify { token: String },

    /// Subscribe to a room (a conversation id)
    JoinRoom { room_id: String },

    /// Unsubscribe from one room; other memberships are unaffected
    LeaveRoom { room_id: String },

    /// Typing indicator, addressed by conversation id or peer user id
    Typing {
        #[serde(default)]
        chat_id: Option<String>,
        #[serde(default)]
        to: Option<Uuid>,
    },

    StopTyping {
        #[serde(default)]
        chat_id: Option<String>,
        #[serde(default)]
        to: Option<Uuid>,
    },
}
