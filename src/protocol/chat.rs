use serde::{Deserialize, Serialize};

/// One attachment riding on a chat message. `type` on the wire is the mime
/// type; inline payloads travel base64-encoded in `data`, server-stored ones
/// as a `url`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaItem {
    pub name: String,
    #[serde(rename = "type")]
    pub mime: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A message as the server stores it, delivered in `message_history` pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub media: Vec<MediaItem>,
    pub created_at: String,
}

/// Frames the chat server pushes. Decoding happens once, at the socket
/// boundary; an unknown `type` fails here instead of falling through handler
/// logic.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    MessageHistory {
        messages: Vec<HistoryMessage>,
        total: u64,
        has_more: bool,
        offset: u64,
    },
    ChatMessage {
        id: String,
        username: String,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        media: Vec<MediaItem>,
        sender_id: String,
        timestamp: String,
    },
    TokenRefreshed {
        access_token: String,
    },
    TokenError {
        #[serde(default)]
        message: Option<String>,
    },
    AuthError {
        #[serde(default)]
        message: Option<String>,
    },
    ConnectionEstablished,
    UserJoin {
        #[serde(default)]
        message: Option<String>,
    },
    UserLeave {
        #[serde(default)]
        message: Option<String>,
    },
}

/// Frames this client sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message {
        message: String,
        username: String,
        media: Vec<MediaItem>,
    },
    FetchMessages {
        limit: u32,
        offset: u64,
    },
    RefreshToken,
}
