pub mod upload;

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::auth::CredentialStore;
use crate::config::Config;
use crate::protocol::chat::{ClientFrame, HistoryMessage, MediaItem, ServerFrame};

mod error;
pub use error::ChatError;

/// Page size for history pagination requests.
pub const PAGE_SIZE: u32 = 20;
/// Socket establishment is time-boxed; a stalled upgrade surfaces as a failure
/// instead of hanging the room view.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Window within which an echoed copy of an own message is considered the
/// same message even under a different id.
pub const DEDUP_WINDOW: time::Duration = time::Duration::seconds(2);

/// Application close codes the server uses to signal authentication failure.
const AUTH_CLOSE_CODES: [u16; 2] = [4000, 4001];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// A message as the room view renders it.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub username: String,
    pub body: Option<String>,
    pub media: Vec<MediaItem>,
    pub timestamp: OffsetDateTime,
}

impl ChatMessage {
    /// Readable wall-clock label for the message list.
    pub fn time_label(&self) -> String {
        let t = self.timestamp;
        format!("{:02}:{:02}:{:02}", t.hour(), t.minute(), t.second())
    }

    fn from_history(raw: HistoryMessage) -> Self {
        Self {
            id: raw.id,
            sender_id: raw.sender_id,
            username: raw.sender_name,
            body: raw.message,
            media: raw.media,
            timestamp: parse_timestamp(&raw.created_at),
        }
    }
}

fn parse_timestamp(raw: &str) -> OffsetDateTime {
    OffsetDateTime::parse(raw, &Rfc3339).unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// State changes the UI layer subscribes to.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Connected,
    Disconnected { code: Option<u16> },
    MessageReceived(ChatMessage),
    HistoryLoaded { count: usize },
    TokenExpired,
}

struct ChatState {
    connection: ConnectionState,
    messages: Vec<ChatMessage>,
    token_expired: bool,
    is_loading_more: bool,
    has_more: bool,
    total: u64,
    offset: u64,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    reader: Option<tokio::task::JoinHandle<()>>,
    writer: Option<tokio::task::JoinHandle<()>>,
}

impl ChatState {
    fn new() -> Self {
        Self {
            connection: ConnectionState::Idle,
            messages: Vec::new(),
            token_expired: false,
            is_loading_more: false,
            has_more: true,
            total: 0,
            offset: 0,
            generation: 0,
            outbound: None,
            reader: None,
            writer: None,
        }
    }

    /// Drop the current socket, if any. Tasks are aborted rather than joined;
    /// the generation counter makes any of their late callbacks inert.
    fn close_socket(&mut self) {
        self.outbound = None;
        if let Some(task) = self.reader.take() {
            task.abort();
        }
        if let Some(task) = self.writer.take() {
            task.abort();
        }
    }

    /// Apply one `message_history` page. Offset zero replaces the list; any
    /// other offset prepends the (older) page. Returns the page length.
    fn apply_history(&mut self, page: Vec<ChatMessage>, total: u64, has_more: bool, offset: u64) -> usize {
        let count = page.len();
        if offset == 0 {
            self.messages = page;
        } else {
            let mut merged = page;
            merged.append(&mut self.messages);
            self.messages = merged;
        }
        self.total = total;
        self.has_more = has_more;
        self.offset = offset + count as u64;
        self.is_loading_more = false;
        count
    }
}

/// True when `candidate` duplicates an existing entry: same id, or the same
/// sender and body within the dedup window. The fuzzy arm exists because a
/// sender sees its own message echoed back under a server-assigned id.
fn is_duplicate(existing: &[ChatMessage], candidate: &ChatMessage) -> bool {
    existing.iter().any(|m| {
        m.id == candidate.id
            || (m.sender_id == candidate.sender_id
                && m.body == candidate.body
                && (m.timestamp - candidate.timestamp).abs() < DEDUP_WINDOW)
    })
}

struct ChatInner {
    config: Config,
    credentials: CredentialStore,
    room_id: String,
    user_id: String,
    username: String,
    state: Mutex<ChatState>,
    events: mpsc::UnboundedSender<ChatEvent>,
    auth_failures: Mutex<Option<mpsc::UnboundedSender<()>>>,
}

/// One chat room session owning at most one live WebSocket.
///
/// Cheap to clone; clones share the session. The socket is (re)opened with
/// [`ChatSession::connect`] and every later `connect` closes the previous
/// socket before opening the next one.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<ChatInner>,
}

impl ChatSession {
    pub fn new(
        config: Config,
        credentials: CredentialStore,
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        username: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            inner: Arc::new(ChatInner {
                config,
                credentials,
                room_id: room_id.into(),
                user_id: user_id.into(),
                username: username.into(),
                state: Mutex::new(ChatState::new()),
                events,
                auth_failures: Mutex::new(None),
            }),
        };
        (session, events_rx)
    }

    /// Open the room socket with the current credential. A missing token is a
    /// logged no-op, not an error: the refresh coordinator will reconnect once
    /// a token exists.
    pub async fn connect(&self) -> Result<(), ChatError> {
        let Some(token) = self.inner.credentials.current() else {
            tracing::warn!(target: "televisit::chat", room = %self.inner.room_id, "no token available, skipping connect");
            return Ok(());
        };

        let generation = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.close_socket();
            state.connection = ConnectionState::Connecting;
            state.generation
        };

        let url = self.inner.config.chat_socket_url(&self.inner.room_id, &token);
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&url)).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(err)) => {
                self.mark_connect_failed(generation);
                return Err(ChatError::Socket(err));
            }
            Err(_) => {
                self.mark_connect_failed(generation);
                return Err(ChatError::ConnectTimeout);
            }
        };

        let (mut ws_write, mut ws_read) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let session = self.clone();
        let reader = tokio::spawn(async move {
            let mut close_code = None;
            while let Some(message) = ws_read.next().await {
                match message {
                    Ok(Message::Text(text)) => session.handle_frame(generation, &text),
                    Ok(Message::Close(frame)) => {
                        close_code = frame.map(|f| u16::from(f.code));
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(target: "televisit::chat", error = %err, "socket read failed");
                        break;
                    }
                }
            }
            session.handle_closed(generation, close_code);
        });

        {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                // A newer connect raced us; this socket is already obsolete.
                reader.abort();
                writer.abort();
                return Ok(());
            }
            state.outbound = Some(outbound);
            state.reader = Some(reader);
            state.writer = Some(writer);
            state.connection = ConnectionState::Open;
            state.token_expired = false;
        }
        tracing::info!(target: "televisit::chat", room = %self.inner.room_id, "chat socket connected");
        let _ = self.inner.events.send(ChatEvent::Connected);
        Ok(())
    }

    fn mark_connect_failed(&self, generation: u64) {
        let mut state = self.inner.state.lock();
        if state.generation == generation {
            state.connection = ConnectionState::Closed;
        }
        drop(state);
        let _ = self.inner.events.send(ChatEvent::Disconnected { code: None });
    }

    fn handle_frame(&self, generation: u64, text: &str) {
        let frame = match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                // One bad frame is dropped; the connection continues.
                tracing::warn!(target: "televisit::chat", error = %err, "discarding unparseable frame");
                return;
            }
        };

        let mut state = self.inner.state.lock();
        if state.generation != generation {
            return;
        }

        match frame {
            ServerFrame::MessageHistory { messages, total, has_more, offset } => {
                let page = messages.into_iter().map(ChatMessage::from_history).collect();
                let count = state.apply_history(page, total, has_more, offset);
                drop(state);
                let _ = self.inner.events.send(ChatEvent::HistoryLoaded { count });
            }
            ServerFrame::ChatMessage { id, username, message, media, sender_id, timestamp } => {
                let incoming = ChatMessage {
                    id,
                    sender_id,
                    username,
                    body: message,
                    media,
                    timestamp: parse_timestamp(&timestamp),
                };
                if is_duplicate(&state.messages, &incoming) {
                    tracing::debug!(target: "televisit::chat", id = %incoming.id, "duplicate message dropped");
                    return;
                }
                state.messages.push(incoming.clone());
                drop(state);
                let _ = self.inner.events.send(ChatEvent::MessageReceived(incoming));
            }
            ServerFrame::TokenRefreshed { access_token } => {
                self.inner.credentials.set(access_token);
                state.token_expired = false;
                tracing::info!(target: "televisit::chat", "token refreshed over socket");
            }
            ServerFrame::TokenError { message } | ServerFrame::AuthError { message } => {
                state.token_expired = true;
                drop(state);
                tracing::warn!(
                    target: "televisit::chat",
                    message = message.as_deref().unwrap_or(""),
                    "server reported auth failure"
                );
                let _ = self.inner.events.send(ChatEvent::TokenExpired);
                self.notify_auth_failure();
            }
            ServerFrame::ConnectionEstablished => {
                tracing::debug!(target: "televisit::chat", "connection established");
            }
            ServerFrame::UserJoin { message } | ServerFrame::UserLeave { message } => {
                tracing::debug!(
                    target: "televisit::chat",
                    message = message.as_deref().unwrap_or(""),
                    "presence update"
                );
            }
        }
    }

    fn handle_closed(&self, generation: u64, code: Option<u16>) {
        {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                return;
            }
            state.connection = ConnectionState::Closed;
            state.outbound = None;
            if code.is_some_and(|c| AUTH_CLOSE_CODES.contains(&c)) {
                state.token_expired = true;
            }
        }
        tracing::info!(target: "televisit::chat", code = ?code, "chat socket closed");
        let _ = self.inner.events.send(ChatEvent::Disconnected { code });
        if code.is_some_and(|c| AUTH_CLOSE_CODES.contains(&c)) {
            let _ = self.inner.events.send(ChatEvent::TokenExpired);
            self.notify_auth_failure();
        }
    }

    /// Send a chat message. Returns `false` without sending when the socket is
    /// not open or when there is neither body text nor an attachment; callers
    /// clear their input state only on `true`.
    pub fn send_message(&self, body: &str, media: Vec<MediaItem>) -> bool {
        let body = body.trim();
        if body.is_empty() && media.is_empty() {
            return false;
        }
        let mut state = self.inner.state.lock();
        if state.connection != ConnectionState::Open {
            return false;
        }
        let Some(outbound) = state.outbound.clone() else {
            return false;
        };

        let frame = ClientFrame::Message {
            message: body.to_string(),
            username: self.inner.username.clone(),
            media: media.clone(),
        };
        let Ok(text) = serde_json::to_string(&frame) else {
            return false;
        };
        if outbound.send(text).is_err() {
            return false;
        }

        // Optimistic local entry; the server echo is folded in by dedup.
        state.messages.push(ChatMessage {
            id: Uuid::new_v4().to_string(),
            sender_id: self.inner.user_id.clone(),
            username: self.inner.username.clone(),
            body: if body.is_empty() { None } else { Some(body.to_string()) },
            media,
            timestamp: OffsetDateTime::now_utc(),
        });
        true
    }

    /// Request the next (older) history page. No-op while a page is in
    /// flight, when the server reported no more pages, or when disconnected.
    pub fn load_more_messages(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.is_loading_more || !state.has_more || state.connection != ConnectionState::Open {
            return false;
        }
        let Some(outbound) = state.outbound.clone() else {
            return false;
        };
        let frame = ClientFrame::FetchMessages {
            limit: PAGE_SIZE,
            offset: state.offset,
        };
        let Ok(text) = serde_json::to_string(&frame) else {
            return false;
        };
        if outbound.send(text).is_err() {
            return false;
        }
        state.is_loading_more = true;
        true
    }

    /// Ask the server for a new token in-band. Returns `false` when the
    /// socket is not open; the caller then falls back to the HTTP path.
    pub fn send_refresh_token(&self) -> bool {
        let state = self.inner.state.lock();
        if state.connection != ConnectionState::Open {
            return false;
        }
        let Some(outbound) = state.outbound.clone() else {
            return false;
        };
        let Ok(text) = serde_json::to_string(&ClientFrame::RefreshToken) else {
            return false;
        };
        outbound.send(text).is_ok()
    }

    /// Close the socket and clear the message list. The pagination cursor is
    /// left as-is; the next `message_history` at offset zero resets it.
    pub fn disconnect(&self) {
        let mut state = self.inner.state.lock();
        state.close_socket();
        state.connection = ConnectionState::Closed;
        state.messages.clear();
    }

    /// Close the current socket and reconnect after `delay`, giving the old
    /// socket time to finish closing (used after a token refresh).
    pub fn reconnect_after(&self, delay: Duration) {
        {
            let mut state = self.inner.state.lock();
            state.close_socket();
            state.connection = ConnectionState::Closed;
        }
        let session = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = session.connect().await {
                tracing::warn!(target: "televisit::chat", error = %err, "reconnect after refresh failed");
            }
        });
    }

    pub(crate) fn set_auth_failure_notifier(&self, tx: mpsc::UnboundedSender<()>) {
        *self.inner.auth_failures.lock() = Some(tx);
    }

    fn notify_auth_failure(&self) {
        if let Some(tx) = self.inner.auth_failures.lock().clone() {
            let _ = tx.send(());
        }
    }

    // Snapshot accessors for the UI layer.

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner.state.lock().messages.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Open
    }

    pub fn token_expired(&self) -> bool {
        self.inner.state.lock().token_expired
    }

    pub fn has_more(&self) -> bool {
        self.inner.state.lock().has_more
    }

    pub fn is_loading_more(&self) -> bool {
        self.inner.state.lock().is_loading_more
    }

    pub fn total_messages(&self) -> u64 {
        self.inner.state.lock().total
    }

    pub fn message_offset(&self) -> u64 {
        self.inner.state.lock().offset
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }
}
