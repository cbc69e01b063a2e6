use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::config::Config;
use crate::protocol::notify::{Notification, NotifyFrame};

/// Application-level keep-alive cadence; the server drops idle sockets.
pub const PING_INTERVAL: Duration = Duration::from_secs(20);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Reconnects are attempted at most this many times per outage.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// A server-initiated normal closure; reconnecting would be fighting the
/// server's decision.
const NORMAL_CLOSURE: u16 = 1000;

/// Exponential reconnect backoff: 1s, 2s, 4s, ... capped at 30s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let millis = 1000u64
        .saturating_mul(2u64.saturating_pow(attempt.min(16)))
        .min(30_000);
    Duration::from_millis(millis)
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification socket connect timed out")]
    ConnectTimeout,
    #[error("notification socket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug)]
pub enum NotifyEvent {
    Connected,
    Disconnected { code: Option<u16> },
    Notification(Notification),
}

struct NotifyState {
    generation: u64,
    attempts: u32,
    closed: bool,
    outbound: Option<mpsc::UnboundedSender<String>>,
    tasks: Vec<JoinHandle<()>>,
}

impl NotifyState {
    fn drop_socket(&mut self) {
        self.outbound = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

struct NotifyInner {
    config: Config,
    user_id: String,
    events: mpsc::UnboundedSender<NotifyEvent>,
    state: Mutex<NotifyState>,
}

/// Per-user notification socket with keep-alive pings and bounded reconnect.
#[derive(Clone)]
pub struct NotificationSocket {
    inner: Arc<NotifyInner>,
}

impl NotificationSocket {
    pub fn new(
        config: Config,
        user_id: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<NotifyEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let socket = Self {
            inner: Arc::new(NotifyInner {
                config,
                user_id: user_id.into(),
                events,
                state: Mutex::new(NotifyState {
                    generation: 0,
                    attempts: 0,
                    closed: false,
                    outbound: None,
                    tasks: Vec::new(),
                }),
            }),
        };
        (socket, events_rx)
    }

    /// Open the socket. The reconnect budget resets on every explicit connect.
    pub async fn connect(&self) -> Result<(), NotifyError> {
        {
            let mut state = self.inner.state.lock();
            state.closed = false;
            state.attempts = 0;
        }
        self.connect_once().await
    }

    async fn connect_once(&self) -> Result<(), NotifyError> {
        let generation = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.drop_socket();
            state.generation
        };

        let url = self.inner.config.notification_socket_url(&self.inner.user_id);
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&url)).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(err)) => {
                self.schedule_reconnect();
                return Err(NotifyError::Socket(err));
            }
            Err(_) => {
                self.schedule_reconnect();
                return Err(NotifyError::ConnectTimeout);
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

        let ping_outbound = outbound.clone();
        let ping = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Ok(text) = serde_json::to_string(&NotifyFrame::Ping) else {
                    break;
                };
                if ping_outbound.send(text).is_err() {
                    break;
                }
            }
        });

        let socket = self.clone();
        let reply_outbound = outbound.clone();
        let reader = tokio::spawn(async move {
            let mut close_code = None;
            while let Some(message) = ws_read.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<NotifyFrame>(&text) {
                        Ok(NotifyFrame::Ping) => {
                            if let Ok(pong) = serde_json::to_string(&NotifyFrame::Pong) {
                                let _ = reply_outbound.send(pong);
                            }
                        }
                        Ok(NotifyFrame::Pong) => {}
                        Ok(NotifyFrame::Notification(notification)) => {
                            let _ = socket
                                .inner
                                .events
                                .send(NotifyEvent::Notification(notification));
                        }
                        Err(err) => {
                            tracing::warn!(target: "televisit::notify", error = %err, "discarding unparseable frame");
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        close_code = frame.map(|f| u16::from(f.code));
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(target: "televisit::notify", error = %err, "socket read failed");
                        break;
                    }
                }
            }
            socket.handle_closed(generation, close_code);
        });

        {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                reader.abort();
                writer.abort();
                ping.abort();
                return Ok(());
            }
            state.outbound = Some(outbound);
            state.tasks = vec![writer, ping, reader];
            state.attempts = 0;
        }
        tracing::info!(target: "televisit::notify", user = %self.inner.user_id, "notification socket connected");
        let _ = self.inner.events.send(NotifyEvent::Connected);
        Ok(())
    }

    fn handle_closed(&self, generation: u64, code: Option<u16>) {
        {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                return;
            }
            state.outbound = None;
        }
        tracing::info!(target: "televisit::notify", code = ?code, "notification socket closed");
        let _ = self.inner.events.send(NotifyEvent::Disconnected { code });
        if code == Some(NORMAL_CLOSURE) {
            return;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&self) {
        let delay = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            if state.attempts >= MAX_RECONNECT_ATTEMPTS {
                tracing::warn!(target: "televisit::notify", "reconnect budget exhausted, giving up");
                return;
            }
            let delay = backoff_delay(state.attempts);
            state.attempts += 1;
            delay
        };
        tracing::info!(target: "televisit::notify", ?delay, "scheduling reconnect");
        let socket = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if socket.inner.state.lock().closed {
                return;
            }
            let _ = socket.connect_once().await;
        });
    }

    /// Push a notification to the server for fan-out. `false` when the socket
    /// is not connected.
    pub fn send_notification(&self, notification: Notification) -> bool {
        let outbound = self.inner.state.lock().outbound.clone();
        let Some(outbound) = outbound else {
            return false;
        };
        let Ok(text) = serde_json::to_string(&NotifyFrame::Notification(notification)) else {
            return false;
        };
        outbound.send(text).is_ok()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().outbound.is_some()
    }

    /// Close the socket and suppress any further reconnects.
    pub fn disconnect(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        state.generation += 1;
        state.drop_socket();
    }
}
