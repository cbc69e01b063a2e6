use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::auth::error::AuthError;
use crate::auth::store::CredentialStore;
use crate::auth::token;
use crate::chat::ChatSession;
use crate::config::Config;

/// Cadence of the proactive expiry check.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Delay between adopting a refreshed token and reconnecting the chat socket,
/// so the old socket can close cleanly before the new one opens.
pub const RECONNECT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Outcomes the UI layer reacts to: a banner clear on refresh, a redirect to
/// the login surface on session expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    TokenRefreshed,
    SessionExpired,
}

#[async_trait]
trait RefreshBackend: Send + Sync {
    async fn refresh(&self) -> Result<String, AuthError>;
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    access_token: Option<String>,
}

/// Calls the auth endpoint with ambient session cookies; the refresh token
/// itself never passes through this client.
struct ReqwestRefreshBackend {
    client: reqwest::Client,
    url: String,
}

impl ReqwestRefreshBackend {
    fn new(config: &Config) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()?;
        Ok(Self {
            client,
            url: config.refresh_url(),
        })
    }
}

#[async_trait]
impl RefreshBackend for ReqwestRefreshBackend {
    async fn refresh(&self) -> Result<String, AuthError> {
        let response = self.client.post(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(AuthError::HttpStatus(response.status()));
        }
        let payload = response.json::<RefreshResponse>().await?;
        payload.access_token.ok_or(AuthError::MissingAccessToken)
    }
}

/// Keeps the session credential fresh: a periodic expiry check plus reactive
/// refreshes when the chat socket reports an auth failure.
pub struct RefreshCoordinator {
    store: CredentialStore,
    backend: Arc<dyn RefreshBackend>,
    events: mpsc::UnboundedSender<AuthEvent>,
    chat: Mutex<Option<ChatSession>>,
}

impl RefreshCoordinator {
    pub fn new(
        config: &Config,
        store: CredentialStore,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<AuthEvent>), AuthError> {
        let backend = Arc::new(ReqwestRefreshBackend::new(config)?);
        Ok(Self::build(store, backend))
    }

    #[cfg(test)]
    fn with_backend(
        store: CredentialStore,
        backend: Arc<dyn RefreshBackend>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<AuthEvent>) {
        Self::build(store, backend)
    }

    fn build(
        store: CredentialStore,
        backend: Arc<dyn RefreshBackend>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<AuthEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(Self {
            store,
            backend,
            events,
            chat: Mutex::new(None),
        });
        (coordinator, events_rx)
    }

    /// Register a chat session: its auth failures trigger an HTTP refresh, and
    /// a successful refresh reconnects it with the new token.
    pub fn watch_chat(self: &Arc<Self>, chat: &ChatSession) {
        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel::<()>();
        chat.set_auth_failure_notifier(failure_tx);
        *self.chat.lock() = Some(chat.clone());

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while failure_rx.recv().await.is_some() {
                let _ = coordinator.refresh_via_http().await;
            }
        });
    }

    /// Run the periodic expiry check: once immediately, then every 30 seconds.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CHECK_INTERVAL);
            loop {
                ticker.tick().await;
                coordinator.check_and_refresh().await;
            }
        })
    }

    /// Decode the current token's expiry and refresh when it is within two
    /// minutes of lapsing. An absent or undecodable token is skipped silently.
    pub async fn check_and_refresh(&self) {
        let Some(current) = self.store.current() else {
            return;
        };
        if token::expiry(&current).is_none() {
            tracing::debug!(target: "televisit::auth", "token has no decodable expiry, skipping check");
            return;
        }
        if token::expires_soon(&current) {
            tracing::info!(target: "televisit::auth", "token expiring soon, refreshing");
            let _ = self.refresh_via_http().await;
        }
    }

    /// Exchange session cookies for a fresh access token. Failure is terminal
    /// for the session: a `SessionExpired` event is emitted and no retry is
    /// scheduled.
    pub async fn refresh_via_http(&self) -> Result<(), AuthError> {
        match self.backend.refresh().await {
            Ok(access_token) => {
                self.store.set(access_token);
                tracing::info!(target: "televisit::auth", "access token refreshed");
                let _ = self.events.send(AuthEvent::TokenRefreshed);
                if let Some(chat) = self.chat.lock().clone() {
                    chat.reconnect_after(RECONNECT_SETTLE_DELAY);
                }
                Ok(())
            }
            Err(err) => {
                tracing::warn!(target: "televisit::auth", error = %err, "token refresh failed");
                let _ = self.events.send(AuthEvent::SessionExpired);
                Err(err)
            }
        }
    }

    /// Prefer an in-band `refresh_token` frame when the chat socket is open,
    /// falling back to the HTTP path otherwise.
    pub async fn refresh_via_socket(&self) -> Result<(), AuthError> {
        let sent = self
            .chat
            .lock()
            .clone()
            .map(|chat| chat.send_refresh_token())
            .unwrap_or(false);
        if sent {
            return Ok(());
        }
        self.refresh_via_http().await
    }
}
