use parking_lot::RwLock;
use std::sync::Arc;

/// Shared holder for the current bearer token.
///
/// At most one token value is current at a time; it is replaced wholesale by
/// the refresh success path (HTTP refresh or a `token_refreshed` chat frame).
/// Consumers must call [`CredentialStore::current`] at each use instead of
/// caching the value across an await, since a refresh may swap it mid-flight.
#[derive(Clone, Default)]
pub struct CredentialStore {
    inner: Arc<RwLock<Option<String>>>,
}

impl CredentialStore {
    pub fn new(token: Option<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(token.filter(|t| !t.is_empty()))),
        }
    }

    pub fn current(&self) -> Option<String> {
        self.inner.read().clone()
    }

    pub fn set(&self, token: String) {
        *self.inner.write() = Some(token);
    }

    pub fn clear(&self) {
        *self.inner.write() = None;
    }
}
