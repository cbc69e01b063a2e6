pub mod auth;
pub mod call;
pub mod chat;
pub mod config;
pub mod notify;
pub mod protocol;
pub mod record;

pub use auth::{AuthEvent, CredentialStore, RefreshCoordinator};
pub use call::{CallEvent, CallSession, CallStatus};
pub use chat::{ChatEvent, ChatSession, ConnectionState};
pub use config::Config;
pub use notify::{NotificationSocket, NotifyEvent};
pub use record::RecordingBlob;
