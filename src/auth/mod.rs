pub mod error;
pub mod refresh;
pub mod store;
pub mod token;

pub use error::AuthError;
pub use refresh::{AuthEvent, RefreshCoordinator};
pub use store::CredentialStore;
