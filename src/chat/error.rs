use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat socket connect timed out")]
    ConnectTimeout,
    #[error("chat socket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
}
