use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(reqwest::StatusCode),
    #[error("refresh response missing access token")]
    MissingAccessToken,
}
