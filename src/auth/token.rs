use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use time::OffsetDateTime;

/// How close to expiry a token may get before a refresh is triggered.
pub const REFRESH_THRESHOLD: time::Duration = time::Duration::minutes(2);

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    exp: Option<i64>,
}

/// Extract the `exp` claim from a JWT without verifying the signature.
///
/// The client only needs the expiry instant to schedule proactive refreshes;
/// the server remains the authority on token validity. A token that cannot be
/// decoded is treated as carrying no expiry, never as an error.
pub fn expiry(token: &str) -> Option<OffsetDateTime> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.as_bytes()).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.exp?;
    OffsetDateTime::from_unix_timestamp(exp).ok()
}

/// True when the token expires within [`REFRESH_THRESHOLD`] of now.
/// Tokens with no decodable expiry are never considered expiring; they are
/// skipped rather than refreshed in a loop.
pub fn expires_soon(token: &str) -> bool {
    match expiry(token) {
        Some(at) => at - OffsetDateTime::now_utc() < REFRESH_THRESHOLD,
        None => false,
    }
}
