use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("signaling socket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("signaling socket is not connected")]
    SignalingClosed,
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("no incoming call to answer")]
    NoPendingOffer,
    #[error("availability request failed: {0}")]
    Availability(#[from] reqwest::Error),
    #[error("availability request rejected with status {0}")]
    AvailabilityStatus(reqwest::StatusCode),
}
