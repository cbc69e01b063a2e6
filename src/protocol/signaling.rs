use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Call signaling frames, addressed peer-to-peer through the signaling
/// server. Field naming follows the deployed server contract, which mixes
/// camelCase ids with a snake_case `consultation_id` on initiate and a
/// camelCase `consultationId` on end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalFrame {
    #[serde(rename = "call-initiate")]
    CallInitiate {
        #[serde(rename = "senderId")]
        sender_id: String,
        #[serde(rename = "targetId")]
        target_id: String,
        consultation_id: String,
        offer: RTCSessionDescription,
    },
    #[serde(rename = "call-answer")]
    CallAnswer {
        #[serde(rename = "senderId")]
        sender_id: String,
        #[serde(rename = "targetId")]
        target_id: String,
        answer: RTCSessionDescription,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        #[serde(rename = "senderId")]
        sender_id: String,
        #[serde(rename = "targetId")]
        target_id: String,
        candidate: RTCIceCandidateInit,
    },
    #[serde(rename = "call-end")]
    CallEnd {
        #[serde(rename = "senderId")]
        sender_id: String,
        #[serde(rename = "targetId")]
        target_id: String,
        #[serde(rename = "consultationId")]
        consultation_id: String,
        duration: u64,
    },
}

impl SignalFrame {
    /// The peer this frame is addressed to; the signaling server routes on it.
    pub fn target_id(&self) -> &str {
        match self {
            SignalFrame::CallInitiate { target_id, .. }
            | SignalFrame::CallAnswer { target_id, .. }
            | SignalFrame::IceCandidate { target_id, .. }
            | SignalFrame::CallEnd { target_id, .. } => target_id,
        }
    }
}
