use std::env;
#[cfg(test)]
use std::sync::Mutex;

use webrtc::ice_transport::ice_server::RTCIceServer;

/// Televisit client configuration.
///
/// Every endpoint the client talks to is derived from two bases: the REST
/// base (`http(s)://`) and the WebSocket base (`ws(s)://`). TURN relay
/// settings are deployment-specific and come from the environment as well.
#[derive(Debug, Clone)]
pub struct Config {
    /// REST API base, e.g. "https://api.televisit.example".
    pub api_base: String,
    /// WebSocket base, e.g. "wss://api.televisit.example".
    pub ws_base: String,
    /// TURN relay url ("turn:host:port"), if the deployment has one.
    pub turn_url: Option<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

const DEFAULT_API_BASE: &str = "http://127.0.0.1:8000";
const DEFAULT_WS_BASE: &str = "ws://127.0.0.1:8000";
const PUBLIC_STUN: &str = "stun:stun.l.google.com:19302";

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let api_base = env::var("TELEVISIT_API_BASE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let ws_base = env::var("TELEVISIT_WS_BASE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_WS_BASE.to_string());
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            ws_base: ws_base.trim_end_matches('/').to_string(),
            turn_url: env::var("TELEVISIT_TURN_URL").ok().filter(|s| !s.is_empty()),
            turn_username: env::var("TELEVISIT_TURN_USER").ok().filter(|s| !s.is_empty()),
            turn_credential: env::var("TELEVISIT_TURN_PASS").ok().filter(|s| !s.is_empty()),
        }
    }

    pub fn refresh_url(&self) -> String {
        format!("{}/v1/auth/refresh", self.api_base)
    }

    pub fn upload_url(&self) -> String {
        format!("{}/consultations/upload_chat_file", self.api_base)
    }

    pub fn availability_url(&self, user_id: &str) -> String {
        format!("{}/users/psychologists/{user_id}/availability", self.api_base)
    }

    /// Chat socket endpoint; the bearer token rides as a query credential
    /// because browsers cannot set headers on WebSocket upgrades and the
    /// server keeps one auth path for all clients.
    pub fn chat_socket_url(&self, room_id: &str, token: &str) -> String {
        format!("{}/ws/chat/{room_id}/?token={token}", self.ws_base)
    }

    pub fn signaling_socket_url(&self, user_id: &str) -> String {
        format!("{}/ws/create_signaling/{user_id}", self.ws_base)
    }

    pub fn notification_socket_url(&self, user_id: &str) -> String {
        format!("{}/ws/notifications/{user_id}", self.ws_base)
    }

    /// ICE server set: public STUN plus the deployment TURN relay when
    /// configured.
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers = vec![RTCIceServer {
            urls: vec![PUBLIC_STUN.to_string()],
            ..Default::default()
        }];
        if let Some(turn) = &self.turn_url {
            servers.push(RTCIceServer {
                urls: vec![turn.clone()],
                username: self.turn_username.clone().unwrap_or_default(),
                credential: self.turn_credential.clone().unwrap_or_default(),
                ..Default::default()
            });
        }
        servers
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            ws_base: DEFAULT_WS_BASE.to_string(),
            turn_url: None,
            turn_username: None,
            turn_credential: None,
        }
    }
}
