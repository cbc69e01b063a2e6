use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Json, Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, patch};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use televisit::call::media::{MediaPacket, MediaSource, PcmChunk, VideoFrame};
use televisit::call::{CallEvent, CallSession, CallStatus};
use televisit::config::Config;

#[derive(Default)]
struct RelayState {
    peers: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    availability: Mutex<Vec<(String, bool)>>,
}

/// Routes each frame to the peer named by its `targetId`, the way the
/// deployed signaling server does.
async fn relay_handler(
    ws: WebSocketUpgrade,
    Path(user): Path<String>,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket: WebSocket| async move {
        let (mut ws_write, mut ws_read) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        state.peers.lock().unwrap().insert(user.clone(), tx);

        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if ws_write.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        while let Some(Ok(message)) = ws_read.next().await {
            let WsMessage::Text(text) = message else { continue };
            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            let Some(target) = value["targetId"].as_str() else {
                continue;
            };
            let peer = state.peers.lock().unwrap().get(target).cloned();
            if let Some(peer) = peer {
                let _ = peer.send(text);
            }
        }

        state.peers.lock().unwrap().remove(&user);
        writer.abort();
    })
}

async fn availability_handler(
    Path(user): Path<String>,
    State(state): State<Arc<RelayState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let available = body["is_available"].as_bool().unwrap_or(true);
    state.availability.lock().unwrap().push((user, available));
    Json(json!({ "status": "ok" }))
}

async fn serve(state: Arc<RelayState>) -> (SocketAddr, oneshot::Sender<()>) {
    let router = Router::new()
        .route("/ws/create_signaling/:user", get(relay_handler))
        .route("/users/psychologists/:user/availability", patch(availability_handler))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });
    (addr, shutdown_tx)
}

/// Tiny deterministic source so the test does not push full-size frames
/// through the transport.
struct TinySource {
    next_at: tokio::time::Instant,
    frames: u64,
}

impl TinySource {
    fn new() -> Self {
        Self {
            next_at: tokio::time::Instant::now(),
            frames: 0,
        }
    }
}

#[async_trait]
impl MediaSource for TinySource {
    async fn next(&mut self) -> Option<MediaPacket> {
        tokio::time::sleep_until(self.next_at).await;
        self.next_at += Duration::from_millis(100);
        self.frames += 1;
        if self.frames % 2 == 0 {
            Some(MediaPacket::Audio(PcmChunk {
                samples: Arc::new(vec![0i16; 160]),
                sample_rate: 48_000,
            }))
        } else {
            Some(MediaPacket::Video(VideoFrame {
                width: 16,
                height: 16,
                data: Arc::new(vec![0x80; 16 * 16 * 4]),
            }))
        }
    }
}

async fn wait_for_event(
    events: &mut mpsc::UnboundedReceiver<CallEvent>,
    deadline: Duration,
    mut pred: impl FnMut(&CallEvent) -> bool,
) -> CallEvent {
    let deadline = tokio::time::Instant::now() + deadline;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("event deadline passed");
        let event = timeout(remaining, events.recv())
            .await
            .expect("event timeout")
            .expect("event channel open");
        if pred(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn call_negotiates_connects_and_ends() {
    let state = Arc::new(RelayState::default());
    let (addr, _shutdown) = serve(state.clone()).await;
    let config = Config {
        api_base: format!("http://{addr}"),
        ws_base: format!("ws://{addr}"),
        ..Config::default()
    };

    let (patient, mut patient_events) =
        CallSession::new(config.clone(), "patient-1").expect("patient session");
    let (doctor, mut doctor_events) =
        CallSession::new(config.clone(), "doc-1").expect("doctor session");
    patient.connect_signaling().await.expect("patient signaling");
    doctor.connect_signaling().await.expect("doctor signaling");

    patient
        .start_call("doc-1", "c-9", Some(Box::new(TinySource::new())))
        .await
        .expect("start call");
    assert_eq!(patient.status(), CallStatus::OfferSent);

    match wait_for_event(&mut doctor_events, Duration::from_secs(10), |e| {
        matches!(e, CallEvent::IncomingCall { .. })
    })
    .await
    {
        CallEvent::IncomingCall {
            sender_id,
            consultation_id,
        } => {
            assert_eq!(sender_id, "patient-1");
            assert_eq!(consultation_id, "c-9");
        }
        _ => unreachable!(),
    }

    doctor
        .answer_call(Some(Box::new(TinySource::new())))
        .await
        .expect("answer call");

    // Answering marks the practitioner unavailable.
    assert_eq!(
        state.availability.lock().unwrap().first(),
        Some(&("doc-1".to_string(), false))
    );

    // The responder waits for the transport after sending its answer.
    wait_for_event(&mut doctor_events, Duration::from_secs(10), |e| {
        matches!(e, CallEvent::StatusChanged(CallStatus::WaitingForPeer))
    })
    .await;

    wait_for_event(&mut patient_events, Duration::from_secs(20), |e| {
        matches!(e, CallEvent::StatusChanged(CallStatus::Connected))
    })
    .await;
    wait_for_event(&mut doctor_events, Duration::from_secs(20), |e| {
        matches!(e, CallEvent::StatusChanged(CallStatus::Connected))
    })
    .await;

    patient.end_call().await;
    assert_eq!(patient.status(), CallStatus::Ended);

    match wait_for_event(&mut patient_events, Duration::from_secs(10), |e| {
        matches!(e, CallEvent::Ended { .. })
    })
    .await
    {
        CallEvent::Ended {
            consultation_id,
            recording,
            ..
        } => {
            assert_eq!(consultation_id, "c-9");
            assert!(recording.is_none());
        }
        _ => unreachable!(),
    }

    // The hangup frame reaches the responder, which tears down too and
    // restores its availability.
    wait_for_event(&mut doctor_events, Duration::from_secs(10), |e| {
        matches!(e, CallEvent::Ended { .. })
    })
    .await;
    assert_eq!(doctor.status(), CallStatus::Ended);
    assert_eq!(
        state.availability.lock().unwrap().last(),
        Some(&("doc-1".to_string(), true))
    );

    patient.disconnect().await;
    doctor.disconnect().await;
}
