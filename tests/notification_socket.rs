use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

use televisit::config::Config;
use televisit::notify::{NotificationSocket, NotifyEvent};
use televisit::protocol::Notification;

#[derive(Default)]
struct ServerLog {
    connections: AtomicU32,
    received: Mutex<Vec<Value>>,
}

async fn serve(router: Router) -> (SocketAddr, oneshot::Sender<()>) {
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

fn config_for(addr: SocketAddr) -> Config {
    Config {
        ws_base: format!("ws://{addr}"),
        ..Config::default()
    }
}

async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let steps = (deadline.as_millis() / 50).max(1);
    for _ in 0..steps {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test]
async fn delivers_notifications_and_answers_server_pings() {
    async fn handler(
        ws: WebSocketUpgrade,
        Path(_user): Path<String>,
        State(log): State<Arc<ServerLog>>,
    ) -> impl IntoResponse {
        ws.on_upgrade(move |mut socket: WebSocket| async move {
            log.connections.fetch_add(1, Ordering::SeqCst);
            let ping = serde_json::to_string(&json!({ "type": "ping" })).unwrap();
            let _ = socket.send(WsMessage::Text(ping)).await;
            let notification = serde_json::to_string(&json!({
                "type": "notification",
                "message": "You have message",
                "notification_type": "message",
                "consultation_id": "c-1",
            }))
            .unwrap();
            let _ = socket.send(WsMessage::Text(notification)).await;
            while let Some(Ok(message)) = socket.recv().await {
                if let WsMessage::Text(text) = message {
                    let value: Value = serde_json::from_str(&text).expect("client frame");
                    log.received.lock().unwrap().push(value);
                }
            }
        })
    }

    let log = Arc::new(ServerLog::default());
    let router = Router::new()
        .route("/ws/notifications/:user", get(handler))
        .with_state(log.clone());
    let (addr, _shutdown) = serve(router).await;

    let (socket, mut events) = NotificationSocket::new(config_for(addr), "u-1");
    socket.connect().await.expect("connect");

    let mut saw_notification = false;
    for _ in 0..2 {
        match timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event timeout")
            .expect("event channel open")
        {
            NotifyEvent::Connected => {}
            NotifyEvent::Notification(notification) => {
                assert_eq!(notification.message, "You have message");
                assert_eq!(notification.consultation_id.as_deref(), Some("c-1"));
                saw_notification = true;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(saw_notification);

    // The server ping was answered with a pong.
    let pong_seen = wait_until(Duration::from_secs(3), || {
        log.received
            .lock()
            .unwrap()
            .iter()
            .any(|v| v["type"] == "pong")
    })
    .await;
    assert!(pong_seen);

    // Outbound notifications reach the server.
    assert!(socket.send_notification(Notification {
        message: "appointment reminder".into(),
        notification_type: "reminder".into(),
        receiver_id: Some("doc-1".into()),
        ..Default::default()
    }));
    let delivered = wait_until(Duration::from_secs(3), || {
        log.received
            .lock()
            .unwrap()
            .iter()
            .any(|v| v["type"] == "notification" && v["message"] == "appointment reminder")
    })
    .await;
    assert!(delivered);

    socket.disconnect();
}

#[tokio::test]
async fn reconnects_after_abnormal_closure() {
    async fn handler(
        ws: WebSocketUpgrade,
        Path(_user): Path<String>,
        State(log): State<Arc<ServerLog>>,
    ) -> impl IntoResponse {
        ws.on_upgrade(move |mut socket: WebSocket| async move {
            let n = log.connections.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                // First connection: kick the client with an abnormal code.
                let _ = socket
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: 1011,
                        reason: "restarting".into(),
                    })))
                    .await;
                return;
            }
            while socket.recv().await.is_some() {}
        })
    }

    let log = Arc::new(ServerLog::default());
    let router = Router::new()
        .route("/ws/notifications/:user", get(handler))
        .with_state(log.clone());
    let (addr, _shutdown) = serve(router).await;

    let (socket, _events) = NotificationSocket::new(config_for(addr), "u-1");
    socket.connect().await.expect("connect");

    // First backoff step is one second; allow a little slack.
    let reconnected = wait_until(Duration::from_secs(5), || {
        log.connections.load(Ordering::SeqCst) >= 2
    })
    .await;
    assert!(reconnected);
    socket.disconnect();
}

#[tokio::test]
async fn normal_closure_is_final() {
    async fn handler(
        ws: WebSocketUpgrade,
        Path(_user): Path<String>,
        State(log): State<Arc<ServerLog>>,
    ) -> impl IntoResponse {
        ws.on_upgrade(move |mut socket: WebSocket| async move {
            log.connections.fetch_add(1, Ordering::SeqCst);
            let _ = socket
                .send(WsMessage::Close(Some(CloseFrame {
                    code: 1000,
                    reason: "goodbye".into(),
                })))
                .await;
        })
    }

    let log = Arc::new(ServerLog::default());
    let router = Router::new()
        .route("/ws/notifications/:user", get(handler))
        .with_state(log.clone());
    let (addr, _shutdown) = serve(router).await;

    let (socket, mut events) = NotificationSocket::new(config_for(addr), "u-1");
    socket.connect().await.expect("connect");

    let mut saw_final_close = false;
    for _ in 0..2 {
        match timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event timeout")
            .expect("event channel open")
        {
            NotifyEvent::Connected => {}
            NotifyEvent::Disconnected { code } => {
                assert_eq!(code, Some(1000));
                saw_final_close = true;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(saw_final_close);

    // No reconnect follows a normal closure.
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(log.connections.load(Ordering::SeqCst), 1);
}
