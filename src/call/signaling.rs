use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::call::error::CallError;
use crate::protocol::signaling::SignalFrame;

/// Events surfaced from the signaling socket reader.
#[derive(Debug)]
pub enum SignalingEvent {
    Frame(SignalFrame),
    Closed { code: Option<u16> },
}

/// One connection to the signaling server. Outbound frames go through an
/// unbounded channel into a writer task; inbound frames are decoded at the
/// boundary and handed to the caller as [`SignalingEvent`]s.
pub struct SignalingChannel {
    outbound: mpsc::UnboundedSender<SignalFrame>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingChannel {
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>), CallError> {
        let (stream, _) = connect_async(url).await?;
        let (mut ws_write, mut ws_read) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<SignalFrame>();
        let (events, events_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target: "televisit::call", error = %err, "dropping unencodable signal frame");
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            let mut close_code = None;
            while let Some(message) = ws_read.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SignalFrame>(&text) {
                        Ok(frame) => {
                            if events.send(SignalingEvent::Frame(frame)).is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            // One bad frame is dropped; the socket stays up.
                            tracing::warn!(target: "televisit::call", error = %err, "discarding unparseable signal frame");
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        close_code = frame.map(|f| u16::from(f.code));
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(target: "televisit::call", error = %err, "signaling read failed");
                        break;
                    }
                }
            }
            let _ = events.send(SignalingEvent::Closed { code: close_code });
        });

        Ok((
            Self {
                outbound,
                tasks: vec![writer, reader],
            },
            events_rx,
        ))
    }

    /// Queue a frame for sending. `false` means the writer is gone and the
    /// channel is effectively dead.
    pub fn send(&self, frame: SignalFrame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}
