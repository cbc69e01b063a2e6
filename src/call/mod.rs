pub mod error;
pub mod media;
pub mod signaling;

pub use error::CallError;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::TrackLocal;

use crate::call::media::{LocalMedia, MediaSource, MediaTap};
use crate::call::signaling::{SignalingChannel, SignalingEvent};
use crate::config::Config;
use crate::protocol::signaling::SignalFrame;
use crate::record::{CallRecorder, RecordingBlob};

/// Recording auto-start waits this long after the call connects, letting the
/// remote feed settle first.
pub const AUTO_RECORD_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Idle,
    Connecting,
    /// Responder state between sending the answer and the transport connecting.
    WaitingForPeer,
    OfferSent,
    Connected,
    Ended,
    Failed,
}

/// Call lifecycle notifications for the UI layer.
#[derive(Debug)]
pub enum CallEvent {
    IncomingCall {
        sender_id: String,
        consultation_id: String,
    },
    StatusChanged(CallStatus),
    DurationTick(u64),
    Ended {
        consultation_id: String,
        duration: u64,
        recording: Option<RecordingBlob>,
    },
}

#[derive(Debug, Clone)]
struct ActiveCall {
    peer_id: String,
    consultation_id: String,
    role: CallRole,
}

#[derive(Debug)]
struct PendingOffer {
    sender_id: String,
    consultation_id: String,
    offer: RTCSessionDescription,
}

#[async_trait]
trait AvailabilityBackend: Send + Sync {
    async fn set_available(&self, user_id: &str, available: bool) -> Result<(), CallError>;
}

/// Flips the practitioner's bookable flag while a call is in progress.
struct ReqwestAvailabilityBackend {
    client: reqwest::Client,
    config: Config,
}

impl ReqwestAvailabilityBackend {
    fn new(config: Config) -> Result<Self, CallError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl AvailabilityBackend for ReqwestAvailabilityBackend {
    async fn set_available(&self, user_id: &str, available: bool) -> Result<(), CallError> {
        let response = self
            .client
            .patch(self.config.availability_url(user_id))
            .json(&serde_json::json!({ "is_available": available }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CallError::AvailabilityStatus(response.status()));
        }
        Ok(())
    }
}

struct CallInner {
    config: Config,
    user_id: String,
    events: mpsc::UnboundedSender<CallEvent>,
    /// Bumped on every call teardown; async handlers from an older call
    /// compare their captured epoch and bail out.
    epoch: AtomicU64,
    status: Mutex<CallStatus>,
    signaling: Mutex<Option<SignalingChannel>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    pc: Mutex<Option<Arc<RTCPeerConnection>>>,
    local: Mutex<Option<LocalMedia>>,
    remote_tap: MediaTap,
    remote_live: AtomicBool,
    active: Mutex<Option<ActiveCall>>,
    pending_offer: Mutex<Option<PendingOffer>>,
    recorder: Mutex<Option<CallRecorder>>,
    recording_error: Mutex<Option<String>>,
    auto_record: AtomicBool,
    duration_secs: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
    availability: Arc<dyn AvailabilityBackend>,
}

/// One user's call surface: a persistent signaling socket plus at most one
/// active peer connection at a time. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct CallSession {
    inner: Arc<CallInner>,
}

impl CallSession {
    pub fn new(
        config: Config,
        user_id: impl Into<String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CallEvent>), CallError> {
        let availability = Arc::new(ReqwestAvailabilityBackend::new(config.clone())?);
        Ok(Self::build(config, user_id.into(), availability))
    }

    #[cfg(test)]
    fn with_backend(
        config: Config,
        user_id: impl Into<String>,
        availability: Arc<dyn AvailabilityBackend>,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        Self::build(config, user_id.into(), availability)
    }

    fn build(
        config: Config,
        user_id: String,
        availability: Arc<dyn AvailabilityBackend>,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            inner: Arc::new(CallInner {
                config,
                user_id,
                events,
                epoch: AtomicU64::new(0),
                status: Mutex::new(CallStatus::Idle),
                signaling: Mutex::new(None),
                dispatch: Mutex::new(None),
                pc: Mutex::new(None),
                local: Mutex::new(None),
                remote_tap: MediaTap::new(),
                remote_live: AtomicBool::new(false),
                active: Mutex::new(None),
                pending_offer: Mutex::new(None),
                recorder: Mutex::new(None),
                recording_error: Mutex::new(None),
                auto_record: AtomicBool::new(false),
                duration_secs: AtomicU64::new(0),
                timer: Mutex::new(None),
                availability,
            }),
        };
        (session, events_rx)
    }

    /// Open the per-user signaling socket and start dispatching its frames.
    pub async fn connect_signaling(&self) -> Result<(), CallError> {
        let url = self.inner.config.signaling_socket_url(&self.inner.user_id);
        let (channel, mut events_rx) = SignalingChannel::connect(&url).await?;
        *self.inner.signaling.lock() = Some(channel);

        let session = self.clone();
        let dispatch = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    SignalingEvent::Frame(frame) => session.handle_signal(frame).await,
                    SignalingEvent::Closed { code } => {
                        tracing::info!(target: "televisit::call", code = ?code, "signaling socket closed");
                        // Losing signaling mid-negotiation strands the call.
                        if matches!(
                            session.status(),
                            CallStatus::Connecting
                                | CallStatus::WaitingForPeer
                                | CallStatus::OfferSent
                        ) {
                            session.set_status(CallStatus::Failed);
                        }
                        break;
                    }
                }
            }
        });
        if let Some(previous) = self.inner.dispatch.lock().replace(dispatch) {
            previous.abort();
        }
        tracing::info!(target: "televisit::call", user = %self.inner.user_id, "signaling connected");
        Ok(())
    }

    async fn handle_signal(&self, frame: SignalFrame) {
        match frame {
            SignalFrame::CallInitiate {
                sender_id,
                consultation_id,
                offer,
                ..
            } => {
                *self.inner.pending_offer.lock() = Some(PendingOffer {
                    sender_id: sender_id.clone(),
                    consultation_id: consultation_id.clone(),
                    offer,
                });
                let _ = self.inner.events.send(CallEvent::IncomingCall {
                    sender_id,
                    consultation_id,
                });
            }
            SignalFrame::CallAnswer { answer, .. } => {
                let pc = self.inner.pc.lock().clone();
                let Some(pc) = pc else {
                    tracing::debug!(target: "televisit::call", "answer without a peer connection, dropping");
                    return;
                };
                if let Err(err) = pc.set_remote_description(answer).await {
                    tracing::warn!(target: "televisit::call", error = %err, "failed to apply answer");
                }
            }
            SignalFrame::IceCandidate { candidate, .. } => {
                let pc = self.inner.pc.lock().clone();
                let Some(pc) = pc else {
                    // Candidates can race the offer; nothing to attach them to yet.
                    tracing::debug!(target: "televisit::call", "ice candidate before peer connection, dropping");
                    return;
                };
                if let Err(err) = pc.add_ice_candidate(candidate).await {
                    tracing::warn!(target: "televisit::call", error = %err, "failed to add remote ice candidate");
                }
            }
            SignalFrame::CallEnd { .. } => {
                self.finish_call(false).await;
            }
        }
    }

    /// Place an outgoing call: create the peer connection, send the offer.
    pub async fn start_call(
        &self,
        target_id: &str,
        consultation_id: &str,
        source: Option<Box<dyn MediaSource>>,
    ) -> Result<(), CallError> {
        self.set_status(CallStatus::Connecting);
        self.inner.duration_secs.store(0, Ordering::Relaxed);
        *self.inner.recording_error.lock() = None;
        let active = ActiveCall {
            peer_id: target_id.to_string(),
            consultation_id: consultation_id.to_string(),
            role: CallRole::Initiator,
        };
        let pc = self.setup_peer(active, source).await?;

        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer.clone()).await?;
        if !self.send_signal(SignalFrame::CallInitiate {
            sender_id: self.inner.user_id.clone(),
            target_id: target_id.to_string(),
            consultation_id: consultation_id.to_string(),
            offer,
        }) {
            self.set_status(CallStatus::Failed);
            return Err(CallError::SignalingClosed);
        }
        self.set_status(CallStatus::OfferSent);
        Ok(())
    }

    /// Answer the most recent incoming offer. The responder side also marks
    /// itself unavailable for new bookings for the duration of the call.
    pub async fn answer_call(&self, source: Option<Box<dyn MediaSource>>) -> Result<(), CallError> {
        let pending = self
            .inner
            .pending_offer
            .lock()
            .take()
            .ok_or(CallError::NoPendingOffer)?;

        self.set_status(CallStatus::Connecting);
        self.inner.duration_secs.store(0, Ordering::Relaxed);
        *self.inner.recording_error.lock() = None;
        let active = ActiveCall {
            peer_id: pending.sender_id.clone(),
            consultation_id: pending.consultation_id,
            role: CallRole::Responder,
        };
        let pc = self.setup_peer(active, source).await?;

        pc.set_remote_description(pending.offer).await?;
        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer.clone()).await?;
        if !self.send_signal(SignalFrame::CallAnswer {
            sender_id: self.inner.user_id.clone(),
            target_id: pending.sender_id,
            answer,
        }) {
            self.set_status(CallStatus::Failed);
            return Err(CallError::SignalingClosed);
        }
        self.set_status(CallStatus::WaitingForPeer);

        if let Err(err) = self
            .inner
            .availability
            .set_available(&self.inner.user_id, false)
            .await
        {
            // Availability is advisory; the call proceeds regardless.
            tracing::warn!(target: "televisit::call", error = %err, "failed to mark unavailable");
        }
        Ok(())
    }

    async fn setup_peer(
        &self,
        active: ActiveCall,
        source: Option<Box<dyn MediaSource>>,
    ) -> Result<Arc<RTCPeerConnection>, CallError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: self.inner.config.ice_servers(),
                ..Default::default()
            })
            .await?,
        );

        let local = LocalMedia::acquire(source);
        for track in [local.video_track(), local.audio_track()] {
            let sender = pc
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }

        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let peer_id = active.peer_id.clone();

        let session = self.clone();
        let candidate_peer = peer_id.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let session = session.clone();
            let peer_id = candidate_peer.clone();
            Box::pin(async move {
                if session.inner.epoch.load(Ordering::SeqCst) != epoch {
                    return;
                }
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        session.send_signal(SignalFrame::IceCandidate {
                            sender_id: session.inner.user_id.clone(),
                            target_id: peer_id,
                            candidate: init,
                        });
                    }
                    Err(err) => {
                        tracing::warn!(target: "televisit::call", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let session = self.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let session = session.clone();
            Box::pin(async move {
                if session.inner.epoch.load(Ordering::SeqCst) != epoch {
                    return;
                }
                tracing::info!(
                    target: "televisit::call",
                    kind = %track.kind(),
                    "remote track arrived"
                );
                session.inner.remote_live.store(true, Ordering::SeqCst);
                session.mark_connected(epoch);
                // Keep the transport fed; decoding is the embedder's concern
                // via the remote tap.
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1500];
                    while track.read(&mut buf).await.is_ok() {}
                });
            })
        }));

        let session = self.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let session = session.clone();
            Box::pin(async move {
                if session.inner.epoch.load(Ordering::SeqCst) != epoch {
                    return;
                }
                tracing::debug!(target: "televisit::call", ?state, "peer connection state changed");
                match state {
                    RTCPeerConnectionState::Connected => session.mark_connected(epoch),
                    RTCPeerConnectionState::Failed => {
                        tracing::warn!(target: "televisit::call", "peer connection failed");
                        session.set_status(CallStatus::Failed);
                    }
                    _ => {}
                }
            })
        }));

        *self.inner.pc.lock() = Some(Arc::clone(&pc));
        *self.inner.local.lock() = Some(local);
        *self.inner.active.lock() = Some(active);
        Ok(pc)
    }

    /// Transition to Connected once, start the duration ticker, and arm the
    /// recording auto-start after its grace period.
    fn mark_connected(&self, epoch: u64) {
        {
            let mut status = self.inner.status.lock();
            if *status == CallStatus::Connected {
                return;
            }
            *status = CallStatus::Connected;
        }
        let _ = self
            .inner
            .events
            .send(CallEvent::StatusChanged(CallStatus::Connected));

        let session = self.clone();
        let timer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if session.inner.epoch.load(Ordering::SeqCst) != epoch {
                    break;
                }
                let elapsed = session.inner.duration_secs.fetch_add(1, Ordering::Relaxed) + 1;
                let _ = session.inner.events.send(CallEvent::DurationTick(elapsed));
            }
        });
        if let Some(previous) = self.inner.timer.lock().replace(timer) {
            previous.abort();
        }

        let session = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(AUTO_RECORD_GRACE).await;
            session.maybe_start_recording(epoch);
        });
    }

    /// Start recording iff every precondition holds: auto-record enabled, the
    /// call is connected, both feeds are live, and nothing is recording yet.
    fn maybe_start_recording(&self, epoch: u64) {
        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        if !self.inner.auto_record.load(Ordering::SeqCst) {
            return;
        }
        if *self.inner.status.lock() != CallStatus::Connected {
            return;
        }
        if !self.inner.remote_live.load(Ordering::SeqCst) {
            return;
        }
        let local_tap = match self.inner.local.lock().as_ref() {
            Some(local) => local.tap(),
            None => return,
        };
        let mut recorder = self.inner.recorder.lock();
        if recorder.is_some() {
            return;
        }
        *recorder = Some(CallRecorder::start(&local_tap, &self.inner.remote_tap));
    }

    /// Enable or disable recording auto-start. Enabling mid-call arms the
    /// start check after the usual grace period.
    pub fn set_auto_record(&self, enabled: bool) {
        self.inner.auto_record.store(enabled, Ordering::SeqCst);
        if enabled {
            let epoch = self.inner.epoch.load(Ordering::SeqCst);
            let session = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(AUTO_RECORD_GRACE).await;
                session.maybe_start_recording(epoch);
            });
        }
    }

    /// Hang up: stop recording first so the blob covers the whole call, tell
    /// the peer, then tear the call down.
    pub async fn end_call(&self) {
        self.finish_call(true).await;
    }

    async fn finish_call(&self, notify_peer: bool) {
        let Some(active) = self.inner.active.lock().take() else {
            return;
        };

        let recorder = self.inner.recorder.lock().take();
        let recording = match recorder {
            Some(recorder) => match recorder.stop().await {
                Ok(blob) => Some(blob),
                Err(err) => {
                    // A broken recording never blocks hanging up.
                    tracing::warn!(target: "televisit::record", error = %err, "recording failed");
                    *self.inner.recording_error.lock() = Some(err.to_string());
                    None
                }
            },
            None => None,
        };

        let duration = self.inner.duration_secs.load(Ordering::Relaxed);
        if notify_peer {
            self.send_signal(SignalFrame::CallEnd {
                sender_id: self.inner.user_id.clone(),
                target_id: active.peer_id.clone(),
                consultation_id: active.consultation_id.clone(),
                duration,
            });
        }

        if active.role == CallRole::Responder {
            if let Err(err) = self
                .inner
                .availability
                .set_available(&self.inner.user_id, true)
                .await
            {
                tracing::warn!(target: "televisit::call", error = %err, "failed to restore availability");
            }
        }

        self.reset_call_state().await;
        self.set_status(CallStatus::Ended);
        let _ = self.inner.events.send(CallEvent::Ended {
            consultation_id: active.consultation_id,
            duration,
            recording,
        });
        tracing::info!(target: "televisit::call", duration, "call ended");
    }

    /// Tear down per-call resources. Safe to call repeatedly; the epoch bump
    /// neutralizes any in-flight handler from the old call.
    async fn reset_call_state(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.abort();
        }
        if let Some(recorder) = self.inner.recorder.lock().take() {
            recorder.abort();
        }
        let pc = self.inner.pc.lock().take();
        if let Some(pc) = pc {
            if let Err(err) = pc.close().await {
                tracing::debug!(target: "televisit::call", error = %err, "peer connection close failed");
            }
        }
        if let Some(mut local) = self.inner.local.lock().take() {
            local.stop();
        }
        self.inner.remote_live.store(false, Ordering::SeqCst);
        *self.inner.pending_offer.lock() = None;
    }

    /// Full teardown: end any active call and close the signaling socket.
    pub async fn disconnect(&self) {
        self.finish_call(true).await;
        if let Some(mut channel) = self.inner.signaling.lock().take() {
            channel.close();
        }
        if let Some(dispatch) = self.inner.dispatch.lock().take() {
            dispatch.abort();
        }
        self.set_status(CallStatus::Idle);
    }

    fn send_signal(&self, frame: SignalFrame) -> bool {
        self.inner
            .signaling
            .lock()
            .as_ref()
            .map(|channel| channel.send(frame))
            .unwrap_or(false)
    }

    fn set_status(&self, status: CallStatus) {
        {
            let mut current = self.inner.status.lock();
            if *current == status {
                return;
            }
            *current = status;
        }
        let _ = self.inner.events.send(CallEvent::StatusChanged(status));
    }

    pub fn status(&self) -> CallStatus {
        *self.inner.status.lock()
    }

    pub fn duration_secs(&self) -> u64 {
        self.inner.duration_secs.load(Ordering::Relaxed)
    }

    pub fn is_recording(&self) -> bool {
        self.inner.recorder.lock().is_some()
    }

    /// The last recording failure for this session, if any.
    pub fn recording_error(&self) -> Option<String> {
        self.inner.recording_error.lock().clone()
    }

    pub fn auto_record(&self) -> bool {
        self.inner.auto_record.load(Ordering::SeqCst)
    }

    /// Raw remote media, published by whatever decodes the remote tracks.
    /// The recorder composites from this tap.
    pub fn remote_tap(&self) -> MediaTap {
        self.inner.remote_tap.clone()
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        if let Some(local) = self.inner.local.lock().as_ref() {
            local.set_video_enabled(enabled);
        }
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        if let Some(local) = self.inner.local.lock().as_ref() {
            local.set_audio_enabled(enabled);
        }
    }

    /// Flip the microphone. Returns the new muted state; false when no local
    /// media is up.
    pub fn toggle_mute(&self) -> bool {
        let guard = self.inner.local.lock();
        let Some(local) = guard.as_ref() else {
            return false;
        };
        let enable = !local.audio_enabled();
        local.set_audio_enabled(enable);
        !enable
    }

    /// Flip the camera. Returns the new video-off state; false when no local
    /// media is up.
    pub fn toggle_video(&self) -> bool {
        let guard = self.inner.local.lock();
        let Some(local) = guard.as_ref() else {
            return false;
        };
        let enable = !local.video_enabled();
        local.set_video_enabled(enable);
        !enable
    }

    pub fn is_muted(&self) -> bool {
        self.inner
            .local
            .lock()
            .as_ref()
            .map(|local| !local.audio_enabled())
            .unwrap_or(false)
    }

    pub fn is_video_off(&self) -> bool {
        self.inner
            .local
            .lock()
            .as_ref()
            .map(|local| !local.video_enabled())
            .unwrap_or(false)
    }

    /// True when the local feed is the synthetic pattern rather than a capture
    /// source.
    pub fn is_fallback_video(&self) -> bool {
        self.inner
            .local
            .lock()
            .as_ref()
            .map(|local| local.is_fallback())
            .unwrap_or(false)
    }
}
