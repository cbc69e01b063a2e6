use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub const VIDEO_WIDTH: u32 = 640;
pub const VIDEO_HEIGHT: u32 = 480;
pub const FRAME_RATE: u32 = 30;
pub const SAMPLE_RATE: u32 = 48_000;

/// Audio is produced in 20ms chunks, the usual opus packet duration.
const AUDIO_CHUNK: Duration = Duration::from_millis(20);
const AUDIO_CHUNK_SAMPLES: usize = (SAMPLE_RATE as usize / 1000) * 20;

/// One raw video frame, tightly packed RGBA.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub data: Arc<Vec<u8>>,
}

/// One chunk of mono PCM audio.
#[derive(Debug, Clone)]
pub struct PcmChunk {
    pub samples: Arc<Vec<i16>>,
    pub sample_rate: u32,
}

/// Fan-out point for raw media. The transport and the recorder subscribe
/// independently; a slow subscriber lags and skips, it never backpressures
/// the producer.
#[derive(Clone)]
pub struct MediaTap {
    frames: broadcast::Sender<VideoFrame>,
    audio: broadcast::Sender<PcmChunk>,
}

impl MediaTap {
    pub fn new() -> Self {
        let (frames, _) = broadcast::channel(8);
        let (audio, _) = broadcast::channel(64);
        Self { frames, audio }
    }

    pub fn publish_frame(&self, frame: VideoFrame) {
        let _ = self.frames.send(frame);
    }

    pub fn publish_audio(&self, chunk: PcmChunk) {
        let _ = self.audio.send(chunk);
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<VideoFrame> {
        self.frames.subscribe()
    }

    pub fn subscribe_audio(&self) -> broadcast::Receiver<PcmChunk> {
        self.audio.subscribe()
    }
}

impl Default for MediaTap {
    fn default() -> Self {
        Self::new()
    }
}

/// One unit of raw media from a source, paced by the source itself.
#[derive(Debug)]
pub enum MediaPacket {
    Video(VideoFrame),
    Audio(PcmChunk),
}

/// A producer of raw local media. The built-in [`SyntheticSource`] stands in
/// when no capture device is wired up; embeddings with real capture provide
/// their own implementation.
#[async_trait]
pub trait MediaSource: Send {
    /// The next packet, or `None` when the source is exhausted.
    async fn next(&mut self) -> Option<MediaPacket>;
}

/// Deterministic test-pattern source: a moving pulse over a gradient, plus
/// silence on the audio rail. Runs at the configured frame rate forever.
pub struct SyntheticSource {
    frame_index: u64,
    next_frame_at: tokio::time::Instant,
    next_audio_at: tokio::time::Instant,
}

impl SyntheticSource {
    pub fn new() -> Self {
        let now = tokio::time::Instant::now();
        Self {
            frame_index: 0,
            next_frame_at: now,
            next_audio_at: now,
        }
    }

    fn render_frame(&self) -> VideoFrame {
        let (w, h) = (VIDEO_WIDTH as usize, VIDEO_HEIGHT as usize);
        let mut data = vec![0u8; w * h * 4];
        let phase = self.frame_index as f32 * 0.1;
        let radius = 50.0 + phase.sin() * 20.0;
        let (cx, cy) = (w as f32 / 2.0, h as f32 / 2.0);
        for y in 0..h {
            for x in 0..w {
                let i = (y * w + x) * 4;
                let dx = x as f32 - cx;
                let dy = y as f32 - cy;
                if (dx * dx + dy * dy).sqrt() < radius {
                    data[i] = 0xE0;
                    data[i + 1] = 0x40;
                    data[i + 2] = 0x40;
                } else {
                    data[i] = (x * 255 / w) as u8;
                    data[i + 1] = (y * 255 / h) as u8;
                    data[i + 2] = 0x60;
                }
                data[i + 3] = 0xFF;
            }
        }
        VideoFrame {
            width: VIDEO_WIDTH,
            height: VIDEO_HEIGHT,
            data: Arc::new(data),
        }
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for SyntheticSource {
    async fn next(&mut self) -> Option<MediaPacket> {
        if self.next_audio_at <= self.next_frame_at {
            tokio::time::sleep_until(self.next_audio_at).await;
            self.next_audio_at += AUDIO_CHUNK;
            return Some(MediaPacket::Audio(PcmChunk {
                samples: Arc::new(vec![0i16; AUDIO_CHUNK_SAMPLES]),
                sample_rate: SAMPLE_RATE,
            }));
        }
        tokio::time::sleep_until(self.next_frame_at).await;
        self.next_frame_at += Duration::from_secs(1) / FRAME_RATE;
        let frame = self.render_frame();
        self.frame_index += 1;
        Some(MediaPacket::Video(frame))
    }
}

/// Local media tracks plus the pump feeding them.
///
/// Track payloads stay unencoded; the tap is the authoritative consumer for
/// recording and preview, the tracks carry the media toward the peer.
pub struct LocalMedia {
    video_track: Arc<TrackLocalStaticSample>,
    audio_track: Arc<TrackLocalStaticSample>,
    video_enabled: Arc<AtomicBool>,
    audio_enabled: Arc<AtomicBool>,
    is_fallback: bool,
    tap: MediaTap,
    pump: Option<JoinHandle<()>>,
}

impl LocalMedia {
    /// Start local media from `source`, falling back to the synthetic test
    /// pattern when none is given. Acquisition itself cannot fail; a dead
    /// source simply stops producing.
    pub fn acquire(source: Option<Box<dyn MediaSource>>) -> Self {
        let is_fallback = source.is_none();
        if is_fallback {
            tracing::info!(target: "televisit::call", "no capture source, using synthetic media");
        }
        let mut source = source.unwrap_or_else(|| Box::new(SyntheticSource::new()));

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "televisit".to_owned(),
        ));
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "televisit".to_owned(),
        ));

        let video_enabled = Arc::new(AtomicBool::new(true));
        let audio_enabled = Arc::new(AtomicBool::new(true));
        let tap = MediaTap::new();

        let pump = {
            let tap = tap.clone();
            let video_track = Arc::clone(&video_track);
            let audio_track = Arc::clone(&audio_track);
            let video_enabled = Arc::clone(&video_enabled);
            let audio_enabled = Arc::clone(&audio_enabled);
            tokio::spawn(async move {
                while let Some(packet) = source.next().await {
                    match packet {
                        MediaPacket::Video(frame) => {
                            if !video_enabled.load(Ordering::Relaxed) {
                                continue;
                            }
                            let sample = Sample {
                                data: Bytes::copy_from_slice(&frame.data),
                                duration: Duration::from_secs(1) / FRAME_RATE,
                                ..Default::default()
                            };
                            tap.publish_frame(frame);
                            // A write error means no transport is bound yet;
                            // the tap keeps flowing regardless.
                            let _ = video_track.write_sample(&sample).await;
                        }
                        MediaPacket::Audio(chunk) => {
                            if !audio_enabled.load(Ordering::Relaxed) {
                                continue;
                            }
                            let mut bytes = Vec::with_capacity(chunk.samples.len() * 2);
                            for s in chunk.samples.iter() {
                                bytes.extend_from_slice(&s.to_le_bytes());
                            }
                            let sample = Sample {
                                data: Bytes::from(bytes),
                                duration: AUDIO_CHUNK,
                                ..Default::default()
                            };
                            tap.publish_audio(chunk);
                            let _ = audio_track.write_sample(&sample).await;
                        }
                    }
                }
            })
        };

        Self {
            video_track,
            audio_track,
            video_enabled,
            audio_enabled,
            is_fallback,
            tap,
            pump: Some(pump),
        }
    }

    pub fn video_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.video_track)
    }

    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.audio_track)
    }

    pub fn tap(&self) -> MediaTap {
        self.tap.clone()
    }

    pub fn is_fallback(&self) -> bool {
        self.is_fallback
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::Relaxed)
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn synthetic_source_interleaves_audio_and_video() {
        let mut source = SyntheticSource::new();
        let mut frames = 0u32;
        let mut chunks = 0u32;
        for _ in 0..20 {
            match source.next().await.unwrap() {
                MediaPacket::Video(frame) => {
                    assert_eq!(frame.width, VIDEO_WIDTH);
                    assert_eq!(frame.data.len(), (VIDEO_WIDTH * VIDEO_HEIGHT * 4) as usize);
                    frames += 1;
                }
                MediaPacket::Audio(chunk) => {
                    assert_eq!(chunk.samples.len(), AUDIO_CHUNK_SAMPLES);
                    assert_eq!(chunk.sample_rate, SAMPLE_RATE);
                    chunks += 1;
                }
            }
        }
        assert!(frames > 0);
        assert!(chunks > 0);
    }

    #[tokio::test]
    async fn disabling_video_stops_tap_frames() {
        let media = LocalMedia::acquire(None);
        assert!(media.is_fallback());

        let mut rx = media.tap().subscribe_frames();
        // Frames flow while enabled.
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame within deadline")
            .expect("frame");

        media.set_video_enabled(false);
        // Drain anything already in flight, then expect silence.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut rx = media.tap().subscribe_frames();
        assert!(
            tokio::time::timeout(Duration::from_millis(200), rx.recv())
                .await
                .is_err()
        );
    }
}
