//! In-call recording.
//!
//! The recorder subscribes to the raw media taps of both call legs and
//! composites them into one picture-in-picture stream: the remote feed fills
//! the frame, the local feed is inset top-right at a third of the width.
//! Output is assembled in memory as an uncompressed Y4M video blob plus a WAV
//! audio blob; storage and upload of the blob are the embedder's concern.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::call::media::{MediaTap, PcmChunk, VideoFrame, FRAME_RATE, SAMPLE_RATE};

/// Output dimensions match the nominal capture size.
pub const OUTPUT_WIDTH: u32 = 640;
pub const OUTPUT_HEIGHT: u32 = 480;
/// Margin between the inset and the frame edge, in pixels.
pub const PIP_MARGIN: u32 = 20;
/// Buffered media is flushed into the blob once per second.
const CHUNK_FLUSH: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("recording worker terminated unexpectedly")]
    WorkerLost,
    #[error("recording produced no frames")]
    Empty,
}

/// A finished recording, ready for upload.
#[derive(Debug, Clone)]
pub struct RecordingBlob {
    pub video_y4m: Vec<u8>,
    pub audio_wav: Vec<u8>,
    pub frame_count: u64,
}

struct Worker {
    remote_frames: broadcast::Receiver<VideoFrame>,
    local_frames: broadcast::Receiver<VideoFrame>,
    remote_audio: broadcast::Receiver<PcmChunk>,
    local_audio: broadcast::Receiver<PcmChunk>,
    last_remote: Option<VideoFrame>,
    last_local: Option<VideoFrame>,
    pending_video: Vec<u8>,
    pending_audio: Vec<i16>,
    video_out: Vec<u8>,
    audio_out: Vec<i16>,
    frame_count: u64,
}

impl Worker {
    fn new(local: &MediaTap, remote: &MediaTap) -> Self {
        Self {
            remote_frames: remote.subscribe_frames(),
            local_frames: local.subscribe_frames(),
            remote_audio: remote.subscribe_audio(),
            local_audio: local.subscribe_audio(),
            last_remote: None,
            last_local: None,
            pending_video: y4m_header(OUTPUT_WIDTH, OUTPUT_HEIGHT, FRAME_RATE),
            pending_audio: Vec::new(),
            video_out: Vec::new(),
            audio_out: Vec::new(),
            frame_count: 0,
        }
    }

    async fn run(mut self, stop: Arc<AtomicBool>) -> Result<RecordingBlob, RecordError> {
        let mut frame_tick = tokio::time::interval(Duration::from_secs(1) / FRAME_RATE);
        frame_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut flush_tick = tokio::time::interval(CHUNK_FLUSH);

        while !stop.load(Ordering::Acquire) {
            tokio::select! {
                _ = frame_tick.tick() => self.capture_frame(),
                _ = flush_tick.tick() => self.flush_chunk(),
            }
        }
        self.capture_frame();
        self.flush_chunk();

        if self.frame_count == 0 {
            return Err(RecordError::Empty);
        }
        Ok(RecordingBlob {
            video_y4m: self.video_out,
            audio_wav: wav_from_pcm(&self.audio_out, SAMPLE_RATE),
            frame_count: self.frame_count,
        })
    }

    fn capture_frame(&mut self) {
        if let Some(frame) = drain_latest(&mut self.remote_frames) {
            self.last_remote = Some(frame);
        }
        if let Some(frame) = drain_latest(&mut self.local_frames) {
            self.last_local = Some(frame);
        }

        let rgba = composite(
            self.last_remote.as_ref(),
            self.last_local.as_ref(),
            OUTPUT_WIDTH,
            OUTPUT_HEIGHT,
        );
        self.pending_video.extend_from_slice(b"FRAME\x0a");
        append_yuv444(&mut self.pending_video, &rgba);
        self.frame_count += 1;

        let remote = drain_audio(&mut self.remote_audio);
        let local = drain_audio(&mut self.local_audio);
        self.pending_audio.extend(mix_pcm(&remote, &local));
    }

    fn flush_chunk(&mut self) {
        self.video_out.append(&mut self.pending_video);
        self.audio_out.append(&mut self.pending_audio);
    }
}

/// Records one call into an in-memory blob. Start it once both taps exist;
/// stopping returns the assembled blob.
pub struct CallRecorder {
    stop: Arc<AtomicBool>,
    worker: JoinHandle<Result<RecordingBlob, RecordError>>,
}

impl CallRecorder {
    pub fn start(local: &MediaTap, remote: &MediaTap) -> Self {
        tracing::info!(target: "televisit::record", "recording started");
        let stop = Arc::new(AtomicBool::new(false));
        let worker = tokio::spawn(Worker::new(local, remote).run(Arc::clone(&stop)));
        Self { stop, worker }
    }

    pub async fn stop(self) -> Result<RecordingBlob, RecordError> {
        self.stop.store(true, Ordering::Release);
        let blob = self.worker.await.map_err(|_| RecordError::WorkerLost)??;
        tracing::info!(
            target: "televisit::record",
            frames = blob.frame_count,
            video_bytes = blob.video_y4m.len(),
            audio_bytes = blob.audio_wav.len(),
            "recording stopped"
        );
        Ok(blob)
    }

    /// Discard the recording without assembling a blob.
    pub fn abort(self) {
        self.stop.store(true, Ordering::Release);
        self.worker.abort();
    }
}

fn drain_latest(rx: &mut broadcast::Receiver<VideoFrame>) -> Option<VideoFrame> {
    let mut latest = None;
    loop {
        match rx.try_recv() {
            Ok(frame) => latest = Some(frame),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    latest
}

fn drain_audio(rx: &mut broadcast::Receiver<PcmChunk>) -> Vec<i16> {
    let mut samples = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(chunk) => samples.extend_from_slice(&chunk.samples),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    samples
}

/// Compose the output frame: remote feed scaled to fill, local feed inset
/// top-right at a third of the output width with a fixed margin. A missing
/// feed leaves its region black.
pub fn composite(
    remote: Option<&VideoFrame>,
    local: Option<&VideoFrame>,
    width: u32,
    height: u32,
) -> Vec<u8> {
    let mut canvas = vec![0u8; (width * height * 4) as usize];
    for px in canvas.chunks_exact_mut(4) {
        px[3] = 0xFF;
    }

    if let Some(remote) = remote {
        let scaled = scale_nearest(remote, width, height);
        canvas.copy_from_slice(&scaled);
    }

    if let Some(local) = local {
        let pip_w = width / 3;
        let pip_h = (u64::from(pip_w) * u64::from(local.height) / u64::from(local.width).max(1)) as u32;
        let pip_h = pip_h.min(height);
        let scaled = scale_nearest(local, pip_w, pip_h);
        let x = width.saturating_sub(pip_w + PIP_MARGIN);
        let y = PIP_MARGIN.min(height.saturating_sub(pip_h));
        blit(&mut canvas, width, &scaled, pip_w, pip_h, x, y);
    }

    canvas
}

/// Nearest-neighbor rescale of an RGBA frame.
fn scale_nearest(frame: &VideoFrame, out_w: u32, out_h: u32) -> Vec<u8> {
    let mut out = vec![0u8; (out_w * out_h * 4) as usize];
    for oy in 0..out_h {
        let sy = (u64::from(oy) * u64::from(frame.height) / u64::from(out_h)) as u32;
        for ox in 0..out_w {
            let sx = (u64::from(ox) * u64::from(frame.width) / u64::from(out_w)) as u32;
            let src = ((sy * frame.width + sx) * 4) as usize;
            let dst = ((oy * out_w + ox) * 4) as usize;
            out[dst..dst + 4].copy_from_slice(&frame.data[src..src + 4]);
        }
    }
    out
}

fn blit(canvas: &mut [u8], canvas_w: u32, src: &[u8], src_w: u32, src_h: u32, x: u32, y: u32) {
    for row in 0..src_h {
        let src_start = (row * src_w * 4) as usize;
        let dst_start = (((y + row) * canvas_w + x) * 4) as usize;
        let len = (src_w * 4) as usize;
        canvas[dst_start..dst_start + len].copy_from_slice(&src[src_start..src_start + len]);
    }
}

/// Mix two mono PCM streams with saturating addition; streams of unequal
/// length are padded with silence.
pub fn mix_pcm(a: &[i16], b: &[i16]) -> Vec<i16> {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let x = a.get(i).copied().unwrap_or(0);
            let y = b.get(i).copied().unwrap_or(0);
            x.saturating_add(y)
        })
        .collect()
}

fn y4m_header(width: u32, height: u32, fps: u32) -> Vec<u8> {
    format!("YUV4MPEG2 W{width} H{height} F{fps}:1 Ip A1:1 C444\x0a").into_bytes()
}

/// Append one RGBA frame as planar YUV 4:4:4 (BT.601 full range).
fn append_yuv444(out: &mut Vec<u8>, rgba: &[u8]) {
    let pixels = rgba.len() / 4;
    let base = out.len();
    out.resize(base + pixels * 3, 0);
    let (rest, v_plane) = out[base..].split_at_mut(pixels * 2);
    let (y_plane, u_plane) = rest.split_at_mut(pixels);
    for (i, px) in rgba.chunks_exact(4).enumerate() {
        let (r, g, b) = (f32::from(px[0]), f32::from(px[1]), f32::from(px[2]));
        y_plane[i] = (0.299 * r + 0.587 * g + 0.114 * b).clamp(0.0, 255.0) as u8;
        u_plane[i] = (128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b).clamp(0.0, 255.0) as u8;
        v_plane[i] = (128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b).clamp(0.0, 255.0) as u8;
    }
}

/// Wrap mono 16-bit PCM in a standard 44-byte WAV header.
fn wav_from_pcm(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> VideoFrame {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..width * height {
            data.extend_from_slice(&[rgb[0], rgb[1], rgb[2], 0xFF]);
        }
        VideoFrame {
            width,
            height,
            data: Arc::new(data),
        }
    }

    fn pixel(canvas: &[u8], width: u32, x: u32, y: u32) -> [u8; 3] {
        let i = ((y * width + x) * 4) as usize;
        [canvas[i], canvas[i + 1], canvas[i + 2]]
    }

    #[test]
    fn composite_places_local_inset_top_right() {
        let remote = solid(320, 240, [0, 0, 255]);
        let local = solid(320, 240, [255, 0, 0]);
        let canvas = composite(Some(&remote), Some(&local), OUTPUT_WIDTH, OUTPUT_HEIGHT);

        // Remote fills the background.
        assert_eq!(pixel(&canvas, OUTPUT_WIDTH, 5, OUTPUT_HEIGHT - 5), [0, 0, 255]);

        // Inset region: width/3 wide, 20px off the top-right corner.
        let pip_w = OUTPUT_WIDTH / 3;
        let inset_x = OUTPUT_WIDTH - pip_w - PIP_MARGIN + 1;
        let inset_y = PIP_MARGIN + 1;
        assert_eq!(pixel(&canvas, OUTPUT_WIDTH, inset_x, inset_y), [255, 0, 0]);

        // Just outside the inset margin is still remote.
        assert_eq!(pixel(&canvas, OUTPUT_WIDTH, OUTPUT_WIDTH - 5, 5), [0, 0, 255]);
    }

    #[test]
    fn composite_without_remote_is_black_behind_inset() {
        let local = solid(640, 480, [0, 255, 0]);
        let canvas = composite(None, Some(&local), OUTPUT_WIDTH, OUTPUT_HEIGHT);
        assert_eq!(pixel(&canvas, OUTPUT_WIDTH, 5, 5), [0, 0, 0]);
        let inset_x = OUTPUT_WIDTH - OUTPUT_WIDTH / 3 - PIP_MARGIN + 1;
        assert_eq!(pixel(&canvas, OUTPUT_WIDTH, inset_x, PIP_MARGIN + 1), [0, 255, 0]);
    }

    #[test]
    fn mix_saturates_instead_of_wrapping() {
        let a = [i16::MAX, -10, 100];
        let b = [100, i16::MIN, 0, 7];
        let mixed = mix_pcm(&a, &b);
        assert_eq!(mixed, vec![i16::MAX, i16::MIN, 100, 7]);
    }

    #[test]
    fn wav_header_describes_mono_16bit_pcm() {
        let wav = wav_from_pcm(&[0, 1, -1], 48_000);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..16], b"WAVEfmt ");
        assert_eq!(u16::from_le_bytes([wav[22], wav[23]]), 1); // channels
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 48_000);
        assert_eq!(wav.len(), 44 + 6);
    }

    #[test]
    fn y4m_header_carries_geometry_and_rate() {
        let header = y4m_header(640, 480, 30);
        assert_eq!(header, b"YUV4MPEG2 W640 H480 F30:1 Ip A1:1 C444\x0a");
    }

    #[tokio::test(start_paused = true)]
    async fn recorder_captures_published_frames() {
        let local = MediaTap::new();
        let remote = MediaTap::new();
        let recorder = CallRecorder::start(&local, &remote);

        for _ in 0..10 {
            remote.publish_frame(solid(OUTPUT_WIDTH, OUTPUT_HEIGHT, [10, 20, 30]));
            local.publish_frame(solid(OUTPUT_WIDTH, OUTPUT_HEIGHT, [200, 0, 0]));
            remote.publish_audio(PcmChunk {
                samples: Arc::new(vec![100i16; 960]),
                sample_rate: SAMPLE_RATE,
            });
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let blob = recorder.stop().await.unwrap();
        assert!(blob.frame_count > 0);
        assert!(blob.video_y4m.starts_with(b"YUV4MPEG2"));
        assert!(blob.audio_wav.len() > 44);
    }
}
