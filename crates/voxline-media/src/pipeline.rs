//! Capture and playback loops for one call.
//!
//! Phase and mute live in one [`PipelineState`] behind a `watch` channel.
//! Capture runs iff the phase is Running and the pipeline is not muted;
//! playback drains its FIFO in every phase until the pipeline stops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use voxline_core::config::AudioConfig;
use voxline_core::error::{Result, VoxlineError};
use voxline_core::types::AudioFrame;

use crate::devices::{AudioDevices, BYTES_PER_SECOND, MicrophoneSource, SpeakerSink};
use crate::fallback::SpeechSynthesizer;
use crate::level::LevelMeter;

/// Log one warning per this many shed playback frames.
const SHED_WARN_EVERY: u64 = 250;

/// Where captured frames go (the streaming session).
pub trait AudioUplink: Send + Sync {
    fn send_audio(&self, frame: AudioFrame);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Running,
    /// Call on hold: capture stopped, playback continues.
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineState {
    pub phase: Phase,
    pub muted: bool,
}

impl PipelineState {
    pub fn capturing(&self) -> bool {
        self.phase == Phase::Running && !self.muted
    }
}

pub struct AudioPipeline {
    config: AudioConfig,
    devices: Arc<dyn AudioDevices>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    uplink: Arc<dyn AudioUplink>,
    state: watch::Sender<PipelineState>,
    cancel: CancellationToken,
    playback_tx: mpsc::UnboundedSender<AudioFrame>,
    playback_rx: Mutex<Option<mpsc::UnboundedReceiver<AudioFrame>>>,
    /// Set once a speaker is open and its worker runs.
    playback_ready: AtomicBool,
    /// Frames queued or being written.
    pending: Arc<AtomicUsize>,
    shed: AtomicU64,
    held: Arc<AtomicUsize>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Counts an open device for as long as it lives.
struct DeviceGuard(Arc<AtomicUsize>);

impl DeviceGuard {
    fn new(held: &Arc<AtomicUsize>) -> Self {
        held.fetch_add(1, Ordering::SeqCst);
        Self(held.clone())
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AudioPipeline {
    pub fn new(
        config: AudioConfig,
        devices: Arc<dyn AudioDevices>,
        synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
        uplink: Arc<dyn AudioUplink>,
    ) -> Self {
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(PipelineState::default());
        Self {
            config,
            devices,
            synthesizer,
            uplink,
            state,
            cancel: CancellationToken::new(),
            playback_tx,
            playback_rx: Mutex::new(Some(playback_rx)),
            playback_ready: AtomicBool::new(false),
            pending: Arc::new(AtomicUsize::new(0)),
            shed: AtomicU64::new(0),
            held: Arc::new(AtomicUsize::new(0)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// True while any device is open.
    pub fn holds_devices(&self) -> bool {
        self.held.load(Ordering::SeqCst) > 0
    }

    /// Frames queued for the speaker or being written.
    pub fn pending_playback(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Open the devices and start both loops.
    ///
    /// A device that cannot be opened is logged and skipped; the pipeline
    /// still starts. Starting twice is a no-op, starting a stopped pipeline
    /// is an error.
    pub async fn start(&self) -> Result<()> {
        let mut previous = Phase::Idle;
        let claimed = self.state.send_if_modified(|state| {
            previous = state.phase;
            if state.phase == Phase::Idle {
                state.phase = Phase::Running;
                true
            } else {
                false
            }
        });
        if !claimed {
            if previous == Phase::Stopped {
                return Err(VoxlineError::Resource("audio pipeline already stopped".into()));
            }
            warn!(phase = ?previous, "Audio pipeline already started");
            return Ok(());
        }

        let mut tasks = self.tasks.lock().await;

        match self.open_microphone().await {
            Ok(mic) => {
                let chunk = capture_chunk_size(mic.min_buffer_size(), self.config.buffer_multiplier);
                info!(chunk_bytes = chunk, "Capture started");
                tasks.push(tokio::spawn(capture_loop(CaptureLoop {
                    mic,
                    guard: DeviceGuard::new(&self.held),
                    uplink: self.uplink.clone(),
                    state: self.state.subscribe(),
                    cancel: self.cancel.child_token(),
                    chunk,
                    interval: self.config.capture_interval(),
                    meter: LevelMeter::new(self.config.telemetry_sample_rate),
                })));
            }
            Err(e) => {
                error!(error = %e, kind = e.kind(), "Microphone unavailable; continuing without capture");
            }
        }

        match self.open_speaker().await {
            Ok(speaker) => {
                if let Some(rx) = self.playback_rx.lock().await.take() {
                    self.playback_ready.store(true, Ordering::SeqCst);
                    tasks.push(tokio::spawn(playback_loop(
                        speaker,
                        DeviceGuard::new(&self.held),
                        rx,
                        self.pending.clone(),
                        self.cancel.child_token(),
                    )));
                    info!("Playback started");
                }
            }
            Err(e) => {
                error!(error = %e, kind = e.kind(), "Speaker unavailable; inbound audio will be discarded");
            }
        }

        Ok(())
    }

    async fn open_microphone(&self) -> Result<Box<dyn MicrophoneSource>> {
        let mut mic = self.devices.open_microphone().await?;
        mic.start().await?;
        Ok(mic)
    }

    async fn open_speaker(&self) -> Result<Box<dyn SpeakerSink>> {
        let mut speaker = self.devices.open_speaker().await?;
        speaker.start().await?;
        Ok(speaker)
    }

    /// Stop capture (call on hold). Playback keeps draining.
    pub fn pause(&self) {
        self.transition(Phase::Running, Phase::Paused);
    }

    /// Resume capture after [`pause`](Self::pause).
    pub fn resume(&self) {
        self.transition(Phase::Paused, Phase::Running);
    }

    fn transition(&self, from: Phase, to: Phase) {
        let moved = self.state.send_if_modified(|state| {
            if state.phase == from {
                state.phase = to;
                true
            } else {
                false
            }
        });
        if moved {
            debug!(from = ?from, to = ?to, "Audio pipeline phase");
        }
    }

    /// Stop or restart capture without touching playback.
    pub fn set_muted(&self, muted: bool) {
        let changed = self.state.send_if_modified(|state| {
            if state.phase == Phase::Stopped || state.muted == muted {
                false
            } else {
                state.muted = muted;
                true
            }
        });
        if changed {
            debug!(muted, "Microphone mute");
        }
    }

    /// Queue an inbound frame for the speaker (FIFO).
    pub fn play(&self, frame: AudioFrame) {
        if self.state().phase == Phase::Stopped {
            return;
        }
        if !self.playback_ready.load(Ordering::SeqCst) {
            debug!(bytes = frame.len(), "No speaker; discarding inbound audio");
            return;
        }

        let max = self.config.max_playback_frames;
        if max > 0 && self.pending.load(Ordering::SeqCst) >= max {
            let shed = self.shed.fetch_add(1, Ordering::SeqCst) + 1;
            if shed % SHED_WARN_EVERY == 1 {
                warn!(shed, max, "Playback queue full; shedding frames");
            }
            return;
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.playback_tx.send(frame).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Speak a text response locally if fallback is enabled, a synthesizer
    /// exists and the speaker is idle. Returns whether speech was started.
    pub async fn speak_fallback(&self, text: &str) -> bool {
        if !self.config.speech_fallback {
            return false;
        }
        let Some(synthesizer) = self.synthesizer.clone() else {
            return false;
        };
        if matches!(self.state().phase, Phase::Idle | Phase::Stopped) {
            return false;
        }
        if self.pending_playback() > 0 {
            debug!("Speaker busy; skipping speech fallback");
            return false;
        }

        let text = text.to_string();
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = synthesizer.speak(&text) => {
                    if let Err(e) = result {
                        warn!(error = %e, "Speech fallback failed");
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        true
    }

    /// Release both devices and end every loop. Idempotent.
    pub async fn stop(&self) {
        let mut previous = Phase::Stopped;
        self.state.send_if_modified(|state| {
            previous = state.phase;
            if state.phase == Phase::Stopped {
                false
            } else {
                state.phase = Phase::Stopped;
                true
            }
        });
        self.cancel.cancel();
        self.playback_ready.store(false, Ordering::SeqCst);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Audio task panicked");
                }
            }
        }

        if previous != Phase::Stopped {
            if let Some(synthesizer) = &self.synthesizer {
                synthesizer.stop().await;
            }
            info!("Audio pipeline stopped");
        }
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Capture chunk size in bytes: device minimum (or one second of audio when
/// the device does not say) times the multiplier.
pub fn capture_chunk_size(min_buffer: usize, multiplier: usize) -> usize {
    let base = if min_buffer == 0 {
        BYTES_PER_SECOND
    } else {
        min_buffer
    };
    base * multiplier.max(1)
}

struct CaptureLoop {
    mic: Box<dyn MicrophoneSource>,
    guard: DeviceGuard,
    uplink: Arc<dyn AudioUplink>,
    state: watch::Receiver<PipelineState>,
    cancel: CancellationToken,
    chunk: usize,
    interval: Duration,
    meter: LevelMeter,
}

async fn wait_until(
    state: &mut watch::Receiver<PipelineState>,
    f: impl FnMut(&PipelineState) -> bool,
) -> Option<PipelineState> {
    state.wait_for(f).await.ok().map(|s| *s)
}

async fn capture_loop(mut ctx: CaptureLoop) {
    let mut buf = vec![0u8; ctx.chunk];
    let mut frames = 0u64;

    loop {
        let ready = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            state = wait_until(&mut ctx.state, |s| s.capturing() || s.phase == Phase::Stopped) => state,
        };
        if !ready.is_some_and(|s| s.capturing()) {
            break;
        }

        let read = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            _ = wait_until(&mut ctx.state, |s| !s.capturing()) => continue,
            read = ctx.mic.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {}
            Ok(n) => {
                let frame = AudioFrame::from(&buf[..n]);
                ctx.meter.observe(&frame);
                ctx.uplink.send_audio(frame);
                frames += 1;
            }
            Err(e) => {
                error!(error = %e, kind = e.kind(), "Microphone read failed; capture stopped");
                break;
            }
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(ctx.interval) => {}
        }
    }

    ctx.mic.stop().await;
    drop(ctx.mic);
    drop(ctx.guard);
    debug!(frames, "Capture loop finished");
}

async fn playback_loop(
    mut speaker: Box<dyn SpeakerSink>,
    guard: DeviceGuard,
    mut frames: mpsc::UnboundedReceiver<AudioFrame>,
    pending: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let mut played = 0u64;

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = speaker.write(&frame) => result,
        };
        pending.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(()) => played += 1,
            Err(e) => warn!(error = %e, bytes = frame.len(), "Speaker write failed; frame dropped"),
        }
    }

    speaker.stop().await;
    drop(speaker);
    drop(guard);
    debug!(played, "Playback loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_chunk_size() {
        assert_eq!(capture_chunk_size(640, 2), 1280);
        assert_eq!(capture_chunk_size(0, 2), 64_000);
        assert_eq!(capture_chunk_size(640, 0), 640);
    }

    #[test]
    fn test_capturing_predicate() {
        let mut state = PipelineState::default();
        assert!(!state.capturing());
        state.phase = Phase::Running;
        assert!(state.capturing());
        state.muted = true;
        assert!(!state.capturing());
        state.muted = false;
        state.phase = Phase::Paused;
        assert!(!state.capturing());
    }
}
