//! In-memory devices for tests and offline runs.
//!
//! Microphone chunks are pushed by the caller; every frame written to the
//! speaker is forwarded to the receiver returned by [`MemoryDevices::new`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use voxline_core::error::{Result, VoxlineError};
use voxline_core::types::AudioFrame;

use crate::devices::{AudioDevices, MicrophoneSource, SpeakerSink};

#[derive(Clone)]
pub struct MemoryDevices {
    inner: Arc<Inner>,
}

struct Inner {
    mic_tx: mpsc::UnboundedSender<Vec<u8>>,
    mic_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    played: mpsc::UnboundedSender<AudioFrame>,
    reads: AtomicUsize,
    held: AtomicUsize,
    min_buffer: AtomicUsize,
    write_delay_ms: AtomicU64,
    fail_microphone: AtomicBool,
    fail_speaker: AtomicBool,
    fail_next_read: AtomicBool,
}

impl MemoryDevices {
    /// Devices plus the receiver of every frame the speaker played.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AudioFrame>) {
        let (mic_tx, mic_rx) = mpsc::unbounded_channel();
        let (played, played_rx) = mpsc::unbounded_channel();
        let inner = Inner {
            mic_tx,
            mic_rx: Mutex::new(Some(mic_rx)),
            played,
            reads: AtomicUsize::new(0),
            held: AtomicUsize::new(0),
            min_buffer: AtomicUsize::new(640),
            write_delay_ms: AtomicU64::new(0),
            fail_microphone: AtomicBool::new(false),
            fail_speaker: AtomicBool::new(false),
            fail_next_read: AtomicBool::new(false),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            played_rx,
        )
    }

    /// Queue bytes for the microphone to deliver (one chunk per read).
    pub fn push_microphone(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self.inner.mic_tx.send(bytes.into());
    }

    /// Reads performed by the microphone so far, including empty ones.
    pub fn microphone_reads(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    /// Devices currently open.
    pub fn devices_held(&self) -> usize {
        self.inner.held.load(Ordering::SeqCst)
    }

    pub fn set_min_buffer(&self, bytes: usize) {
        self.inner.min_buffer.store(bytes, Ordering::SeqCst);
    }

    /// Make every speaker write take this long.
    pub fn set_write_delay(&self, delay: Duration) {
        self.inner
            .write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_microphone_open(&self) {
        self.inner.fail_microphone.store(true, Ordering::SeqCst);
    }

    pub fn fail_speaker_open(&self) {
        self.inner.fail_speaker.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_read(&self) {
        self.inner.fail_next_read.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl AudioDevices for MemoryDevices {
    async fn open_microphone(&self) -> Result<Box<dyn MicrophoneSource>> {
        if self.inner.fail_microphone.load(Ordering::SeqCst) {
            return Err(VoxlineError::Resource("microphone unavailable".into()));
        }
        let chunks = self
            .inner
            .mic_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| VoxlineError::Resource("microphone already in use".into()))?;
        self.inner.held.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryMicrophone {
            inner: self.inner.clone(),
            chunks: Some(chunks),
        }))
    }

    async fn open_speaker(&self) -> Result<Box<dyn SpeakerSink>> {
        if self.inner.fail_speaker.load(Ordering::SeqCst) {
            return Err(VoxlineError::Resource("speaker unavailable".into()));
        }
        self.inner.held.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySpeaker {
            inner: self.inner.clone(),
        }))
    }
}

struct MemoryMicrophone {
    inner: Arc<Inner>,
    chunks: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait]
impl MicrophoneSource for MemoryMicrophone {
    fn min_buffer_size(&self) -> usize {
        self.inner.min_buffer.load(Ordering::SeqCst)
    }

    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_next_read.swap(false, Ordering::SeqCst) {
            return Err(VoxlineError::Resource("microphone read failed".into()));
        }
        let Some(chunk) = self.chunks.as_mut().and_then(|rx| rx.try_recv().ok()) else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        Ok(n)
    }

    async fn stop(&mut self) {}
}

impl Drop for MemoryMicrophone {
    fn drop(&mut self) {
        // hand the unread chunks back for the next open
        if let (Some(chunks), Ok(mut slot)) = (self.chunks.take(), self.inner.mic_rx.try_lock()) {
            *slot = Some(chunks);
        }
        self.inner.held.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemorySpeaker {
    inner: Arc<Inner>,
}

#[async_trait]
impl SpeakerSink for MemorySpeaker {
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, frame: &AudioFrame) -> Result<()> {
        let delay = self.inner.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let _ = self.inner.played.send(frame.clone());
        Ok(())
    }

    async fn stop(&mut self) {}
}

impl Drop for MemorySpeaker {
    fn drop(&mut self) {
        self.inner.held.fetch_sub(1, Ordering::SeqCst);
    }
}
