//! Audio device seam and file-backed devices.
//!
//! Devices speak 16-bit little-endian mono PCM at 16 kHz. The file-backed
//! pair reads a raw PCM file as the microphone and appends everything played
//! to another raw PCM file, both paced to real time.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use voxline_core::error::{Result, VoxlineError};
use voxline_core::types::{AudioFrame, SAMPLE_RATE_HZ};

/// Bytes per second of PCM16 mono at [`SAMPLE_RATE_HZ`].
pub const BYTES_PER_SECOND: usize = SAMPLE_RATE_HZ as usize * 2;

#[async_trait]
pub trait MicrophoneSource: Send {
    /// Smallest read size the device supports, in bytes. `0` if unknown.
    fn min_buffer_size(&self) -> usize;

    async fn start(&mut self) -> Result<()>;

    /// Read up to `buf.len()` bytes. `Ok(0)` means nothing is available yet,
    /// never end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    async fn stop(&mut self);
}

#[async_trait]
pub trait SpeakerSink: Send {
    async fn start(&mut self) -> Result<()>;

    /// Play one frame; resolves when the device accepted it.
    async fn write(&mut self, frame: &AudioFrame) -> Result<()>;

    async fn stop(&mut self);
}

/// Opens the hardware for one call.
#[async_trait]
pub trait AudioDevices: Send + Sync {
    async fn open_microphone(&self) -> Result<Box<dyn MicrophoneSource>>;
    async fn open_speaker(&self) -> Result<Box<dyn SpeakerSink>>;
}

/// File-backed devices. A missing path means the device is unavailable.
#[derive(Debug, Clone, Default)]
pub struct FileDevices {
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

impl FileDevices {
    pub fn new(input: Option<PathBuf>, output: Option<PathBuf>) -> Self {
        Self { input, output }
    }
}

#[async_trait]
impl AudioDevices for FileDevices {
    async fn open_microphone(&self) -> Result<Box<dyn MicrophoneSource>> {
        let path = self
            .input
            .as_ref()
            .ok_or_else(|| VoxlineError::Resource("no microphone input file configured".into()))?;
        let file = File::open(path).await.map_err(|e| {
            VoxlineError::Resource(format!("cannot open microphone file {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "Opened file microphone");
        Ok(Box::new(FileMicrophone::new(file)))
    }

    async fn open_speaker(&self) -> Result<Box<dyn SpeakerSink>> {
        let path = self
            .output
            .as_ref()
            .ok_or_else(|| VoxlineError::Resource("no speaker output file configured".into()))?;
        let file = File::create(path).await.map_err(|e| {
            VoxlineError::Resource(format!("cannot create speaker file {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "Opened file speaker");
        Ok(Box::new(FileSpeaker::new(file)))
    }
}

/// Reads a raw PCM file no faster than real time. Silent once exhausted.
pub struct FileMicrophone {
    file: File,
    started: Option<Instant>,
    delivered: usize,
    exhausted: bool,
}

impl FileMicrophone {
    /// 20 ms of audio.
    pub const MIN_BUFFER: usize = BYTES_PER_SECOND / 50;

    pub fn new(file: File) -> Self {
        Self {
            file,
            started: None,
            delivered: 0,
            exhausted: false,
        }
    }
}

#[async_trait]
impl MicrophoneSource for FileMicrophone {
    fn min_buffer_size(&self) -> usize {
        Self::MIN_BUFFER
    }

    async fn start(&mut self) -> Result<()> {
        self.started = Some(Instant::now());
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(started) = self.started else {
            return Err(VoxlineError::Resource("microphone not started".into()));
        };
        if self.exhausted {
            return Ok(0);
        }

        let due = (started.elapsed().as_secs_f64() * BYTES_PER_SECOND as f64) as usize;
        // keep reads sample aligned
        let budget = due.saturating_sub(self.delivered).min(buf.len()) & !1;
        if budget == 0 {
            return Ok(0);
        }

        let n = self.file.read(&mut buf[..budget]).await?;
        if n == 0 {
            info!(bytes = self.delivered, "Microphone file exhausted");
            self.exhausted = true;
        }
        self.delivered += n;
        Ok(n)
    }

    async fn stop(&mut self) {
        self.started = None;
    }
}

/// Appends played audio to a raw PCM file, taking as long as the audio lasts.
pub struct FileSpeaker {
    file: File,
    written: usize,
}

impl FileSpeaker {
    pub fn new(file: File) -> Self {
        Self { file, written: 0 }
    }
}

#[async_trait]
impl SpeakerSink for FileSpeaker {
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, frame: &AudioFrame) -> Result<()> {
        self.file.write_all(frame.as_bytes()).await?;
        self.written += frame.len();
        tokio::time::sleep(Duration::from_millis(frame.duration_ms())).await;
        Ok(())
    }

    async fn stop(&mut self) {
        if let Err(e) = self.file.flush().await {
            debug!(error = %e, "Speaker file flush failed");
        }
        debug!(bytes = self.written, "File speaker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_paths_are_resource_errors() {
        let devices = FileDevices::default();
        assert!(matches!(
            devices.open_microphone().await,
            Err(VoxlineError::Resource(_))
        ));
        assert!(matches!(
            devices.open_speaker().await,
            Err(VoxlineError::Resource(_))
        ));
    }

    #[tokio::test]
    async fn test_file_microphone_paced_then_silent() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("mic.pcm");
        // 40 ms of audio
        std::fs::write(&input, vec![7u8; 1280]).unwrap();

        let devices = FileDevices::new(Some(input), None);
        let mut mic = devices.open_microphone().await.unwrap();
        assert_eq!(mic.min_buffer_size(), 640);

        let mut buf = vec![0u8; 4096];
        assert!(mic.read(&mut buf).await.is_err(), "reads require start");
        mic.start().await.unwrap();

        let mut total = 0;
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            let n = mic.read(&mut buf).await.unwrap();
            assert!(n % 2 == 0);
            total += n;
            if total == 1280 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(total, 1280);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mic.read(&mut buf).await.unwrap(), 0);
        assert_eq!(mic.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_file_speaker_writes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("speaker.pcm");
        let devices = FileDevices::new(None, Some(output.clone()));

        let mut speaker = devices.open_speaker().await.unwrap();
        speaker.start().await.unwrap();
        speaker.write(&AudioFrame::from(vec![1u8; 32])).await.unwrap();
        speaker.write(&AudioFrame::from(vec![2u8; 32])).await.unwrap();
        speaker.stop().await;

        let written = std::fs::read(&output).unwrap();
        assert_eq!(written.len(), 64);
        assert!(written[..32].iter().all(|&b| b == 1));
        assert!(written[32..].iter().all(|&b| b == 2));
    }
}
