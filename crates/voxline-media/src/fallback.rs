//! On-device speech synthesis seam, used when the service answers in text only.

use async_trait::async_trait;
use tracing::info;

use voxline_core::error::Result;

/// Speaks text on a path independent of the playback queue.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Speak `text`, resolving once the utterance finished.
    async fn speak(&self, text: &str) -> Result<()>;

    /// Interrupt any utterance in progress.
    async fn stop(&self);
}

/// Synthesizer for headless runs: writes the utterance to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSynthesizer;

#[async_trait]
impl SpeechSynthesizer for LogSynthesizer {
    async fn speak(&self, text: &str) -> Result<()> {
        info!(target: "voxline::speech", "{text}");
        Ok(())
    }

    async fn stop(&self) {}
}
