//! Audio pipeline: capture loop, playback loop, loudness telemetry, speech fallback.

pub mod devices;
pub mod fallback;
pub mod level;
pub mod memory;
pub mod pipeline;

pub use devices::{AudioDevices, FileDevices, MicrophoneSource, SpeakerSink};
pub use fallback::{LogSynthesizer, SpeechSynthesizer};
pub use pipeline::{AudioPipeline, AudioUplink, Phase, PipelineState};
