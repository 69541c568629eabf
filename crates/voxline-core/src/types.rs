use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Sample rate of every frame on the wire and in the devices.
pub const SAMPLE_RATE_HZ: u32 = 16_000;

/// Mime type tag for outbound PCM chunks.
pub const PCM_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// A chunk of 16-bit little-endian mono PCM.
///
/// Frames are immutable once built; cloning shares the underlying bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct AudioFrame(Arc<[u8]>);

impl AudioFrame {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decode the frame into samples. A trailing odd byte is ignored.
    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.0
            .chunks_exact(2)
            .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
    }

    /// Build a frame from samples.
    pub fn from_samples(samples: &[i16]) -> Self {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self::from(bytes)
    }

    /// Playback duration at [`SAMPLE_RATE_HZ`].
    pub fn duration_ms(&self) -> u64 {
        (self.0.len() as u64 / 2) * 1000 / SAMPLE_RATE_HZ as u64
    }
}

impl From<Vec<u8>> for AudioFrame {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

impl From<&[u8]> for AudioFrame {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }
}

impl fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AudioFrame({} bytes)", self.0.len())
    }
}

/// Notifications from a streaming session, in transport order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The transport is open and the setup envelope has been sent.
    Connected,
    /// The session reached its terminal state.
    Disconnected,
    /// Text from one inbound message. `with_audio` is set when the same
    /// message also carried audio.
    TextResponse { text: String, with_audio: bool },
    AudioResponse(AudioFrame),
    /// Well-formed error payload from the service; the connection stays open.
    ServerError(String),
    ConfigurationError(String),
    TransportError(String),
    /// A structured frame could not be parsed; the connection stays open.
    ProtocolError(String),
}

impl SessionEvent {
    /// Text response from a message that carried no audio.
    pub fn text(text: impl Into<String>) -> Self {
        Self::TextResponse {
            text: text.into(),
            with_audio: false,
        }
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::TextResponse { .. } => "text",
            Self::AudioResponse(_) => "audio",
            Self::ServerError(_) => "server_error",
            Self::ConfigurationError(_) => "configuration_error",
            Self::TransportError(_) => "transport_error",
            Self::ProtocolError(_) => "protocol_error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::ServerError(_)
                | Self::ConfigurationError(_)
                | Self::TransportError(_)
                | Self::ProtocolError(_)
        )
    }
}

/// Which side placed the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incoming => f.write_str("incoming"),
            Self::Outgoing => f.write_str("outgoing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_samples_little_endian() {
        let frame = AudioFrame::from(vec![0x01, 0x00, 0xff, 0xff, 0x7f]);
        let samples: Vec<i16> = frame.samples().collect();
        assert_eq!(samples, vec![1, -1]);
        assert_eq!(frame.len(), 5);
    }

    #[test]
    fn test_frame_from_samples() {
        let frame = AudioFrame::from_samples(&[100, -100]);
        assert_eq!(frame.as_bytes(), &[100, 0, 156, 255]);
        assert_eq!(frame.samples().collect::<Vec<_>>(), vec![100, -100]);
    }

    #[test]
    fn test_frame_duration() {
        // 320 samples at 16 kHz = 20 ms
        let frame = AudioFrame::from(vec![0u8; 640]);
        assert_eq!(frame.duration_ms(), 20);
    }

    #[test]
    fn test_frame_clone_shares_bytes() {
        let frame = AudioFrame::from(vec![1u8, 2, 3]);
        let copy = frame.clone();
        assert_eq!(frame.as_bytes().as_ptr(), copy.as_bytes().as_ptr());
        assert_eq!(format!("{copy:?}"), "AudioFrame(3 bytes)");
    }

    #[test]
    fn test_event_kinds() {
        assert_eq!(SessionEvent::Connected.kind(), "connected");
        assert!(SessionEvent::ServerError("x".into()).is_error());
        assert!(!SessionEvent::text("x").is_error());
    }
}
