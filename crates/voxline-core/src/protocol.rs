//! Live service wire protocol.
//!
//! Outbound traffic is JSON text frames with exactly one top-level key
//! (`setup`, `realtimeInput`, `clientContent`). Inbound traffic is either a
//! JSON text frame inspected by top-level key, or a raw binary audio frame.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VoxlineError};
use crate::types::{AudioFrame, PCM_MIME_TYPE};

/// A client -> server envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: ModelRef,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelRef {
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
    Text,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    /// Base64 (standard alphabet, no line wrapping).
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Turn>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub role: String,
    pub parts: Vec<TextPart>,
}

impl ClientMessage {
    /// Session setup: model, AUDIO+TEXT modalities, voice, and system instruction.
    pub fn setup(model: &str, voice: &str, system_instruction: &str) -> Self {
        Self::Setup(Setup {
            model: ModelRef {
                model: model.to_string(),
            },
            generation_config: GenerationConfig {
                response_modalities: vec![Modality::Audio, Modality::Text],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice.to_string(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: system_instruction.to_string(),
                }],
            },
        })
    }

    /// One PCM frame as a single-chunk realtime input.
    pub fn audio(frame: &AudioFrame) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: PCM_MIME_TYPE.to_string(),
                data: STANDARD.encode(frame.as_bytes()),
            }],
        })
    }

    /// One complete user turn.
    pub fn text(text: &str) -> Self {
        Self::ClientContent(ClientContent {
            turns: vec![Turn {
                role: "user".into(),
                parts: vec![TextPart {
                    text: text.to_string(),
                }],
            }],
            turn_complete: true,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// --- Inbound ---

/// Something the session must act on, extracted from one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerSignal {
    Text(String),
    Audio(AudioFrame),
    SetupComplete,
    Error(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<ModelTurn>,
}

#[derive(Debug, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<ServerPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerPart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServerErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Parse one inbound text frame into the signals it carries, in key order
/// `serverContent`, `setupComplete`, `error`. Unknown keys yield nothing.
pub fn parse_server_message(text: &str) -> Result<Vec<ServerSignal>> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| VoxlineError::Protocol(format!("invalid JSON: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| VoxlineError::Protocol("top-level value is not an object".into()))?;

    let mut signals = Vec::new();

    if let Some(content) = object.get("serverContent") {
        let content: ServerContent = serde_json::from_value(content.clone())
            .map_err(|e| VoxlineError::Protocol(format!("malformed serverContent: {e}")))?;
        for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
            if let Some(text) = part.text {
                signals.push(ServerSignal::Text(text));
            }
            if let Some(inline) = part.inline_data {
                let is_audio = inline
                    .mime_type
                    .as_deref()
                    .is_some_and(|m| m.starts_with("audio/"));
                if let (true, Some(data)) = (is_audio, inline.data) {
                    let bytes = STANDARD.decode(data.as_bytes()).map_err(|e| {
                        VoxlineError::Protocol(format!("invalid base64 audio: {e}"))
                    })?;
                    signals.push(ServerSignal::Audio(AudioFrame::from(bytes)));
                }
            }
        }
    }

    if object.contains_key("setupComplete") {
        signals.push(ServerSignal::SetupComplete);
    }

    if let Some(error) = object.get("error") {
        let message = serde_json::from_value::<ServerErrorBody>(error.clone())
            .ok()
            .and_then(|e| e.message)
            .unwrap_or_else(|| "Unknown error".to_string());
        signals.push(ServerSignal::Error(message));
    }

    Ok(signals)
}

/// Decode the base64 payload of an outbound realtime-input envelope.
pub fn decode_realtime_audio(envelope: &str) -> Result<AudioFrame> {
    let value: serde_json::Value = serde_json::from_str(envelope)?;
    let data = value
        .pointer("/realtimeInput/mediaChunks/0/data")
        .and_then(|d| d.as_str())
        .ok_or_else(|| VoxlineError::Protocol("not a realtime audio envelope".into()))?;
    let bytes = STANDARD
        .decode(data.as_bytes())
        .map_err(|e| VoxlineError::Protocol(format!("invalid base64 audio: {e}")))?;
    Ok(AudioFrame::from(bytes))
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    #[test]
    fn test_setup_envelope_shape() {
        let msg = ClientMessage::setup("models/gemini-2.0-flash-exp", "Aoede", "Be helpful.");
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "setup": {
                    "model": { "model": "models/gemini-2.0-flash-exp" },
                    "generationConfig": {
                        "responseModalities": ["AUDIO", "TEXT"],
                        "speechConfig": {
                            "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": "Aoede" } }
                        }
                    },
                    "systemInstruction": { "parts": [{ "text": "Be helpful." }] }
                }
            })
        );
    }

    #[test]
    fn test_audio_envelope_shape() {
        let frame = AudioFrame::from(vec![0u8, 1, 2, 3]);
        let value: Value = serde_json::from_str(&ClientMessage::audio(&frame).to_json().unwrap()).unwrap();
        let chunks = value["realtimeInput"]["mediaChunks"].as_array().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0]["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunks[0]["data"], "AAECAw==");
    }

    #[test]
    fn test_text_envelope_is_complete_turn() {
        let value: Value =
            serde_json::from_str(&ClientMessage::text("hello").to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "clientContent": {
                    "turns": [{ "role": "user", "parts": [{ "text": "hello" }] }],
                    "turnComplete": true
                }
            })
        );
    }

    #[test]
    fn test_audio_round_trip_preserves_bytes() {
        // odd length and every byte value
        let bytes: Vec<u8> = (0..=255u8).chain(0..=254u8).collect();
        let frame = AudioFrame::from(bytes.clone());
        let envelope = ClientMessage::audio(&frame).to_json().unwrap();
        let decoded = decode_realtime_audio(&envelope).unwrap();
        assert_eq!(decoded.as_bytes(), bytes.as_slice());
    }

    #[test]
    fn test_parse_model_turn_parts_in_order() {
        let audio = STANDARD.encode([9u8, 8, 7, 6]);
        let msg = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        { "text": "Hi there" },
                        { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": audio } },
                        { "inlineData": { "mimeType": "image/png", "data": "AAAA" } }
                    ]
                }
            }
        });
        let signals = parse_server_message(&msg.to_string()).unwrap();
        assert_eq!(
            signals,
            vec![
                ServerSignal::Text("Hi there".into()),
                ServerSignal::Audio(AudioFrame::from(vec![9u8, 8, 7, 6])),
            ]
        );
    }

    #[test]
    fn test_parse_setup_complete_and_error() {
        assert_eq!(
            parse_server_message(r#"{"setupComplete":{}}"#).unwrap(),
            vec![ServerSignal::SetupComplete]
        );
        assert_eq!(
            parse_server_message(r#"{"error":{"message":"quota exceeded"}}"#).unwrap(),
            vec![ServerSignal::Error("quota exceeded".into())]
        );
        assert_eq!(
            parse_server_message(r#"{"error":{}}"#).unwrap(),
            vec![ServerSignal::Error("Unknown error".into())]
        );
    }

    #[test]
    fn test_parse_unknown_key_yields_nothing() {
        assert!(parse_server_message(r#"{"usageMetadata":{"totalTokenCount":5}}"#)
            .unwrap()
            .is_empty());
        // serverContent without a model turn (e.g. turnComplete markers)
        assert!(parse_server_message(r#"{"serverContent":{"turnComplete":true}}"#)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_parse_malformed_is_protocol_error() {
        for bad in ["not json", "[1,2,3]", r#"{"serverContent":{"modelTurn":{"parts":"x"}}}"#] {
            match parse_server_message(bad) {
                Err(VoxlineError::Protocol(_)) => {}
                other => panic!("expected protocol error for {bad:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_parse_bad_base64_is_protocol_error() {
        let msg = r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm","data":"@@@"}}]}}}"#;
        assert!(matches!(
            parse_server_message(msg),
            Err(VoxlineError::Protocol(_))
        ));
    }
}
