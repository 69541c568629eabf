//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level Voxline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub live: LiveConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub call: CallConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

// --- Streaming session ---

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash-exp:bidiGenerateContent";
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";
pub const DEFAULT_VOICE: &str = "Aoede";
pub const DEFAULT_API_KEY_ENV: &str = "GEMINI_API_KEY";

const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a helpful AI phone assistant. You are handling a phone call.\n\
Be natural, conversational, and helpful. Keep responses concise and clear.\n\
Listen carefully to what the caller says and respond appropriately.\n\
If you don't understand something, politely ask for clarification.";

/// Live (bidirectional streaming) service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    /// WebSocket endpoint; the credential is appended as the `key` query parameter.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_api_key_env", skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_voice")]
    pub voice: String,

    #[serde(default = "default_system_instruction")]
    pub system_instruction: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// How long `disconnect` waits for the peer to confirm closure.
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,

    /// Outbound audio frames held before new frames are shed.
    #[serde(default = "default_max_queued_audio_frames")]
    pub max_queued_audio_frames: usize,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.into()
}

fn default_api_key_env() -> Option<String> {
    Some(DEFAULT_API_KEY_ENV.into())
}

fn default_model() -> String {
    DEFAULT_MODEL.into()
}

fn default_voice() -> String {
    DEFAULT_VOICE.into()
}

fn default_system_instruction() -> String {
    DEFAULT_SYSTEM_INSTRUCTION.into()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_close_timeout_ms() -> u64 {
    2_000
}

fn default_max_queued_audio_frames() -> usize {
    3_000
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            api_key_env: default_api_key_env(),
            model: default_model(),
            voice: default_voice(),
            system_instruction: default_system_instruction(),
            connect_timeout_secs: default_connect_timeout_secs(),
            close_timeout_ms: default_close_timeout_ms(),
            max_queued_audio_frames: default_max_queued_audio_frames(),
        }
    }
}

impl LiveConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Model name without the `models/` resource prefix (for REST URLs).
    pub fn model_id(&self) -> &str {
        self.model.strip_prefix("models/").unwrap_or(&self.model)
    }
}

// --- Audio pipeline ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Capture chunk = device minimum buffer * multiplier.
    #[serde(default = "default_buffer_multiplier")]
    pub buffer_multiplier: usize,

    #[serde(default = "default_capture_interval_ms")]
    pub capture_interval_ms: u64,

    /// Probability that a captured frame is measured for loudness telemetry.
    #[serde(default = "default_telemetry_sample_rate")]
    pub telemetry_sample_rate: f64,

    #[serde(default = "default_max_playback_frames")]
    pub max_playback_frames: usize,

    /// Speak text responses locally when the speaker is idle.
    #[serde(default = "default_true")]
    pub speech_fallback: bool,
}

fn default_buffer_multiplier() -> usize {
    2
}

fn default_capture_interval_ms() -> u64 {
    10
}

fn default_telemetry_sample_rate() -> f64 {
    0.05
}

fn default_max_playback_frames() -> usize {
    3_000
}

fn default_true() -> bool {
    true
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            buffer_multiplier: default_buffer_multiplier(),
            capture_interval_ms: default_capture_interval_ms(),
            telemetry_sample_rate: default_telemetry_sample_rate(),
            max_playback_frames: default_max_playback_frames(),
            speech_fallback: true,
        }
    }
}

impl AudioConfig {
    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }
}

// --- Call orchestration ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// Stub delay standing in for outgoing call establishment.
    #[serde(default = "default_dial_delay_ms")]
    pub dial_delay_ms: u64,

    /// Grace delay before an incoming call is auto-answered.
    #[serde(default = "default_answer_grace_ms")]
    pub answer_grace_ms: u64,

    #[serde(default)]
    pub screening: ScreeningConfig,
}

fn default_dial_delay_ms() -> u64 {
    1_000
}

fn default_answer_grace_ms() -> u64 {
    500
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            dial_delay_ms: default_dial_delay_ms(),
            answer_grace_ms: default_answer_grace_ms(),
            screening: ScreeningConfig::default(),
        }
    }
}

impl CallConfig {
    pub fn dial_delay(&self) -> Duration {
        Duration::from_millis(self.dial_delay_ms)
    }

    pub fn answer_grace(&self) -> Duration {
        Duration::from_millis(self.answer_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Digit prefixes refused for incoming calls (separators are ignored when matching).
    #[serde(default = "default_blocked_prefixes")]
    pub blocked_prefixes: Vec<String>,
}

fn default_blocked_prefixes() -> Vec<String> {
    vec!["900".into(), "1900".into()]
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            blocked_prefixes: default_blocked_prefixes(),
        }
    }
}

// --- Logging ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "voxline_live=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.trim().is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.trim().is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> crate::error::Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| crate::error::VoxlineError::Configuration(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::VoxlineError::Io)?;

        // Substitute ${ENV_VAR} references before parsing
        let substituted = substitute_env_vars(&raw)?;

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::VoxlineError::Configuration(e.to_string()))?;

        Ok(config)
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Get a config value by dotted path (e.g. "live.model", "call.dial_delay_ms").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Set a config value by dotted path. Unknown keys and values of the
    /// wrong type are rejected and leave the config unchanged.
    pub fn set_path(&mut self, path: &str, value: serde_json::Value) -> crate::error::Result<()> {
        let unknown =
            || crate::error::VoxlineError::Configuration(format!("no config value at {path}"));

        let mut json = serde_json::to_value(&*self)?;
        let (parents, leaf) = path.rsplit_once('.').ok_or_else(unknown)?;
        let mut section = &mut json;
        for segment in parents.split('.') {
            section = section.get_mut(segment).ok_or_else(unknown)?;
        }
        // unset optional values are skipped when serializing, so insert rather than replace
        section
            .as_object_mut()
            .ok_or_else(unknown)?
            .insert(leaf.to_string(), value.clone());

        let updated: Config = serde_json::from_value(json).map_err(|e| {
            crate::error::VoxlineError::Configuration(format!("invalid value for {path}: {e}"))
        })?;
        if updated.get_path(path).as_ref() != Some(&value) {
            return Err(unknown());
        }
        *self = updated;
        Ok(())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.live.resolve_api_key().is_none() {
            warnings.push(format!(
                "No live API key configured (set live.api_key or ${})",
                self.live
                    .api_key_env
                    .as_deref()
                    .unwrap_or(DEFAULT_API_KEY_ENV)
            ));
        }

        if !(self.live.endpoint.starts_with("wss://") || self.live.endpoint.starts_with("ws://")) {
            errors.push(format!(
                "live.endpoint must be a ws:// or wss:// URL: {}",
                self.live.endpoint
            ));
        }

        if self.live.model.trim().is_empty() {
            errors.push("live.model cannot be empty".to_string());
        }

        if self.audio.buffer_multiplier == 0 {
            errors.push("audio.buffer_multiplier cannot be 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.audio.telemetry_sample_rate) {
            errors.push(format!(
                "audio.telemetry_sample_rate must be within 0..=1, got {}",
                self.audio.telemetry_sample_rate
            ));
        }

        (warnings, errors)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> crate::error::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for Voxline data: `~/.voxline/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".voxline")
}
