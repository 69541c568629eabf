use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoxlineError {
    /// Missing or invalid credential / settings. Raised before any transport is opened.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error: {0}")]
    Server(String),

    /// Audio device acquisition or I/O failure.
    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Call error: {0}")]
    Call(String),

    /// The session already reached its terminal state; sessions are one-shot.
    #[error("Session closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VoxlineError {
    /// Short, stable label for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::Server(_) => "server",
            Self::Resource(_) => "resource",
            Self::Call(_) => "call",
            Self::Closed => "closed",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, VoxlineError>;
