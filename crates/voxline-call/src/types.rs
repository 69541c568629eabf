use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use voxline_core::types::{CallDirection, SessionEvent};

/// Telephony state of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    #[default]
    Idle,
    /// Incoming, not answered yet.
    Ringing,
    /// Outgoing, not established yet.
    Dialing,
    Active,
    Held,
    /// Terminal.
    Disconnected,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Ringing => "ringing",
            Self::Dialing => "dialing",
            Self::Active => "active",
            Self::Held => "held",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "cause", content = "message")]
pub enum DisconnectCause {
    /// Hung up on this side.
    Local,
    /// Hung up by the other party.
    Remote,
    Rejected,
    /// Aborted before or during setup.
    Canceled,
    Error(String),
}

impl DisconnectCause {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Rejected => "rejected",
            Self::Canceled => "canceled",
            Self::Error(_) => "error",
        }
    }
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(message) => write!(f, "error: {message}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Lifecycle notifications and controls delivered to a call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallCommand {
    Answer,
    Hold,
    Unhold,
    Mute(bool),
    /// Only valid while ringing.
    Reject,
    Abort,
    Hangup,
    RemoteHangup,
    SendText(String),
    /// Logged only; no tone is generated.
    Dtmf(char),
}

/// Outward event stream of one call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged { from: CallState, to: CallState },
    /// Every non-audio session event, in session order.
    Session(SessionEvent),
    /// Last event of every call. `duration` counts from the first Active.
    Ended {
        cause: DisconnectCause,
        duration: Duration,
    },
}

/// Snapshot of one call.
#[derive(Debug, Clone, Serialize)]
pub struct CallInfo {
    pub id: Uuid,
    pub direction: CallDirection,
    pub address: String,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
}
