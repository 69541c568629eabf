use std::fmt;

/// Connection state of a [`StreamingSession`](crate::StreamingSession).
///
/// `Disconnected → Connecting → Configuring → Active → Closing → Closed`.
/// `Closed` is terminal; a session is never reconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Created, `connect` not called yet.
    #[default]
    Disconnected,
    /// Transport open in progress.
    Connecting,
    /// Setup envelope sent, waiting for `setupComplete`.
    Configuring,
    /// Outbound queues are flushed to the wire.
    Active,
    Closing,
    Closed,
}

impl SessionState {
    /// Connecting, Configuring or Active.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Configuring | Self::Active)
    }

    /// Closing or Closed.
    pub fn is_closing(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Configuring => "configuring",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}
