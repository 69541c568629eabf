//! Incoming call screening by number prefix.

use tracing::info;

use voxline_core::config::ScreeningConfig;
use voxline_core::error::{Result, VoxlineError};

/// Refuses incoming calls whose number starts with a blocked prefix.
///
/// Matching ignores everything but digits, so `1-900-555-0100` and
/// `+1 (900) 555 0100` both match the prefix `1900`.
#[derive(Debug, Clone)]
pub struct CallScreener {
    enabled: bool,
    prefixes: Vec<String>,
}

/// Digits of an address, in order.
pub fn normalize(address: &str) -> String {
    address.chars().filter(char::is_ascii_digit).collect()
}

impl CallScreener {
    pub fn new(config: &ScreeningConfig) -> Self {
        Self {
            enabled: config.enabled,
            prefixes: config
                .blocked_prefixes
                .iter()
                .map(|p| normalize(p))
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// The blocked prefix matching `address`, if any.
    pub fn blocked_prefix(&self, address: &str) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        let digits = normalize(address);
        self.prefixes
            .iter()
            .find(|prefix| digits.starts_with(prefix.as_str()))
            .map(String::as_str)
    }

    /// Ok if the call may proceed.
    pub fn screen(&self, address: &str) -> Result<()> {
        match self.blocked_prefix(address) {
            Some(prefix) => {
                info!(address, prefix, "Blocked incoming call");
                Err(VoxlineError::Call(format!(
                    "incoming call from {address} blocked (prefix {prefix})"
                )))
            }
            None => Ok(()),
        }
    }
}
