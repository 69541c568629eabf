//! Credential provider seam.
//!
//! Storage of the credential is someone else's problem; the streaming session
//! only ever asks for the current value right before it connects.

use crate::config::LiveConfig;

/// Supplies the credential embedded in the live connection URL.
pub trait CredentialProvider: Send + Sync {
    /// Current credential, or `None` if nothing is configured.
    fn credential(&self) -> Option<String>;
}

impl CredentialProvider for LiveConfig {
    fn credential(&self) -> Option<String> {
        self.resolve_api_key()
    }
}

/// A fixed credential (CLI `--api-key`, tests).
#[derive(Debug, Clone)]
pub struct StaticCredential(String);

impl StaticCredential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl CredentialProvider for StaticCredential {
    fn credential(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_credential() {
        let creds = StaticCredential::new("abc");
        assert_eq!(creds.credential().as_deref(), Some("abc"));
    }

    #[test]
    fn test_live_config_provider() {
        let live = LiveConfig {
            api_key: Some("from-config".into()),
            api_key_env: None,
            ..LiveConfig::default()
        };
        let provider: &dyn CredentialProvider = &live;
        assert_eq!(provider.credential().as_deref(), Some("from-config"));
    }
}
