use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Configuration for one client session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the snapshot API; concerns are fetched from
    /// `{api_url}/api/concerns`.
    pub api_url: String,

    /// Host:port of the live-channel relay.
    pub channel_addr: String,

    /// Author label attached to outgoing comments and room membership.
    /// `"company"` marks the organization party; anything else a submitter.
    pub user_id: String,

    /// Seconds between full snapshot fetches. The interval is a correctness
    /// backstop against missed live events, not the primary delivery path.
    pub snapshot_interval_secs: u64,

    /// Connection attempts per reconnect cycle before giving up.
    pub reconnect_attempts: u32,

    /// Delay between connection attempts, in milliseconds.
    pub reconnect_delay_ms: u64,

    /// Maximum accepted live-channel frame length. Longer frames are
    /// dropped without killing the connection.
    pub max_frame_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:5000".to_string(),
            channel_addr: "localhost:5001".to_string(),
            user_id: concern_protocol::COMPANY_SENDER.to_string(),
            snapshot_interval_secs: 5,
            reconnect_attempts: 5,
            reconnect_delay_ms: 1_000,
            max_frame_bytes: 1024 * 1024,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.api_url.trim().is_empty() {
            return Err("api_url must not be empty".to_string());
        }
        if self.channel_addr.trim().is_empty() {
            return Err("channel_addr must not be empty".to_string());
        }
        if self.user_id.trim().is_empty() {
            return Err("user_id must not be empty".to_string());
        }
        if self.snapshot_interval_secs == 0 {
            return Err("snapshot_interval_secs must be at least 1".to_string());
        }
        if self.reconnect_attempts == 0 {
            return Err("reconnect_attempts must be at least 1".to_string());
        }
        if self.max_frame_bytes == 0 {
            return Err("max_frame_bytes must be positive".to_string());
        }
        Ok(())
    }

    /// Load configuration from a TOML file. Missing keys fall back to the
    /// defaults; the result is validated before being returned.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        config.validate().map_err(SyncError::Config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_the_documented_policy() {
        let config = SyncConfig::default();
        assert_eq!(config.snapshot_interval(), Duration::from_secs(5));
        assert_eq!(config.reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay(), Duration::from_millis(1_000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_overrides_defaults_and_keeps_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("concern.toml");
        std::fs::write(
            &path,
            "api_url = \"http://store.internal:8080\"\nuser_id = \"0xabc\"\n",
        )
        .unwrap();
        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.api_url, "http://store.internal:8080");
        assert_eq!(config.user_id, "0xabc");
        assert_eq!(config.snapshot_interval_secs, 5);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = SyncConfig::default();
        config.reconnect_attempts = 0;
        assert!(config.validate().is_err());

        config = SyncConfig::default();
        config.api_url = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("concern.toml");
        std::fs::write(&path, "api_url = [not toml").unwrap();
        assert!(matches!(
            SyncConfig::load(&path),
            Err(SyncError::Config(_))
        ));
    }
}
