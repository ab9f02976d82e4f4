//! Source and sync configuration schema and loading.
//!
//! Configured via an optional TOML file, conventionally `~/.plot/twister.toml`.
//! Every field has a default, so a missing file means "built-in behaviour".

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Duration;
use serde::Deserialize;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TwisterConfig {
    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub sources: HashMap<String, SourceConfig>,
}

/// Engine-wide knobs shared by every source.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    /// Items fetched per batch.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Delay before a continuation batch runs. 0 schedules it immediately.
    #[serde(default)]
    pub batch_delay_secs: u64,

    /// A sync lock older than this is considered abandoned.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// How long before expiry a watch subscription is renewed.
    #[serde(default = "default_renewal_lead")]
    pub renewal_lead_hours: i64,

    /// Rate-limit retries inside a single provider call.
    #[serde(default = "default_max_http_retries")]
    pub max_http_retries: u32,

    /// Failed attempts at one batch before the run is abandoned.
    /// Unset leaves retrying entirely to the host.
    #[serde(default)]
    pub max_batch_failures: Option<u32>,
}

fn default_page_size() -> u32 {
    50
}

fn default_lock_ttl() -> u64 {
    3600
}

fn default_renewal_lead() -> i64 {
    24
}

fn default_max_http_retries() -> u32 {
    8
}

fn default_true() -> bool {
    true
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            batch_delay_secs: 0,
            lock_ttl_secs: default_lock_ttl(),
            renewal_lead_hours: default_renewal_lead(),
            max_http_retries: default_max_http_retries(),
            max_batch_failures: None,
        }
    }
}

impl SyncSettings {
    pub fn lock_ttl(&self) -> Duration {
        Duration::seconds(self.lock_ttl_secs as i64)
    }

    pub fn renewal_lead(&self) -> Duration {
        Duration::hours(self.renewal_lead_hours)
    }

    pub fn batch_delay(&self) -> Option<Duration> {
        (self.batch_delay_secs > 0).then(|| Duration::seconds(self.batch_delay_secs as i64))
    }
}

/// Per-source overrides, keyed by source name (`github-issues`, `slack`, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub page_size: Option<u32>,

    /// Override for the provider's API root, mainly for tests and proxies.
    #[serde(default)]
    pub api_base_url: Option<String>,

    /// Static webhook secret: the Slack app signing secret, or the token on
    /// the Gmail Pub/Sub push subscription.
    #[serde(default)]
    pub signing_secret: Option<String>,

    /// How far back an initial sync reaches, for sources that filter by time.
    #[serde(default)]
    pub lookback_days: Option<i64>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            page_size: None,
            api_base_url: None,
            signing_secret: None,
            lookback_days: None,
        }
    }
}

impl TwisterConfig {
    /// Load configuration from a TOML file, falling back to defaults when it is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Overrides for one source; defaults when not configured.
    pub fn source(&self, name: &str) -> SourceConfig {
        self.sources.get(name).cloned().unwrap_or_default()
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.sources.get(name).map(|c| c.enabled).unwrap_or(true)
    }

    /// Engine settings with the source's page size applied.
    pub fn settings_for(&self, name: &str) -> SyncSettings {
        let mut settings = self.sync.clone();
        if let Some(size) = self.sources.get(name).and_then(|c| c.page_size) {
            settings.page_size = size;
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TwisterConfig::default();
        assert_eq!(config.sync.page_size, 50);
        assert_eq!(config.sync.max_batch_failures, None);
        assert!(config.is_enabled("github-issues"));
        assert!(config.sync.batch_delay().is_none());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[sync]
page_size = 20
batch_delay_secs = 5
max_batch_failures = 3

[sources.slack]
signing_secret = "8f742231b10e8888abcd99yyyzzz85a5"

[sources.google-calendar]
page_size = 25
lookback_days = 30

[sources.asana]
enabled = false
"#;
        let config: TwisterConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.sync.page_size, 20);
        assert_eq!(config.sync.lock_ttl_secs, 3600);
        assert_eq!(config.sync.max_batch_failures, Some(3));
        assert_eq!(config.sync.batch_delay(), Some(Duration::seconds(5)));
        assert!(!config.is_enabled("asana"));
        assert_eq!(
            config.source("slack").signing_secret.as_deref(),
            Some("8f742231b10e8888abcd99yyyzzz85a5")
        );
        assert_eq!(config.settings_for("google-calendar").page_size, 25);
        assert_eq!(config.settings_for("slack").page_size, 20);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = TwisterConfig::load(&dir.path().join("twister.toml")).unwrap();
        assert_eq!(config.sync.renewal_lead_hours, 24);
    }
}
