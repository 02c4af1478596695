//! Engine configuration and OAuth client credentials
//!
//! [`EngineConfig`] is read from `engine.json` in the mailsync config
//! directory; every field has a default so a missing or partial file is
//! fine. [`GmailCredentials`] is resolved from (in order):
//! 1. Compile-time embedded credentials (release builds)
//! 2. `google-credentials.json` (Google Cloud Console format)
//! 3. Runtime environment variables

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENGINE_CONFIG_FILE: &str = "engine.json";
const CREDENTIALS_FILE: &str = "google-credentials.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sync: SyncConfig,
    pub network: NetworkConfig,
    pub outbox: OutboxConfig,
    pub queues: QueueConfig,
    pub notifications: NotificationConfig,
    pub tasks: TaskIntervals,
}

impl EngineConfig {
    /// Load `engine.json` from the config directory, or defaults.
    pub fn load() -> Result<Self> {
        config::load_json_or_default(ENGINE_CONFIG_FILE)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        config::load_json_file(path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Messages listed by a full sync
    pub full_sync_batch: u32,
    /// Label a full sync lists
    pub full_sync_label: String,
    /// Concurrent metadata fetches within a batch
    pub fetch_fan_out: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            full_sync_batch: 50,
            full_sync_label: crate::models::labels::INBOX.to_string(),
            fetch_fan_out: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub request_timeout_secs: u64,
    /// Total attempts for idempotent requests, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
}

impl NetworkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 20,
            max_attempts: 3,
            initial_backoff_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Failed send attempts before an item becomes terminally failed
    pub max_retries: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub summary_budget_per_hour: usize,
    pub prefetch_budget_per_hour: usize,
    /// Queues pause below this battery level (when the level is known)
    pub min_battery_level: f32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            summary_budget_per_hour: 10,
            prefetch_budget_per_hour: 60,
            min_battery_level: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub dedup_ttl_days: i64,
    pub max_per_check: u32,
    /// Gmail search query selecting notification candidates
    pub query: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            dedup_ttl_days: 7,
            max_per_check: 20,
            query: "is:unread".to_string(),
        }
    }
}

/// Minimum spacing between background windows, in minutes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskIntervals {
    pub sync_mins: u64,
    pub notification_check_mins: u64,
    pub summary_processing_mins: u64,
    pub outbox_processing_mins: u64,
}

impl Default for TaskIntervals {
    fn default() -> Self {
        Self {
            sync_mins: 15,
            notification_check_mins: 15,
            summary_processing_mins: 60,
            outbox_processing_mins: 15,
        }
    }
}

/// OAuth client credentials for the Gmail API.
///
/// Mobile ("installed app" on iOS/Android) clients have no secret.
#[derive(Debug, Clone, PartialEq)]
pub struct GmailCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
}

/// Google Cloud Console credential file
#[derive(Deserialize)]
struct GoogleCredentialFile {
    installed: Option<ClientSection>,
    web: Option<ClientSection>,
}

#[derive(Deserialize)]
struct ClientSection {
    client_id: String,
    client_secret: Option<String>,
}

impl GmailCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: Option<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn load() -> Result<Self> {
        if let Some(creds) = Self::from_compile_time() {
            return Ok(creds);
        }
        if config::config_exists(CREDENTIALS_FILE) {
            let file: GoogleCredentialFile = config::load_json(CREDENTIALS_FILE)?;
            return Self::from_credential_file(file);
        }
        Self::from_env()
    }

    /// Build with `GOOGLE_CLIENT_ID=... [GOOGLE_CLIENT_SECRET=...] cargo build --release`
    pub fn from_compile_time() -> Option<Self> {
        let client_id = option_env!("GOOGLE_CLIENT_ID").filter(|id| !id.is_empty())?;
        Some(Self::new(
            client_id,
            option_env!("GOOGLE_CLIENT_SECRET").map(str::to_string),
        ))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_credential_file(config::load_json_file(path)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: GoogleCredentialFile =
            serde_json::from_str(json).context("Failed to parse credentials JSON")?;
        Self::from_credential_file(file)
    }

    fn from_credential_file(file: GoogleCredentialFile) -> Result<Self> {
        let section = file
            .installed
            .or(file.web)
            .context("Credentials file missing 'installed' or 'web' section")?;
        Ok(Self::new(section.client_id, section.client_secret))
    }

    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var("GMAIL_CLIENT_ID")
            .context("GMAIL_CLIENT_ID environment variable not set")?;
        Ok(Self::new(client_id, std::env::var("GMAIL_CLIENT_SECRET").ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.sync.full_sync_batch, 50);
        assert_eq!(config.sync.fetch_fan_out, 3);
        assert_eq!(config.network.request_timeout(), Duration::from_secs(20));
        assert_eq!(config.outbox.max_retries, 3);
        assert_eq!(config.queues.summary_budget_per_hour, 10);
        assert_eq!(config.queues.min_battery_level, 0.2);
        assert_eq!(config.notifications.dedup_ttl_days, 7);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "queues": { "summary_budget_per_hour": 4 } }"#).unwrap();
        assert_eq!(config.queues.summary_budget_per_hour, 4);
        assert_eq!(config.queues.prefetch_budget_per_hour, 60);
        assert_eq!(config.sync, SyncConfig::default());
    }

    #[test]
    fn test_parse_installed_credentials_without_secret() {
        let json = r#"{
            "installed": {
                "client_id": "ios-client.apps.googleusercontent.com",
                "token_uri": "https://oauth2.googleapis.com/token"
            }
        }"#;
        let creds = GmailCredentials::from_json(json).unwrap();
        assert_eq!(creds.client_id, "ios-client.apps.googleusercontent.com");
        assert_eq!(creds.client_secret, None);
    }

    #[test]
    fn test_parse_web_credentials() {
        let json = r#"{ "web": { "client_id": "web-id", "client_secret": "web-secret" } }"#;
        let creds = GmailCredentials::from_json(json).unwrap();
        assert_eq!(creds.client_secret.as_deref(), Some("web-secret"));
    }

    #[test]
    fn test_missing_section() {
        assert!(GmailCredentials::from_json(r#"{ "other": {} }"#).is_err());
    }
}
