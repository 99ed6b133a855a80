use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::Provider;

const DEFAULT_CONFIG_PATH: &str = "settings.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub oauth: OAuthSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Messages requested per provider page.
    pub page_size: u32,
    pub fetch_timeout_secs: u64,
    /// Retries of one page after a transient failure.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Tokens expiring within this window are refreshed before use.
    pub token_refresh_margin_secs: i64,
    pub token_refresh_timeout_secs: u64,
    pub poll_interval_secs: u64,
    /// Folder used by folder-scoped runs when the account has none configured.
    pub default_folder: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClient {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub token_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OAuthSettings {
    pub google: Option<OAuthClient>,
    pub microsoft: Option<OAuthClient>,
    pub yahoo: Option<OAuthClient>,
}

fn default_database_url() -> String {
    "sqlite:mailsync.db?mode=rwc".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            sync: SyncSettings::default(),
            oauth: OAuthSettings::default(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            fetch_timeout_secs: 30,
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            token_refresh_margin_secs: 60,
            token_refresh_timeout_secs: 15,
            poll_interval_secs: 300,
            default_folder: "INBOX".to_string(),
        }
    }
}

impl SyncSettings {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn token_refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.token_refresh_timeout_secs)
    }

    pub fn token_refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_refresh_margin_secs)
    }

    /// Exponential backoff for the given zero-based retry attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

impl OAuthSettings {
    pub fn client_for(&self, provider: Provider) -> Option<OAuthClient> {
        let configured = match provider {
            Provider::Google => self.google.clone(),
            Provider::Microsoft => self.microsoft.clone(),
            Provider::Yahoo => self.yahoo.clone(),
            Provider::Imap => None,
        };
        configured.or_else(|| default_client(provider))
    }
}

/// Well-known token endpoints; client ids come from the environment when the
/// settings file does not name them.
fn default_client(provider: Provider) -> Option<OAuthClient> {
    let (prefix, token_url) = match provider {
        Provider::Google => ("GOOGLE", "https://oauth2.googleapis.com/token"),
        Provider::Microsoft => (
            "MICROSOFT",
            "https://login.microsoftonline.com/common/oauth2/v2.0/token",
        ),
        Provider::Yahoo => ("YAHOO", "https://api.login.yahoo.com/oauth2/get_token"),
        Provider::Imap => return None,
    };
    let client_id = std::env::var(format!("MAILSYNC_{prefix}_CLIENT_ID")).ok()?;
    Some(OAuthClient {
        client_id,
        client_secret: std::env::var(format!("MAILSYNC_{prefix}_CLIENT_SECRET")).ok(),
        token_url: token_url.to_string(),
    })
}

impl Config {
    pub fn load() -> Self {
        let path = std::env::var("MAILSYNC_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(path)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "invalid settings file, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}
