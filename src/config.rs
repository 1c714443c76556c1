//! Configuration loader and validator for the share queue.
use crate::model::EndpointKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

const CLAIM_LEASE_MARGIN: Duration = Duration::from_secs(30);

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub logging: Logging,
    pub endpoints: Endpoints,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    /// Storage location; the queue database lives here.
    pub data_dir: String,
    /// Periodic wake of the dispatcher. 0 disables it.
    #[serde(default)]
    pub poll_interval_ms: u64,
    pub delivery_timeout_seconds: u64,
    /// Failed rows older than this are pruned. 0 keeps them forever.
    #[serde(default)]
    pub failed_retention_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Logging {
    pub filter: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

/// Enabled endpoints. An absent section leaves that backend unregistered.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoints {
    pub social_album: Option<EndpointSettings>,
    pub cloud_folder: Option<EndpointSettings>,
    pub print_queue: Option<EndpointSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointSettings {
    pub upload_url: String,
}

impl Endpoints {
    pub fn get(&self, kind: EndpointKind) -> Option<&EndpointSettings> {
        match kind {
            EndpointKind::SocialAlbum => self.social_album.as_ref(),
            EndpointKind::CloudFolder => self.cloud_folder.as_ref(),
            EndpointKind::PrintQueue => self.print_queue.as_ref(),
        }
    }

    /// Configured endpoints in endpoint id order.
    pub fn enabled(&self) -> Vec<(EndpointKind, &EndpointSettings)> {
        EndpointKind::ALL
            .into_iter()
            .filter_map(|kind| self.get(kind).map(|settings| (kind, settings)))
            .collect()
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.app.delivery_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.app.poll_interval_ms > 0).then(|| Duration::from_millis(self.app.poll_interval_ms))
    }

    pub fn failed_retention(&self) -> Option<Duration> {
        (self.app.failed_retention_hours > 0)
            .then(|| Duration::from_secs(self.app.failed_retention_hours.saturating_mul(3600)))
    }

    /// How long a claimed row may go without renewal before another cycle
    /// recovers it. Outlasts the longest single delivery attempt.
    pub fn claim_lease(&self) -> Duration {
        self.delivery_timeout().saturating_add(CLAIM_LEASE_MARGIN)
    }

    /// SQLite URL for the queue, overridable with `DATABASE_URL`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/wings.db",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `wings.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("wings.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.delivery_timeout_seconds == 0 {
        return Err(ConfigError::Invalid(
            "app.delivery_timeout_seconds must be > 0",
        ));
    }
    if cfg.logging.filter.trim().is_empty() {
        return Err(ConfigError::Invalid("logging.filter must be non-empty"));
    }

    let enabled = cfg.endpoints.enabled();
    if enabled.is_empty() {
        return Err(ConfigError::Invalid(
            "at least one endpoint must be configured",
        ));
    }
    for (kind, settings) in enabled {
        let url = settings.upload_url.trim();
        if url.is_empty() || reqwest::Url::parse(url).is_err() {
            return Err(ConfigError::Invalid(match kind {
                EndpointKind::SocialAlbum => "endpoints.social_album.upload_url must be a valid URL",
                EndpointKind::CloudFolder => "endpoints.cloud_folder.upload_url must be a valid URL",
                EndpointKind::PrintQueue => "endpoints.print_queue.upload_url must be a valid URL",
            }));
        }
    }

    Ok(())
}

/// Example configuration printed by `wings example-config`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 60000
  delivery_timeout_seconds: 120
  failed_retention_hours: 168

logging:
  filter: "info,sqlx=warn"

endpoints:
  social_album:
    upload_url: "https://social.example.com/v1/photos"
  cloud_folder:
    upload_url: "https://cloud.example.com/v2/files/upload"
  print_queue:
    upload_url: "https://print.example.com/submit"
"#
}
