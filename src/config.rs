use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::StreakError;

/// Config file looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "failure-streaks.toml";

pub const DEFAULT_PROJECT: &str = "mongodb-mongo-master";
pub const DEFAULT_EVERGREEN_URL: &str = "https://evergreen.mongodb.com";
pub const DEFAULT_DB_PATH: &str = ".failure-streaks/streaks.duckdb";

/// Number of consecutive failing commits needed before a streak is recorded.
pub const DEFAULT_CONFIRMATION_WINDOW: usize = 3;
pub const DEFAULT_FAILURE_STATUS: &str = "failed";
/// Build variants whose display name starts with this gate releases.
pub const DEFAULT_REQUIRED_MARKER: &str = "!";
/// Upper bound for `evergreen.max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub project: String,
    pub evergreen: EvergreenConfig,
    pub detection: DetectionConfig,
    pub scan: ScanConfig,
    pub store: StoreConfig,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct EvergreenConfig {
    pub base_url: String,
    /// Only ever read from `EVG_API_USER`.
    #[serde(skip)]
    pub api_user: Option<String>,
    /// Only ever read from `EVG_API_KEY`.
    #[serde(skip)]
    pub api_key: Option<String>,
    pub max_concurrent_requests: usize,
    pub max_retries: u32,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub confirmation_window: usize,
    pub failure_status: String,
    pub required_marker: String,
    /// Record an ending commit on an open streak the first time the test
    /// passes again. Off by default: endings are only resolved when a streak
    /// is minted.
    pub close_on_pass: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub lookback_versions: usize,
    pub max_order: Option<i64>,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Duckdb,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub db_path: PathBuf,
}

/// Detection policy handed to the matcher, detector and scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionPolicy {
    pub project: String,
    pub confirmation_window: usize,
    pub failure_status: String,
    pub required_marker: String,
    pub close_on_pass: bool,
}

impl DetectionPolicy {
    pub fn for_project(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            confirmation_window: DEFAULT_CONFIRMATION_WINDOW,
            failure_status: DEFAULT_FAILURE_STATUS.to_string(),
            required_marker: DEFAULT_REQUIRED_MARKER.to_string(),
            close_on_pass: false,
        }
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.confirmation_window = window;
        self
    }

    pub fn with_close_on_pass(mut self, enabled: bool) -> Self {
        self.close_on_pass = enabled;
        self
    }

    pub fn is_required(&self, build_display_name: &str) -> bool {
        build_display_name.starts_with(&self.required_marker)
    }

    pub fn is_failure_status(&self, status: &str) -> bool {
        status == self.failure_status
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project: DEFAULT_PROJECT.to_string(),
            evergreen: EvergreenConfig::default(),
            detection: DetectionConfig::default(),
            scan: ScanConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for EvergreenConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_EVERGREEN_URL.to_string(),
            api_user: None,
            api_key: None,
            max_concurrent_requests: 8,
            max_retries: 3,
            request_timeout_secs: 60,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confirmation_window: DEFAULT_CONFIRMATION_WINDOW,
            failure_status: DEFAULT_FAILURE_STATUS.to_string(),
            required_marker: DEFAULT_REQUIRED_MARKER.to_string(),
            close_on_pass: false,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            lookback_versions: 200,
            max_order: None,
            max_concurrent: 8,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Duckdb,
            db_path: PathBuf::from(DEFAULT_DB_PATH),
        }
    }
}

impl fmt::Debug for EvergreenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvergreenConfig")
            .field("base_url", &self.base_url)
            .field("api_user", &self.api_user)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("max_concurrent_requests", &self.max_concurrent_requests)
            .field("max_retries", &self.max_retries)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl Config {
    /// Load config from `path` (or `failure-streaks.toml` in the working
    /// directory), then apply environment overrides.
    ///
    /// A missing default file is not an error; a missing explicit path is.
    pub fn load(path: Option<&Path>) -> Result<Self, StreakError> {
        let mut config = match path {
            Some(p) => Self::from_toml_str(&std::fs::read_to_string(p)?)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_toml_str(&std::fs::read_to_string(default)?)?
                } else {
                    tracing::debug!("no {DEFAULT_CONFIG_FILE} found, using defaults");
                    Self::default()
                }
            }
        };
        config.apply_env(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, StreakError> {
        Ok(toml::from_str(s)?)
    }

    /// Apply environment overrides. `lookup` is injected so tests never
    /// touch the process environment.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), StreakError> {
        if let Some(project) = lookup("STREAKS_PROJECT") {
            self.project = project;
        }
        if let Some(url) = lookup("EVG_BASE_URL") {
            self.evergreen.base_url = url;
        }
        self.evergreen.api_user = lookup("EVG_API_USER").or(self.evergreen.api_user.take());
        self.evergreen.api_key = lookup("EVG_API_KEY").or(self.evergreen.api_key.take());
        if let Some(n) = lookup("STREAKS_LOOKBACK") {
            self.scan.lookback_versions = n
                .parse()
                .map_err(|_| StreakError::Config(format!("STREAKS_LOOKBACK is not a number: {n}")))?;
        }
        if let Some(backend) = lookup("STREAKS_STORE") {
            self.store.backend = match backend.to_lowercase().as_str() {
                "duckdb" => StoreBackend::Duckdb,
                "memory" => StoreBackend::Memory,
                other => {
                    return Err(StreakError::Config(format!(
                        "STREAKS_STORE must be duckdb or memory, got {other}"
                    )));
                }
            };
        }
        if let Some(path) = lookup("STREAKS_DB_PATH") {
            self.store.db_path = PathBuf::from(path);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), StreakError> {
        if self.project.trim().is_empty() {
            return Err(StreakError::Config("project must not be empty".into()));
        }
        if self.detection.confirmation_window == 0 {
            return Err(StreakError::Config(
                "detection.confirmation_window must be at least 1".into(),
            ));
        }
        if self.detection.required_marker.is_empty() {
            return Err(StreakError::Config(
                "detection.required_marker must not be empty".into(),
            ));
        }
        if self.evergreen.max_retries > MAX_RETRIES_LIMIT {
            return Err(StreakError::Config(format!(
                "evergreen.max_retries must be at most {MAX_RETRIES_LIMIT}, got {}",
                self.evergreen.max_retries
            )));
        }
        if self.scan.max_concurrent == 0 || self.evergreen.max_concurrent_requests == 0 {
            return Err(StreakError::Config(
                "concurrency limits must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn policy(&self) -> DetectionPolicy {
        DetectionPolicy {
            project: self.project.clone(),
            confirmation_window: self.detection.confirmation_window,
            failure_status: self.detection.failure_status.clone(),
            required_marker: self.detection.required_marker.clone(),
            close_on_pass: self.detection.close_on_pass,
        }
    }
}
