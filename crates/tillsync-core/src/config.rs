//! Configuration for tillsync.
//!
//! Loaded from a TOML file (`tillsync.toml` in the working directory unless
//! a path is given), then overridden by `TILLSYNC_*` environment variables,
//! then validated.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::codec::BusinessClock;
use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "tillsync.toml";

/// Default Sheets v4 endpoint.
pub const DEFAULT_API_BASE: &str = "https://sheets.googleapis.com/v4";

/// Largest supported UTC offset, in minutes.
const MAX_OFFSET_MINUTES: i32 = 14 * 60;

type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    /// Remote spreadsheet mirror
    #[serde(default)]
    pub mirror: MirrorConfig,

    /// Background reconciliation
    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Root for ledger files
    pub data_dir: PathBuf,

    /// Business timezone as a fixed offset from UTC. Decides "today".
    pub utc_offset_minutes: i32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            utc_offset_minutes: 0,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub enabled: bool,
    pub spreadsheet_id: String,
    /// OAuth bearer token with spreadsheet scope. Never serialized back out.
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    pub api_base: String,
    /// Per-request timeout
    pub timeout_secs: u64,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            spreadsheet_id: String::new(),
            access_token: None,
            api_base: DEFAULT_API_BASE.to_string(),
            timeout_secs: 30,
        }
    }
}

impl fmt::Debug for MirrorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorConfig")
            .field("enabled", &self.enabled)
            .field("spreadsheet_id", &self.spreadsheet_id)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("api_base", &self.api_base)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between background passes; 0 disables the poller.
    pub poll_interval_secs: u64,

    /// Let background passes delete records missing on one side.
    pub poll_allow_delete: bool,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other} (expected pretty or json)")),
        }
    }
}

impl Config {
    /// Load `path`, or `tillsync.toml` from the working directory if present,
    /// apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::load_from(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse one TOML file without overrides or validation.
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `TILLSYNC_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("TILLSYNC_DATA_DIR") {
            self.general.data_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup("TILLSYNC_UTC_OFFSET_MINUTES") {
            self.general.utc_offset_minutes = parse_env("TILLSYNC_UTC_OFFSET_MINUTES", &raw)?;
        }
        if let Some(raw) = lookup("TILLSYNC_SHEETS_ENABLED") {
            self.mirror.enabled = parse_flag("TILLSYNC_SHEETS_ENABLED", &raw)?;
        }
        if let Some(id) = lookup("TILLSYNC_SPREADSHEET_ID") {
            self.mirror.spreadsheet_id = id.trim().to_string();
        }
        if let Some(token) = lookup("TILLSYNC_SHEETS_TOKEN") {
            self.mirror.access_token = Some(token.trim().to_string());
        }
        if let Some(raw) = lookup("TILLSYNC_POLL_INTERVAL_SECS") {
            self.sync.poll_interval_secs = parse_env("TILLSYNC_POLL_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = lookup("TILLSYNC_POLL_ALLOW_DELETE") {
            self.sync.poll_allow_delete = parse_flag("TILLSYNC_POLL_ALLOW_DELETE", &raw)?;
        }
        Ok(())
    }

    /// Reject impossible values and downgrade an unusable mirror to
    /// disabled so the process still runs local-only.
    pub fn validate(&mut self) -> ConfigResult<()> {
        if self.general.utc_offset_minutes.abs() > MAX_OFFSET_MINUTES {
            return Err(ConfigError::InvalidValue {
                field: "general.utc_offset_minutes".into(),
                reason: format!("must be within ±{MAX_OFFSET_MINUTES}"),
            });
        }
        if self.mirror.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "mirror.timeout_secs".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.mirror.enabled && self.mirror.spreadsheet_id.trim().is_empty() {
            warn!("mirror enabled without a spreadsheet id; disabling it");
            self.mirror.enabled = false;
        }
        if self.mirror.enabled
            && self
                .mirror
                .access_token
                .as_deref()
                .is_none_or(|t| t.trim().is_empty())
        {
            warn!("mirror enabled without an access token; disabling it");
            self.mirror.enabled = false;
        }
        Ok(())
    }

    #[must_use]
    pub fn clock(&self) -> BusinessClock {
        BusinessClock::with_offset_minutes(self.general.utc_offset_minutes)
    }

    /// Background pass interval, if the poller is on.
    #[must_use]
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.sync.poll_interval_secs > 0).then(|| Duration::from_secs(self.sync.poll_interval_secs))
    }
}

fn parse_env<T: FromStr>(field: &str, raw: &str) -> ConfigResult<T>
where
    T::Err: fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            field: field.to_string(),
            reason: e.to_string(),
        })
}

fn parse_flag(field: &str, raw: &str) -> ConfigResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: format!("expected a boolean, got {other:?}"),
        }),
    }
}
