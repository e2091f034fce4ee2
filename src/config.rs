//! Type-safe configuration loader using the `config` crate,
//! with manual environment-variable overrides for core settings.

use std::{env, path::PathBuf, time::Duration};

use config::{Config, ConfigError, File};
use serde::Deserialize;

use crate::partition::Zone;

fn default_xrpc_host() -> String {
    "https://public.api.bsky.app".to_string()
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

/// Top-level application settings loaded from `Config.toml`
/// and then overridden (where applicable) by environment variables.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// XRPC service the author feed is read from
    #[serde(default = "default_xrpc_host")]
    pub xrpc_host: String,

    /// Account whose feed is archived (DID or handle)
    pub actor: String,

    /// Pre-issued access JWT, if the host requires authentication
    #[serde(default)]
    pub access_token: Option<String>,

    /// Zone partitions are cut in, e.g. "Asia/Tokyo", "+09:00" or "540min"
    #[serde(default = "default_time_zone")]
    pub time_zone: String,

    /// Key prefix for partitions; defaults to the actor
    #[serde(default)]
    pub base_dir: Option<String>,

    /// Interval between archive passes (e.g. "30m"). Absent means run once.
    #[serde(default, with = "humantime_serde")]
    pub archive_interval: Option<Duration>,

    /// HTTP bind address for metrics & health endpoints
    #[serde(default)]
    pub server_bind: Option<String>,

    /// Where partitions are written
    pub storage: StorageSettings,
}

/// Storage backend selection.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageSettings {
    /// Daily partitions with a month index in an S3 bucket
    S3(S3Settings),
    /// Daily append-mode files under a local directory
    Local { dir: PathBuf },
    /// Every record into one JSON-lines file
    SingleFile { path: PathBuf },
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible stores
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl Settings {
    /// Load settings from `Config.toml` (if present),
    /// then apply any overrides from these environment variables:
    ///
    /// - `APP__XRPC_HOST`
    /// - `APP__ACTOR`
    /// - `APP__ACCESS_TOKEN`
    /// - `APP__TIME_ZONE`
    /// - `APP__ARCHIVE_INTERVAL`
    /// - `APP__SERVER_BIND`
    pub fn new() -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .add_source(File::with_name("Config").required(false))
            .build()?;
        Self::from_config(cfg)
    }

    pub fn from_config(cfg: Config) -> Result<Self, ConfigError> {
        let mut settings: Settings = cfg.try_deserialize()?;

        if let Ok(val) = env::var("APP__XRPC_HOST") {
            settings.xrpc_host = val;
        }
        if let Ok(val) = env::var("APP__ACTOR") {
            settings.actor = val;
        }
        if let Ok(val) = env::var("APP__ACCESS_TOKEN") {
            settings.access_token = Some(val);
        }
        if let Ok(val) = env::var("APP__TIME_ZONE") {
            settings.time_zone = val;
        }
        if let Ok(val) = env::var("APP__ARCHIVE_INTERVAL") {
            settings.archive_interval = Some(
                humantime::parse_duration(&val).map_err(|e| ConfigError::Foreign(Box::new(e)))?,
            );
        }
        if let Ok(val) = env::var("APP__SERVER_BIND") {
            settings.server_bind = Some(val);
        }

        // fail at load time rather than on the first record
        settings.zone()?;
        Ok(settings)
    }

    pub fn zone(&self) -> Result<Zone, ConfigError> {
        self.time_zone.parse::<Zone>().map_err(ConfigError::Message)
    }

    pub fn base_dir(&self) -> &str {
        self.base_dir.as_deref().unwrap_or(&self.actor)
    }
}
