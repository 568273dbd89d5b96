use config::{Config, ConfigError, Environment, File};
use redb::Durability;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    None,
    Eventual,
    Immediate,
}

impl FromStr for DurabilityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(DurabilityMode::None),
            "eventual" => Ok(DurabilityMode::Eventual),
            "immediate" => Ok(DurabilityMode::Immediate),
            _ => Err(format!("Invalid value for durability: {}", s)),
        }
    }
}

impl From<DurabilityMode> for Durability {
    fn from(mode: DurabilityMode) -> Self {
        match mode {
            DurabilityMode::None => Durability::None,
            DurabilityMode::Eventual => Durability::Eventual,
            DurabilityMode::Immediate => Durability::Immediate,
        }
    }
}

impl<'de> serde::Deserialize<'de> for DurabilityMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DurabilityMode::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub storage: StorageSettings,
    #[serde(default)]
    pub maintainer: MaintainerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub db_path: String,
    pub db_cache_size_mb: usize,
    pub durability: DurabilityMode,
}

impl StorageSettings {
    pub fn db_dir(&self) -> PathBuf {
        PathBuf::from(&self.db_path)
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            db_path: std::env::temp_dir().join("redagg").to_string_lossy().into_owned(),
            db_cache_size_mb: 64,
            durability: DurabilityMode::Immediate,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MaintainerSettings {
    /// Skip writes whose recomputed value equals the stored one.
    pub skip_unchanged: bool,
    /// Compare every recomputed parent against a fresh evaluation after the flush.
    pub verify_after_flush: bool,
}

impl Default for MaintainerSettings {
    fn default() -> Self {
        MaintainerSettings { skip_unchanged: true, verify_after_flush: false }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoggingSettings {
    /// Print `debug!` traces of scheduling, recompute and storage writes.
    pub debug: bool,
}

impl AppConfig {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let builder =
            Config::builder()
                .add_source(File::with_name(path).required(true))
                .add_source(Environment::with_prefix("REDAGG").try_parsing(true).separator("__"));
        builder.build()?.try_deserialize()
    }
}
