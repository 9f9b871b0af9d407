//! Process configuration read from the environment

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub port: u16,
    pub uploads_dir: PathBuf,
    /// Conversations and workers idle longer than this are dropped
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let db_path = lookup("TUTOR_DESK_DB_PATH").map_or_else(
            || {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".tutor-desk").join("tutor_desk.db")
            },
            PathBuf::from,
        );

        let port = match lookup("TUTOR_DESK_PORT") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                var: "TUTOR_DESK_PORT",
                expected: "a port number",
                value,
            })?,
            None => 8000,
        };

        let uploads_dir = lookup("TUTOR_DESK_UPLOADS_DIR").map_or_else(|| PathBuf::from("uploads"), PathBuf::from);

        Ok(Self {
            db_path,
            port,
            uploads_dir,
            idle_timeout: seconds(&lookup, "TUTOR_DESK_IDLE_TIMEOUT_SECS", 1800)?,
            sweep_interval: seconds(&lookup, "TUTOR_DESK_SWEEP_INTERVAL_SECS", 60)?,
        })
    }
}

fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let Some(value) = lookup(var) else {
        return Ok(Duration::from_secs(default));
    };
    match value.parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::Invalid {
            var,
            expected: "a positive number of seconds",
            value,
        }),
    }
}
