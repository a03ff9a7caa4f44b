//! Runtime configuration, read once from the environment at startup.
//!
//! A `.env` file in the working directory is honoured outside of tests.

use std::path::PathBuf;
use std::time::Duration;

pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("missing the environment variable {0}")]
    MissingVar(String),
    #[error("invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Which message gateway the reminder pipeline talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayKind {
    /// Random delivery with a 90% success rate.
    Simulated,
    AlwaysSent,
    AlwaysFailed,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub data_dir: PathBuf,
    pub users_path: PathBuf,
    pub jwt_secret: String,
    pub session_ttl: chrono::Duration,
    pub gateway: GatewayKind,
    /// `None` disables the background reminder job.
    pub reminder_interval: Option<Duration>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = parse_or("PORT", &lookup, 8080u16)?;

        let data_dir = lookup("STOKVEL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data"));
        let users_path = lookup("STOKVEL_USERS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("users.json"));

        let jwt_secret =
            lookup("JWT_SECRET").ok_or_else(|| ConfigError::MissingVar("JWT_SECRET".to_string()))?;
        if jwt_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::InvalidValue(
                "JWT_SECRET".to_string(),
                format!("must be at least {MIN_SECRET_LEN} characters long"),
            ));
        }

        let ttl_hours = parse_or("SESSION_TTL_HOURS", &lookup, 168i64)?;
        if ttl_hours <= 0 {
            return Err(ConfigError::InvalidValue(
                "SESSION_TTL_HOURS".to_string(),
                "must be positive".to_string(),
            ));
        }

        let gateway = match lookup("SMS_GATEWAY").as_deref().map(str::trim) {
            None | Some("simulated") => GatewayKind::Simulated,
            Some("always-sent") => GatewayKind::AlwaysSent,
            Some("always-failed") => GatewayKind::AlwaysFailed,
            Some(other) => {
                return Err(ConfigError::InvalidValue(
                    "SMS_GATEWAY".to_string(),
                    format!("'{other}' is not one of simulated, always-sent, always-failed"),
                ));
            }
        };

        let interval_secs = parse_or("REMINDER_JOB_INTERVAL_SECS", &lookup, 3600u64)?;
        let reminder_interval = (interval_secs > 0).then(|| Duration::from_secs(interval_secs));

        Ok(Self {
            port,
            data_dir,
            users_path,
            jwt_secret,
            session_ttl: chrono::Duration::hours(ttl_hours),
            gateway,
            reminder_interval,
        })
    }
}

fn parse_or<T, F>(key: &str, lookup: &F, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|err| ConfigError::InvalidValue(key.to_string(), err.to_string())),
        None => Ok(default),
    }
}
