//! Environment-driven configuration structures shared by all binaries.

use std::{env, str::FromStr, time::Duration};

use strum_macros::{Display, EnumString};
use thiserror::Error;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_TEARDOWN_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;
pub const DEFAULT_MAX_POLL_FAILURES: u32 = 3;
pub const DEFAULT_MAX_BLOCK_BATCH: u64 = 32;

/// Which event source strategy the relay drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SourceMode {
    Push,
    #[default]
    Poll,
}

/// Session and adapter tuning knobs. Also constructible directly so tests and
/// embedders do not need to touch the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub poll_interval: Duration,
    pub teardown_timeout: Duration,
    pub channel_capacity: usize,
    pub max_poll_failures: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            teardown_timeout: Duration::from_millis(DEFAULT_TEARDOWN_TIMEOUT_MS),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_poll_failures: DEFAULT_MAX_POLL_FAILURES,
        }
    }
}

/// Key configuration derived from `.env`/process variables for the relay
/// binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    ledger_http_url: String,
    ledger_ws_url: String,
    watch_bind_address: String,
    api_bind_address: String,
    source_mode: SourceMode,
    max_block_batch: u64,
    session: SessionSettings,
}

impl WatchConfig {
    /// Loads configuration by hydrating `.env` (if present) and reading the
    /// process variables. Missing or malformed entries surface as
    /// `ConfigError` so binaries can respond gracefully.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        let ledger_http_url = get_required_var("LEDGER_HTTP_URL")?;
        let ledger_ws_url = get_optional_var("LEDGER_WS_URL")
            .unwrap_or_else(|| derive_ws_url(&ledger_http_url));
        let source_mode = match get_optional_var("WATCH_SOURCE_MODE") {
            Some(raw) => SourceMode::from_str(&raw).map_err(|_| ConfigError::InvalidValue {
                key: "WATCH_SOURCE_MODE",
                value: raw,
            })?,
            None => SourceMode::default(),
        };

        let session = SessionSettings {
            poll_interval: Duration::from_millis(get_positive_or(
                "WATCH_POLL_INTERVAL_MS",
                DEFAULT_POLL_INTERVAL_MS,
            )?),
            teardown_timeout: Duration::from_millis(get_number_or(
                "WATCH_TEARDOWN_TIMEOUT_MS",
                DEFAULT_TEARDOWN_TIMEOUT_MS,
            )?),
            channel_capacity: get_number_or("WATCH_CHANNEL_CAPACITY", DEFAULT_CHANNEL_CAPACITY)?
                .max(1),
            max_poll_failures: get_number_or("WATCH_MAX_POLL_FAILURES", DEFAULT_MAX_POLL_FAILURES)?
                .max(1),
        };

        Ok(Self {
            ledger_http_url,
            ledger_ws_url,
            watch_bind_address: get_required_var("WATCH_BIND_ADDRESS")?,
            api_bind_address: get_required_var("API_BIND_ADDRESS")?,
            source_mode,
            max_block_batch: get_number_or("WATCH_MAX_BLOCK_BATCH", DEFAULT_MAX_BLOCK_BATCH)?.max(1),
            session,
        })
    }

    pub fn ledger_http_url(&self) -> &str {
        &self.ledger_http_url
    }

    pub fn ledger_ws_url(&self) -> &str {
        &self.ledger_ws_url
    }

    pub fn watch_bind_address(&self) -> &str {
        &self.watch_bind_address
    }

    pub fn api_bind_address(&self) -> &str {
        &self.api_bind_address
    }

    pub fn source_mode(&self) -> SourceMode {
        self.source_mode
    }

    pub fn max_block_batch(&self) -> u64 {
        self.max_block_batch
    }

    pub fn session(&self) -> SessionSettings {
        self.session
    }
}

fn derive_ws_url(http_url: &str) -> String {
    http_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1)
}

fn get_required_var(key: &'static str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                Err(ConfigError::MissingVar { key })
            } else {
                Ok(trimmed.to_string())
            }
        }
        Err(_) => Err(ConfigError::MissingVar { key }),
    }
}

fn get_optional_var(key: &'static str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn get_number_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr<Err = std::num::ParseIntError>,
{
    match get_optional_var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|source| ConfigError::InvalidNumber { key, source }),
        None => Ok(default),
    }
}

/// Like `get_number_or`, but zero is an invalid value rather than a default.
fn get_positive_or(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match get_number_or(key, default)? {
        0 => Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
        }),
        value => Ok(value),
    }
}

pub fn hydrate_env_file() -> Result<(), ConfigError> {
    if env::var_os("LEDGER_WATCH_SKIP_DOTENV").is_some() {
        return Ok(());
    }
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(ConfigError::Dotenv { source: err }),
    }

    Ok(())
}

/// Errors emitted when `.env` hydration or environment parsing fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable `{key}`")]
    MissingVar { key: &'static str },
    #[error("invalid integer in `{key}`: {source}")]
    InvalidNumber {
        key: &'static str,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("invalid value `{value}` in `{key}`")]
    InvalidValue { key: &'static str, value: String },
    #[error("failed to load .env file: {source}")]
    Dotenv {
        #[from]
        source: dotenvy::Error,
    },
}
