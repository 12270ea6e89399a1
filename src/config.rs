use std::env;
use std::time::Duration;
use url::Url;

const DEFAULT_PLATE_URL: &str = "https://api.platerecognizer.com/v1/plate-reader/";
const DEFAULT_REGIONS: &str = "bo";
const DEFAULT_DATABASE_PATH: &str = "/data/residencial.db";
const DEFAULT_PORT: u16 = 8402;
const DEFAULT_TIMEOUT_SECS: u64 = 20;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} is not a valid URL: {source}")]
    InvalidUrl {
        key: &'static str,
        source: url::ParseError,
    },
    #[error("{key} must be a valid integer in range, got '{value}'")]
    InvalidNumber { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Provider token. `None` leaves the server up but every scan fails with 500.
    pub plate_token: Option<String>,
    pub plate_url: Url,
    pub plate_regions: Vec<String>,
    pub plate_timeout: Duration,
    pub retry_backoff: Duration,
    pub database_path: String,
    pub port: u16,
    pub max_upload_bytes: u64,
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        Config::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let plate_url = match non_empty("PLATE_URL") {
            Some(raw) => Url::parse(raw.trim()).map_err(|source| ConfigError::InvalidUrl {
                key: "PLATE_URL",
                source,
            })?,
            None => Url::parse(DEFAULT_PLATE_URL).map_err(|source| ConfigError::InvalidUrl {
                key: "PLATE_URL",
                source,
            })?,
        };

        let regions = non_empty("PLATE_REGIONS").unwrap_or_else(|| DEFAULT_REGIONS.to_string());

        Ok(Config {
            plate_token: non_empty("PLATE_TOKEN").map(|t| t.trim().to_string()),
            plate_url,
            plate_regions: split_regions(&regions),
            plate_timeout: Duration::from_secs(positive(
                "PLATE_TIMEOUT_SECS",
                non_empty("PLATE_TIMEOUT_SECS"),
                DEFAULT_TIMEOUT_SECS,
            )?),
            retry_backoff: Duration::from_millis(number(
                "PLATE_RETRY_BACKOFF_MS",
                non_empty("PLATE_RETRY_BACKOFF_MS"),
                DEFAULT_RETRY_BACKOFF_MS,
            )?),
            database_path: non_empty("DATABASE_PATH")
                .unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string()),
            port: number("PORT", non_empty("PORT"), DEFAULT_PORT)?,
            max_upload_bytes: number(
                "MAX_UPLOAD_BYTES",
                non_empty("MAX_UPLOAD_BYTES"),
                DEFAULT_MAX_UPLOAD_BYTES,
            )?,
        })
    }
}

/// Splits a comma-separated region hint ("bo, pe") into its trimmed parts.
pub fn split_regions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(|r| r.to_ascii_lowercase())
        .collect()
}

fn number<T: std::str::FromStr>(
    key: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { key, value: v }),
        None => Ok(default),
    }
}

/// Like `number`, but zero is rejected.
fn positive(key: &'static str, value: Option<String>, default: u64) -> Result<u64, ConfigError> {
    match number(key, value.clone(), default)? {
        0 => Err(ConfigError::InvalidNumber {
            key,
            value: value.unwrap_or_default(),
        }),
        n => Ok(n),
    }
}
