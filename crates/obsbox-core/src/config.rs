//! Environment-provided configuration. All operational tuning values carry
//! documented defaults; only connection endpoints are required.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value '{value}' for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Bounded exponential backoff: `initial * 2^attempt`, capped at `max`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub endpoint: Option<String>,
    pub bucket_incoming: String,
    pub bucket_public: String,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub broker_url: String,
    pub storage: StorageSettings,
    pub api_url: String,
    /// Public base URL used to build notification hrefs.
    pub public_url: String,
    pub events_topic: String,
    pub workers: usize,
    pub queue_depth: usize,
    pub dedup_window: usize,
    pub max_event_attempts: u32,
    pub storage_retry: RetryPolicy,
    pub notify_retry: RetryPolicy,
    pub staleness_window: chrono::Duration,
    pub clock_skew: chrono::Duration,
    pub bounds_tolerance_deg: f64,
    pub skip_ratio_threshold: f64,
    pub dead_letter_dir: PathBuf,
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parsed_or<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

impl Settings {
    /// Reads `OBSBOX_*` variables. `OBSBOX_BROKER_URL`, `OBSBOX_API_URL` and
    /// `OBSBOX_URL` are required; everything else has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let storage = StorageSettings {
            endpoint: optional("OBSBOX_STORAGE_ENDPOINT"),
            bucket_incoming: optional("OBSBOX_STORAGE_INCOMING")
                .unwrap_or_else(|| "obsbox-incoming".to_string()),
            bucket_public: optional("OBSBOX_STORAGE_PUBLIC")
                .unwrap_or_else(|| "obsbox-public".to_string()),
            region: optional("OBSBOX_STORAGE_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            access_key_id: optional("OBSBOX_STORAGE_USERNAME"),
            secret_access_key: optional("OBSBOX_STORAGE_PASSWORD"),
            force_path_style: parsed_or("OBSBOX_STORAGE_PATH_STYLE", true)?,
        };

        Ok(Self {
            broker_url: required("OBSBOX_BROKER_URL")?,
            storage,
            api_url: required("OBSBOX_API_URL")?,
            public_url: required("OBSBOX_URL")?,
            events_topic: optional("OBSBOX_EVENTS_TOPIC")
                .unwrap_or_else(|| "storage-events/#".to_string()),
            workers: parsed_or("OBSBOX_WORKERS", 4)?,
            queue_depth: parsed_or("OBSBOX_QUEUE_DEPTH", 64)?,
            dedup_window: parsed_or("OBSBOX_DEDUP_WINDOW", 512)?,
            max_event_attempts: parsed_or("OBSBOX_MAX_EVENT_ATTEMPTS", 3)?,
            storage_retry: RetryPolicy {
                max_attempts: parsed_or("OBSBOX_STORAGE_RETRIES", 4)?,
                ..RetryPolicy::default()
            },
            notify_retry: RetryPolicy {
                max_attempts: parsed_or("OBSBOX_NOTIFY_RETRIES", 4)?,
                ..RetryPolicy::default()
            },
            staleness_window: chrono::Duration::hours(parsed_or(
                "OBSBOX_STALENESS_HOURS",
                24 * 30,
            )?),
            clock_skew: chrono::Duration::seconds(parsed_or("OBSBOX_CLOCK_SKEW_SECS", 300)?),
            bounds_tolerance_deg: parsed_or("OBSBOX_BOUNDS_TOLERANCE_DEG", 0.5)?,
            skip_ratio_threshold: parsed_or("OBSBOX_SKIP_RATIO_THRESHOLD", 0.5)?,
            dead_letter_dir: PathBuf::from(
                optional("OBSBOX_DEAD_LETTER_DIR").unwrap_or_else(|| "dead-letters".to_string()),
            ),
        })
    }
}
