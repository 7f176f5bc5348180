//! Server configuration: TOML sections and the loader trait.
//!
//! `[shared]` names the instance and its log level, `[acquisition]` fixes the
//! base rate, task decimations and ring history, `[mailbox]` the retry budget
//! of subscription changes.
//!
//! # Usage
//!
//! ```rust,no_run
//! use daq_common::config::{ConfigLoader, ServerConfig, ConfigError};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = ServerConfig::load(Path::new("daq.toml"))?;
//!     config.validate()?;
//!     for tid in 0..config.acquisition.decimation_per_tid.len() {
//!         println!("task {tid}: {:?} s", config.acquisition.sample_time(tid));
//!     }
//!     Ok(())
//! }
//! ```

use crate::consts::{
    DEFAULT_BUFFER_SECONDS, DEFAULT_MAILBOX_MAX_ATTEMPTS, DEFAULT_MAILBOX_RETRY_INTERVAL,
    DEFAULT_POLL_INTERVAL,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Failure to read, parse or validate a configuration file.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// No file at the given path.
    #[error("configuration file not found")]
    FileNotFound,

    /// Unreadable file or invalid TOML.
    #[error("cannot parse configuration: {0}")]
    ParseError(String),

    /// Parsed, but a value is out of range.
    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

/// Default log filter of the server, written lowercase in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Every frame and cursor event.
    Trace,
    /// Subscription changes, resyncs, deliveries.
    Debug,
    /// Setup and shutdown.
    #[default]
    Info,
    /// Lost frames, full mailboxes.
    Warn,
    /// Fatal setup errors only.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_filter(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Common configuration fields shared across all DAQ applications.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "daq-server-01"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Log filter when `RUST_LOG` is unset.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Instance name, printed at startup.
    pub service_name: String,
}

impl SharedConfig {
    /// Reject an empty `service_name`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "shared.service_name is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Arena sizing and task rates.
///
/// Task `tid` runs every `decimation_per_tid[tid]` base ticks, so its sample
/// time is `base_sample_time * decimation_per_tid[tid]`.
///
/// ```toml
/// [acquisition]
/// base_sample_time = 0.001
/// buffer_seconds = 2.0
/// decimation_per_tid = [1, 10]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Base tick period in seconds.
    pub base_sample_time: f64,

    /// Seconds of history each frame ring keeps.
    #[serde(default = "default_buffer_seconds")]
    pub buffer_seconds: f64,

    /// Base ticks per task tick, one entry per task.
    #[serde(default = "default_decimation_per_tid")]
    pub decimation_per_tid: Vec<u32>,

    /// Session poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Lock arena pages into RAM.
    #[serde(default)]
    pub lock_memory: bool,
}

impl AcquisitionConfig {
    /// Sample time of task `tid` in seconds.
    pub fn sample_time(&self, tid: usize) -> Option<f64> {
        self.decimation_per_tid
            .get(tid)
            .map(|&d| self.base_sample_time * d as f64)
    }

    /// Session poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Validate sample time, buffer length and task table.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_sample_time.is_finite() && self.base_sample_time > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "base_sample_time must be > 0 (got {})",
                self.base_sample_time
            )));
        }
        if !(self.buffer_seconds.is_finite() && self.buffer_seconds > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "buffer_seconds must be > 0 (got {})",
                self.buffer_seconds
            )));
        }
        if self.decimation_per_tid.is_empty() {
            return Err(ConfigError::ValidationError(
                "decimation_per_tid needs at least one task".to_string(),
            ));
        }
        if let Some(tid) = self.decimation_per_tid.iter().position(|&d| d == 0) {
            return Err(ConfigError::ValidationError(format!(
                "decimation_per_tid[{tid}] must be >= 1"
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_interval_ms must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry budget of a session enqueueing into a full mailbox.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MailboxConfig {
    /// Sleep between attempts in microseconds.
    #[serde(default = "default_retry_interval_us")]
    pub retry_interval_us: u64,

    /// Attempts before the subscription change is reported as failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl MailboxConfig {
    /// Sleep between attempts.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_micros(self.retry_interval_us)
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            retry_interval_us: default_retry_interval_us(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Complete server configuration file.
///
/// ```toml
/// [shared]
/// service_name = "daq-server"
///
/// [acquisition]
/// base_sample_time = 0.001
/// decimation_per_tid = [1, 10]
///
/// [mailbox]
/// max_attempts = 100
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Common fields.
    pub shared: SharedConfig,

    /// Task rates and arena sizing.
    pub acquisition: AcquisitionConfig,

    /// Mailbox retry budget.
    #[serde(default)]
    pub mailbox: MailboxConfig,
}

impl ServerConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.acquisition.validate()?;
        if self.mailbox.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "mailbox.max_attempts must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_buffer_seconds() -> f64 {
    DEFAULT_BUFFER_SECONDS
}

fn default_decimation_per_tid() -> Vec<u32> {
    vec![1]
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_retry_interval_us() -> u64 {
    DEFAULT_MAILBOX_RETRY_INTERVAL.as_micros() as u64
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAILBOX_MAX_ATTEMPTS
}

/// TOML loading for any deserializable configuration type.
///
/// A missing file is `FileNotFound`; I/O and syntax problems are
/// `ParseError`. Semantic checks are left to each type's `validate`.
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Read and parse `path`.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        Self::from_toml(&content)
    }

    /// Parse TOML text.
    fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

#[cfg(test)]
mod tests {
    use super::*;

    fn acquisition() -> AcquisitionConfig {
        AcquisitionConfig {
            base_sample_time: 0.001,
            buffer_seconds: 2.0,
            decimation_per_tid: vec![1, 10],
            poll_interval_ms: 100,
            lock_memory: false,
        }
    }

    #[test]
    fn test_log_level_filters() {
        #[derive(Deserialize)]
        struct Shared {
            log_level: LogLevel,
        }

        assert_eq!(LogLevel::default().as_filter(), "info");
        let parsed: Shared = toml::from_str("log_level = \"trace\"").unwrap();
        assert_eq!(parsed.log_level, LogLevel::Trace);
        assert!(toml::from_str::<Shared>("log_level = \"loud\"").is_err());
    }

    #[test]
    fn test_empty_service_name_rejected() {
        let shared = SharedConfig {
            log_level: LogLevel::Warn,
            service_name: String::new(),
        };
        assert!(matches!(shared.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_task_sample_times() {
        let cfg = acquisition();
        assert_eq!(cfg.sample_time(0), Some(0.001));
        assert!((cfg.sample_time(1).unwrap() - 0.01).abs() < 1e-12);
        assert_eq!(cfg.sample_time(2), None);
        assert_eq!(cfg.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_acquisition_validation() {
        assert!(acquisition().validate().is_ok());

        let mut cfg = acquisition();
        cfg.base_sample_time = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = acquisition();
        cfg.decimation_per_tid = vec![1, 0];
        assert!(cfg.validate().is_err());

        let mut cfg = acquisition();
        cfg.decimation_per_tid.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = acquisition();
        cfg.buffer_seconds = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_server_config_defaults() {
        let cfg = ServerConfig::from_toml(
            r#"
[shared]
service_name = "daq"

[acquisition]
base_sample_time = 0.001
"#,
        )
        .unwrap();
        assert_eq!(cfg.acquisition.buffer_seconds, DEFAULT_BUFFER_SECONDS);
        assert_eq!(cfg.acquisition.decimation_per_tid, vec![1]);
        assert_eq!(cfg.acquisition.poll_interval(), DEFAULT_POLL_INTERVAL);
        assert_eq!(cfg.mailbox.max_attempts, DEFAULT_MAILBOX_MAX_ATTEMPTS);
        assert!(cfg.validate().is_ok());
    }
}
