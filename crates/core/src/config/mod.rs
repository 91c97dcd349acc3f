use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::util::backoff::ExponentialBackoff;

/// Default number of dial workers running at once.
pub const DEFAULT_MAX_PARALLEL_RECONNECTS: usize = 5;
/// Default delay before retrying after the first failed dial.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// Default growth of the retry delay per consecutive failure.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
/// Default upper bound for the retry delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Default fraction of the retry delay added at random.
pub const DEFAULT_JITTER: f64 = 0.1;
/// Default time a single dial may take before it counts as failed.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
/// Default time `stop` waits for workers before aborting them.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("max-parallel-reconnects must be at least 1")]
    NoWorkers,
    #[error("max-attempts must be at least 1 when set")]
    ZeroAttempts,
    #[error("backoff-factor must be a finite number >= 1.0, got {0}")]
    BackoffFactor(f64),
    #[error("jitter must be a finite non-negative number, got {0}")]
    Jitter(f64),
    #[error("retry-interval-ms ({retry_interval_ms}) exceeds max-backoff-ms ({max_backoff_ms})")]
    BackoffBounds {
        retry_interval_ms: u64,
        max_backoff_ms: u64,
    },
    #[error("dial-timeout-ms must be greater than zero")]
    ZeroDialTimeout,
}

/// Command line and environment overrides. Every field left unset falls back
/// to the configuration file, then to the built-in default.
#[derive(clap::Parser, Debug, Default, Clone, Serialize, Deserialize)]
pub struct ConfigArgs {
    /// Directory holding a `config.toml` or `config.json` file.
    #[arg(long, env = "RECONNECT_CONFIG_DIR")]
    #[serde(skip)]
    pub config_dir: Option<PathBuf>,

    /// Maximum number of dials in flight at once.
    #[arg(long, env = "MAX_PARALLEL_RECONNECTS")]
    #[serde(
        rename = "max-parallel-reconnects",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_parallel_reconnects: Option<usize>,

    /// Give up on a peer after this many failed dials. Retries forever when unset.
    #[arg(long, env = "MAX_RECONNECT_ATTEMPTS")]
    #[serde(rename = "max-attempts", skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Delay before the first retry, in milliseconds.
    #[arg(long, env = "RETRY_INTERVAL_MS")]
    #[serde(rename = "retry-interval-ms", skip_serializing_if = "Option::is_none")]
    pub retry_interval_ms: Option<u64>,

    /// Multiplier applied to the retry delay after every failure.
    #[arg(long, env = "BACKOFF_FACTOR")]
    #[serde(rename = "backoff-factor", skip_serializing_if = "Option::is_none")]
    pub backoff_factor: Option<f64>,

    /// Upper bound for the retry delay, in milliseconds.
    #[arg(long, env = "MAX_BACKOFF_MS")]
    #[serde(rename = "max-backoff-ms", skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<u64>,

    /// Fraction of the retry delay added at random.
    #[arg(long, env = "RETRY_JITTER")]
    #[serde(rename = "jitter", skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,

    /// Time a single dial may take, in milliseconds.
    #[arg(long, env = "DIAL_TIMEOUT_MS")]
    #[serde(rename = "dial-timeout-ms", skip_serializing_if = "Option::is_none")]
    pub dial_timeout_ms: Option<u64>,

    /// Time stop waits for running dials, in milliseconds.
    #[arg(long, env = "SHUTDOWN_GRACE_MS")]
    #[serde(rename = "shutdown-grace-ms", skip_serializing_if = "Option::is_none")]
    pub shutdown_grace_ms: Option<u64>,

    /// Pull a backed-off peer forward when it disconnects again.
    #[arg(long, env = "RESET_BACKOFF_ON_RESUBMIT")]
    #[serde(
        rename = "reset-backoff-on-resubmit",
        skip_serializing_if = "Option::is_none"
    )]
    pub reset_backoff_on_resubmit: Option<bool>,

    #[arg(long, env = "LOG_LEVEL")]
    #[serde(skip)]
    pub log_level: Option<LevelFilter>,
}

impl ConfigArgs {
    fn read_config(dir: &Path) -> std::io::Result<Option<ReconnectConfig>> {
        if !dir.exists() {
            return Ok(None);
        }
        let config_file = std::fs::read_dir(dir)?.find_map(|e| {
            let e = e.ok()?;
            if e.path().is_dir() {
                return None;
            }
            let filename = e.file_name().to_string_lossy().into_owned();
            if !filename.starts_with("config") {
                return None;
            }
            let ext = filename.rsplit('.').next()?.to_owned();
            matches!(ext.as_str(), "toml" | "json").then(|| (e.path(), ext))
        });

        let Some((path, ext)) = config_file else {
            return Ok(None);
        };
        tracing::debug!(path = ?path, "Reading configuration file");
        let mut content = String::new();
        File::open(&path)?.read_to_string(&mut content)?;
        let config = match ext.as_str() {
            "toml" => toml::from_str::<ReconnectConfig>(&content).map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
            })?,
            _ => serde_json::from_str::<ReconnectConfig>(&content)?,
        };
        Ok(Some(config))
    }

    /// Resolves the final configuration: file, then overrides, then validation.
    pub fn build(self) -> anyhow::Result<ReconnectConfig> {
        let mut config = match self.config_dir.as_deref() {
            Some(dir) => {
                if !dir.exists() {
                    anyhow::bail!("configuration directory {} not found", dir.display());
                }
                Self::read_config(dir)?.unwrap_or_default()
            }
            None => ReconnectConfig::default(),
        };

        if let Some(v) = self.max_parallel_reconnects {
            config.max_parallel_reconnects = v;
        }
        if let Some(v) = self.max_attempts {
            config.max_attempts = Some(v);
        }
        if let Some(v) = self.retry_interval_ms {
            config.retry_interval_ms = v;
        }
        if let Some(v) = self.backoff_factor {
            config.backoff_factor = v;
        }
        if let Some(v) = self.max_backoff_ms {
            config.max_backoff_ms = v;
        }
        if let Some(v) = self.jitter {
            config.jitter = v;
        }
        if let Some(v) = self.dial_timeout_ms {
            config.dial_timeout_ms = v;
        }
        if let Some(v) = self.shutdown_grace_ms {
            config.shutdown_grace_ms = v;
        }
        if let Some(v) = self.reset_backoff_on_resubmit {
            config.reset_backoff_on_resubmit = v;
        }
        if let Some(v) = self.log_level {
            config.log_level = v;
        }

        config.validate()?;
        Ok(config)
    }
}

mod serde_log_level_filter {
    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::level_filters::LevelFilter;

    pub fn parse_log_level_str<'a, D>(level: &str) -> Result<LevelFilter, D::Error>
    where
        D: serde::Deserializer<'a>,
    {
        Ok(match level.trim() {
            "off" | "Off" | "OFF" => LevelFilter::OFF,
            "error" | "Error" | "ERROR" => LevelFilter::ERROR,
            "warn" | "Warn" | "WARN" => LevelFilter::WARN,
            "info" | "Info" | "INFO" => LevelFilter::INFO,
            "debug" | "Debug" | "DEBUG" => LevelFilter::DEBUG,
            "trace" | "Trace" | "TRACE" => LevelFilter::TRACE,
            s => return Err(serde::de::Error::custom(format!("unknown log level: {s}"))),
        })
    }

    pub fn serialize<S>(level: &LevelFilter, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&level.to_string().to_lowercase())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = String::deserialize(deserializer)?;
        parse_log_level_str::<D>(level.as_str())
    }
}

/// Settings of the reconnection queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReconnectConfig {
    #[serde(default = "default_max_parallel_reconnects")]
    pub max_parallel_reconnects: usize,
    /// `None` retries until the dial succeeds or the queue stops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub reset_backoff_on_resubmit: bool,
    #[serde(default = "default_log_level", with = "serde_log_level_filter")]
    pub log_level: LevelFilter,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_parallel_reconnects: default_max_parallel_reconnects(),
            max_attempts: None,
            retry_interval_ms: default_retry_interval_ms(),
            backoff_factor: default_backoff_factor(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: default_jitter(),
            dial_timeout_ms: default_dial_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            reset_backoff_on_resubmit: false,
            log_level: default_log_level(),
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_reconnects == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::ZeroAttempts);
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::BackoffFactor(self.backoff_factor));
        }
        if !self.jitter.is_finite() || self.jitter < 0.0 {
            return Err(ConfigError::Jitter(self.jitter));
        }
        if self.retry_interval_ms > self.max_backoff_ms {
            return Err(ConfigError::BackoffBounds {
                retry_interval_ms: self.retry_interval_ms,
                max_backoff_ms: self.max_backoff_ms,
            });
        }
        if self.dial_timeout_ms == 0 {
            return Err(ConfigError::ZeroDialTimeout);
        }
        Ok(())
    }

    /// Retry schedule derived from the settings. Jitter above
    /// `backoff_factor - 1` is clamped down to it.
    pub fn backoff(&self) -> ExponentialBackoff {
        let backoff = ExponentialBackoff::new(self.retry_interval(), self.max_backoff())
            .with_factor(self.backoff_factor)
            .with_jitter(self.jitter);
        if backoff.jitter() < self.jitter {
            tracing::debug!(
                requested = self.jitter,
                applied = backoff.jitter(),
                "Retry jitter clamped to backoff growth"
            );
        }
        backoff
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

const fn default_max_parallel_reconnects() -> usize {
    DEFAULT_MAX_PARALLEL_RECONNECTS
}

const fn default_retry_interval_ms() -> u64 {
    DEFAULT_RETRY_INTERVAL.as_millis() as u64
}

fn default_backoff_factor() -> f64 {
    DEFAULT_BACKOFF_FACTOR
}

const fn default_max_backoff_ms() -> u64 {
    DEFAULT_MAX_BACKOFF.as_millis() as u64
}

fn default_jitter() -> f64 {
    DEFAULT_JITTER
}

const fn default_dial_timeout_ms() -> u64 {
    DEFAULT_DIAL_TIMEOUT.as_millis() as u64
}

const fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE.as_millis() as u64
}

const fn default_log_level() -> LevelFilter {
    LevelFilter::INFO
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = ReconnectConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.max_parallel_reconnects, 5);
        assert_eq!(config.backoff().base(), Duration::from_secs(1));
    }

    #[test]
    fn rejects_invalid_values() {
        let base = ReconnectConfig::default();
        let cases = [
            (
                ReconnectConfig {
                    max_parallel_reconnects: 0,
                    ..base.clone()
                },
                ConfigError::NoWorkers,
            ),
            (
                ReconnectConfig {
                    max_attempts: Some(0),
                    ..base.clone()
                },
                ConfigError::ZeroAttempts,
            ),
            (
                ReconnectConfig {
                    backoff_factor: 0.5,
                    ..base.clone()
                },
                ConfigError::BackoffFactor(0.5),
            ),
            (
                ReconnectConfig {
                    jitter: -0.1,
                    ..base.clone()
                },
                ConfigError::Jitter(-0.1),
            ),
            (
                ReconnectConfig {
                    retry_interval_ms: 10_000,
                    max_backoff_ms: 1_000,
                    ..base.clone()
                },
                ConfigError::BackoffBounds {
                    retry_interval_ms: 10_000,
                    max_backoff_ms: 1_000,
                },
            ),
            (
                ReconnectConfig {
                    dial_timeout_ms: 0,
                    ..base.clone()
                },
                ConfigError::ZeroDialTimeout,
            ),
        ];
        for (config, expected) in cases {
            assert_eq!(config.validate(), Err(expected));
        }
    }

    #[test]
    fn backoff_clamps_excess_jitter() {
        let config = ReconnectConfig {
            backoff_factor: 1.5,
            jitter: 0.9,
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.backoff().jitter(), 0.5);
    }

    #[test]
    fn toml_file_fills_missing_fields_with_defaults() -> testresult::TestResult {
        let dir = tempfile::tempdir()?;
        let mut file = File::create(dir.path().join("config.toml"))?;
        writeln!(file, "max-parallel-reconnects = 2")?;
        writeln!(file, "max-attempts = 7")?;
        writeln!(file, "log-level = \"debug\"")?;

        let config = ConfigArgs {
            config_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        }
        .build()?;
        assert_eq!(config.max_parallel_reconnects, 2);
        assert_eq!(config.max_attempts, Some(7));
        assert_eq!(config.log_level, LevelFilter::DEBUG);
        assert_eq!(config.retry_interval_ms, 1_000);
        Ok(())
    }

    #[test]
    fn args_override_json_file() -> testresult::TestResult {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"max-parallel-reconnects": 3, "jitter": 0.0, "reset-backoff-on-resubmit": true}"#,
        )?;

        let config = ConfigArgs {
            config_dir: Some(dir.path().to_path_buf()),
            max_parallel_reconnects: Some(9),
            ..Default::default()
        }
        .build()?;
        assert_eq!(config.max_parallel_reconnects, 9);
        assert_eq!(config.jitter, 0.0);
        assert!(config.reset_backoff_on_resubmit);
        Ok(())
    }

    #[test]
    fn log_level_resolves_from_file_then_args() -> testresult::TestResult {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("config.toml"), "log-level = \"trace\"\n")?;

        let from_file = ConfigArgs {
            config_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        }
        .build()?;
        assert_eq!(from_file.log_level, LevelFilter::TRACE);

        let overridden = ConfigArgs {
            config_dir: Some(dir.path().to_path_buf()),
            log_level: Some(LevelFilter::ERROR),
            ..Default::default()
        }
        .build()?;
        assert_eq!(overridden.log_level, LevelFilter::ERROR);
        Ok(())
    }

    #[test]
    fn missing_config_dir_is_an_error() {
        let args = ConfigArgs {
            config_dir: Some(PathBuf::from("/definitely/not/here")),
            ..Default::default()
        };
        assert!(args.build().is_err());
    }

    #[test]
    fn invalid_override_fails_validation() {
        let args = ConfigArgs {
            max_parallel_reconnects: Some(0),
            ..Default::default()
        };
        let err = args.build().unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::NoWorkers)
        );
    }

    #[test]
    fn serialized_config_reads_back() -> testresult::TestResult {
        let config = ReconnectConfig {
            max_attempts: Some(3),
            log_level: LevelFilter::WARN,
            ..Default::default()
        };
        let text = toml::to_string(&config)?;
        assert!(text.contains("max-attempts = 3"));
        assert!(text.contains("log-level = \"warn\""));
        assert_eq!(toml::from_str::<ReconnectConfig>(&text)?, config);
        Ok(())
    }
}
