//! Daemon configuration: TOML file layered under `WARMUPD__*` environment variables.

use crate::transport::RetryPolicy;
use crate::warmup::engagement::EngagementPolicy;
use crate::warmup::engine::EngineSettings;
use crate::warmup::rescue::RescuePolicy;

use anyhow::Context as _;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix, e.g. `WARMUPD__SCHEDULER__INTERVAL_SECS=3600`.
const ENV_PREFIX: &str = "WARMUPD";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WarmupdConfig {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub transport: TransportConfig,
    pub rescue: RescueConfig,
    pub engagement: EngagementConfig,
    pub volume: VolumeConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
    /// Fixed seed for the engine's random source. `None` seeds from OS entropy.
    pub rng_seed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let path = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("warmupd")
            .join("warmupd.db");
        Self {
            path,
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
    /// How long shutdown waits for in-flight cycles before giving up on them.
    pub shutdown_grace_secs: u64,
    /// Lifetime of an account lease; renewed after every send.
    pub lease_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 6 * 3600,
            shutdown_grace_secs: 120,
            lease_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_secs: 30,
        }
    }
}

impl TransportConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RescueConfig {
    pub poll_attempts: u32,
    pub poll_interval_secs: u64,
    pub move_attempts: u32,
}

impl Default for RescueConfig {
    fn default() -> Self {
        Self {
            poll_attempts: 3,
            poll_interval_secs: 20,
            move_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngagementConfig {
    /// Probability that a message found in the inbox is opened.
    pub open_probability: f64,
    pub rescued_reply_delay_secs: u64,
    /// Messages still unlocated or unanswered after this long are closed.
    pub window_hours: i64,
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            open_probability: 1.0,
            rescued_reply_delay_secs: 5,
            window_hours: 72,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Width of the randomized volume band as a percentage of the daily limit.
    pub jitter_percent: u32,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self { jitter_percent: 20 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Trailing window for the deliverability score.
    pub window_days: u32,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { window_days: 30 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// When set, logs are also written to a daily rolling file in this directory.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,warmupd=debug".to_string(),
            directory: None,
        }
    }
}

impl WarmupdConfig {
    /// Default config file location (`~/.config/warmupd/config.toml` on Linux).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("warmupd").join("config.toml"))
    }

    /// Load configuration. An explicitly given path must exist; the default
    /// path is optional. Environment variables override file values.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None => {
                if let Some(default_path) = Self::default_path() {
                    builder =
                        builder.add_source(config::File::from(default_path).required(false));
                }
            }
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .context("failed to read warmupd configuration")?;

        settings
            .try_deserialize()
            .context("failed to parse warmupd configuration")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            rescue: RescuePolicy {
                poll_attempts: self.rescue.poll_attempts.max(1),
                poll_interval: Duration::from_secs(self.rescue.poll_interval_secs),
                move_attempts: self.rescue.move_attempts.max(1),
            },
            engagement: EngagementPolicy {
                open_probability: self.engagement.open_probability.clamp(0.0, 1.0),
                rescued_reply_delay: Duration::from_secs(self.engagement.rescued_reply_delay_secs),
            },
            jitter_percent: self.volume.jitter_percent.min(100),
            engagement_window: chrono::Duration::hours(self.engagement.window_hours.max(1)),
            metrics_window_days: self.metrics.window_days.max(1),
            lease_ttl: chrono::Duration::seconds(self.scheduler.lease_secs.clamp(60, 86_400) as i64),
        }
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.interval_secs.max(60))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.scheduler.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use std::io::Write as _;

    #[test]
    fn defaults_match_six_hour_cadence() {
        let config = WarmupdConfig::default();
        assert_eq!(config.scheduler.interval_secs, 21_600);
        assert_eq!(config.engagement.open_probability, 1.0);
        assert_eq!(config.volume.jitter_percent, 20);
        assert!(config.rng_seed.is_none());
    }

    #[test]
    fn load_reads_partial_file_and_keeps_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(
            indoc! {r#"
                rng_seed = 7

                [scheduler]
                interval_secs = 3600

                [rescue]
                poll_attempts = 5

                [engagement]
                open_probability = 0.9
            "#}
            .as_bytes(),
        )
        .unwrap();

        let config = WarmupdConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.rng_seed, Some(7));
        assert_eq!(config.scheduler.interval_secs, 3600);
        assert_eq!(config.scheduler.shutdown_grace_secs, 120);
        assert_eq!(config.scheduler.lease_secs, 1800);
        assert_eq!(config.rescue.poll_attempts, 5);
        assert_eq!(config.rescue.move_attempts, 3);

        let settings = config.engine_settings();
        assert_eq!(settings.rescue.poll_attempts, 5);
        assert!((settings.engagement.open_probability - 0.9).abs() < f64::EPSILON);
        assert_eq!(settings.lease_ttl, chrono::Duration::minutes(30));
    }

    #[test]
    fn load_fails_for_missing_explicit_path() {
        let result = WarmupdConfig::load(Some(Path::new("/nonexistent/warmupd.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn retry_policy_never_drops_below_one_attempt() {
        let transport = TransportConfig {
            max_attempts: 0,
            ..TransportConfig::default()
        };
        assert_eq!(transport.retry_policy().max_attempts, 1);
    }
}
