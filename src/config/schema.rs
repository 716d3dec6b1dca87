//! Configuration schema for credsync
//!
//! Configuration is stored at `~/.config/credsync/config.toml`. Durations are
//! written in human-readable form, e.g. `"5s"` or `"2m"`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Sync scheduler settings
    pub scheduler: SchedulerConfig,

    /// Failure backoff settings
    pub backoff: BackoffConfig,

    /// Event watcher settings
    pub watcher: WatcherConfig,

    /// Static credential rotation settings
    pub rotation: RotationConfig,
}

impl Config {
    /// Check values the schema alone can't express.
    ///
    /// Returns the first problem found, naming the offending key.
    pub fn validate(&self) -> Result<(), String> {
        if !matches!(self.general.log_format.as_str(), "text" | "json") {
            return Err(format!(
                "general.log_format must be \"text\" or \"json\", got {:?}",
                self.general.log_format
            ));
        }
        if self.scheduler.default_renewal_percent > 90 {
            return Err(format!(
                "scheduler.default_renewal_percent must be at most 90, got {}",
                self.scheduler.default_renewal_percent
            ));
        }

        let backoff = &self.backoff;
        if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
            return Err(format!(
                "backoff.multiplier must be a finite number of at least 1, got {}",
                backoff.multiplier
            ));
        }
        check_bounds(
            "backoff.initial_interval",
            backoff.initial_interval,
            "backoff.max_interval",
            backoff.max_interval,
        )?;

        if self.watcher.error_threshold == 0 {
            return Err("watcher.error_threshold must be at least 1".to_string());
        }
        check_bounds(
            "watcher.min_backoff",
            self.watcher.min_backoff,
            "watcher.max_backoff",
            self.watcher.max_backoff,
        )?;
        check_bounds(
            "rotation.initial_interval",
            self.rotation.initial_interval,
            "rotation.max_interval",
            self.rotation.max_interval,
        )
    }
}

/// `low` must be non-zero and no larger than `high`
fn check_bounds(
    low_key: &str,
    low: Duration,
    high_key: &str,
    high: Duration,
) -> Result<(), String> {
    if low.is_zero() {
        return Err(format!("{low_key} must be greater than zero"));
    }
    if low > high {
        return Err(format!(
            "{low_key} ({}) exceeds {high_key} ({})",
            humantime::format_duration(low),
            humantime::format_duration(high)
        ));
    }
    Ok(())
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Sync scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Base requeue delay for errors that won't resolve on retry
    #[serde(with = "duration_serde")]
    pub error_horizon: Duration,

    /// Substituted when the credential source reports a zero lease duration
    #[serde(with = "duration_serde")]
    pub min_lease_horizon: Duration,

    /// Renewal percentage used when a task doesn't declare one
    pub default_renewal_percent: u8,

    /// Force a full sync of every task after a process restart
    pub sync_on_failover: bool,

    /// Hex-encoded data MAC key, created on first use. Without one the key
    /// changes on every restart and unchanged data gets rewritten.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_key_file: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            error_horizon: Duration::from_secs(5),
            min_lease_horizon: Duration::from_secs(5),
            default_renewal_percent: 67,
            sync_on_failover: false,
            mac_key_file: None,
        }
    }
}

/// Per-task exponential backoff applied after failed fetches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First retry delay
    #[serde(with = "duration_serde")]
    pub initial_interval: Duration,

    /// Growth factor between retries
    pub multiplier: f64,

    /// Upper bound for a single retry delay
    #[serde(with = "duration_serde")]
    pub max_interval: Duration,

    /// Give up after this much time (unset = retry forever)
    #[serde(with = "opt_duration_serde", skip_serializing_if = "Option::is_none")]
    pub max_elapsed: Option<Duration>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(5),
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_elapsed: None,
        }
    }
}

/// Event watcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Consecutive stream errors tolerated before the watcher gives up
    pub error_threshold: u32,

    /// How long to wait for a replaced watcher to stop
    #[serde(with = "duration_serde")]
    pub replace_timeout: Duration,

    /// First reconnect delay after a stream error
    #[serde(with = "duration_serde")]
    pub min_backoff: Duration,

    /// Upper bound for reconnect delays
    #[serde(with = "duration_serde")]
    pub max_backoff: Duration,

    /// Upper bound for the jittered delay applied to forced resyncs
    #[serde(with = "duration_serde")]
    pub max_resync_delay: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            replace_timeout: Duration::from_secs(120),
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_resync_delay: Duration::from_secs(2),
        }
    }
}

/// Static credential rotation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// First re-read delay while a rotation is in progress
    #[serde(with = "duration_serde")]
    pub initial_interval: Duration,

    /// Upper bound for a single re-read delay
    #[serde(with = "duration_serde")]
    pub max_interval: Duration,

    /// Total time budget for awaiting a rotation
    #[serde(with = "duration_serde")]
    pub max_elapsed: Duration,

    /// Remaining TTL at or below which a read is too close to the rotation to trust
    #[serde(with = "duration_serde")]
    pub ttl_slack: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(2),
            max_elapsed: Duration::from_secs(10),
            ttl_slack: Duration::from_secs(2),
        }
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

mod opt_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
