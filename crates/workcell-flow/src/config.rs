//! Orchestrator configuration.
//!
//! [`FlowConfig`] holds every tunable: lock leases, poll intervals, the
//! reservation retry policy and asset backup rotation. Values come from
//! `WORKCELL_*` environment variables on top of the defaults.
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `WORKCELL_LEASE_SECS` | `lease_duration` | 30s |
//! | `WORKCELL_LEASE_RENEW_SECS` | `lease_renew_interval` | 10s |
//! | `WORKCELL_CONTROL_POLL_MS` | `control_poll_interval` | 1000ms |
//! | `WORKCELL_SCHEDULER_TICK_MS` | `scheduler_tick_interval` | 1000ms |
//! | `WORKCELL_RESERVATION_MAX_ATTEMPTS` | `reservation_retry.max_attempts` | unbounded |
//! | `WORKCELL_RESERVATION_BACKOFF_MS` | `reservation_retry.backoff` | 2000ms |
//! | `WORKCELL_DEFAULT_PRIORITY` | `default_priority` | 1 |
//! | `WORKCELL_BACKUP_INTERVAL_SECS` | `backup.interval` | 300s |
//! | `WORKCELL_BACKUP_RETAIN` | `backup.retain` | 5 |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How admission treats an asset that is held by another run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationRetryPolicy {
    /// Attempts that may find an asset held before the run fails with
    /// `AssetUnavailable`. `None` retries until the run is cancelled.
    pub max_attempts: Option<u32>,
    /// Delay before a requeued entry is retried.
    #[serde(with = "duration_millis")]
    pub backoff: Duration,
}

impl Default for ReservationRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff: Duration::from_secs(2),
        }
    }
}

impl ReservationRetryPolicy {
    /// Returns true once `attempts` held outcomes use up the policy.
    #[must_use]
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Periodic asset backup settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    /// Time between snapshots.
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    /// Snapshots kept; older ones are pruned.
    pub retain: usize,
    /// Storage prefix snapshots are written under.
    pub prefix: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            retain: 5,
            prefix: "backups/assets/".to_string(),
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowConfig {
    /// Lease attached to every asset reservation.
    #[serde(with = "duration_millis")]
    pub lease_duration: Duration,
    /// How often an executing run renews its leases.
    #[serde(with = "duration_millis")]
    pub lease_renew_interval: Duration,
    /// Poll interval of the pause loop.
    #[serde(with = "duration_millis")]
    pub control_poll_interval: Duration,
    /// Interval of the background scheduler tick.
    #[serde(with = "duration_millis")]
    pub scheduler_tick_interval: Duration,
    /// Reservation retry policy.
    pub reservation_retry: ReservationRetryPolicy,
    /// Priority used when a submission does not name one.
    pub default_priority: u8,
    /// Asset backup settings.
    pub backup: BackupConfig,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            lease_renew_interval: Duration::from_secs(10),
            control_poll_interval: Duration::from_secs(1),
            scheduler_tick_interval: Duration::from_secs(1),
            reservation_retry: ReservationRetryPolicy::default(),
            default_priority: 1,
            backup: BackupConfig::default(),
        }
    }
}

impl FlowConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] naming the first invalid variable.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, which maps a variable name to
    /// its value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] naming the first invalid variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64>(&lookup, "WORKCELL_LEASE_SECS")? {
            config.lease_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "WORKCELL_LEASE_RENEW_SECS")? {
            config.lease_renew_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "WORKCELL_CONTROL_POLL_MS")? {
            config.control_poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "WORKCELL_SCHEDULER_TICK_MS")? {
            config.scheduler_tick_interval = Duration::from_millis(ms);
        }
        if let Some(max) = parse_var::<u32>(&lookup, "WORKCELL_RESERVATION_MAX_ATTEMPTS")? {
            config.reservation_retry.max_attempts = Some(max);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "WORKCELL_RESERVATION_BACKOFF_MS")? {
            config.reservation_retry.backoff = Duration::from_millis(ms);
        }
        if let Some(priority) = parse_var::<u8>(&lookup, "WORKCELL_DEFAULT_PRIORITY")? {
            config.default_priority = priority;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "WORKCELL_BACKUP_INTERVAL_SECS")? {
            config.backup.interval = Duration::from_secs(secs);
        }
        if let Some(retain) = parse_var::<usize>(&lookup, "WORKCELL_BACKUP_RETAIN")? {
            config.backup.retain = retain;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field rules.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.lease_duration.is_zero() {
            return Err(Error::configuration("lease duration must be positive"));
        }
        if self.lease_renew_interval.is_zero() || self.lease_renew_interval >= self.lease_duration
        {
            return Err(Error::configuration(format!(
                "lease renew interval {:?} must be positive and below the lease {:?}",
                self.lease_renew_interval, self.lease_duration
            )));
        }
        if self.control_poll_interval.is_zero() {
            return Err(Error::configuration("control poll interval must be positive"));
        }
        if self.scheduler_tick_interval.is_zero() {
            return Err(Error::configuration("scheduler tick interval must be positive"));
        }
        if self.reservation_retry.max_attempts == Some(0) {
            return Err(Error::configuration(
                "reservation max attempts must be at least 1",
            ));
        }
        if self.default_priority == 0 {
            return Err(Error::configuration("default priority must be at least 1"));
        }
        if self.backup.retain == 0 {
            return Err(Error::configuration("backup retain must be at least 1"));
        }
        if self.backup.interval.is_zero() {
            return Err(Error::configuration("backup interval must be positive"));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::configuration(format!("invalid {key}: '{raw}'"))),
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
