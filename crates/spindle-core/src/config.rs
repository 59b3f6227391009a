//! Config - エンジン設定
//!
//! Every knob has a default, so an empty JSON object or an empty environment
//! yields a working engine. Environment variables override defaults field by
//! field.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::SpindleError;
use crate::policy::{ExpandingBackOff, TimeBasedDeadQueue};
use crate::ports::EventDelivery;

pub const ENV_MAX_CONCURRENT_TASKS: &str = "SPINDLE_MAX_CONCURRENT_TASKS";
pub const ENV_POLL_INTERVAL_MS: &str = "SPINDLE_POLL_INTERVAL_MS";
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "SPINDLE_HEARTBEAT_INTERVAL_MS";
pub const ENV_STALL_RECOVERY_INTERVAL_MS: &str = "SPINDLE_STALL_RECOVERY_INTERVAL_MS";
pub const ENV_STALL_CUTOFF_MS: &str = "SPINDLE_STALL_CUTOFF_MS";
pub const ENV_LEASE_DURATION_MS: &str = "SPINDLE_LEASE_DURATION_MS";
pub const ENV_BACKOFF_BASE_MS: &str = "SPINDLE_BACKOFF_BASE_MS";
pub const ENV_BACKOFF_MULTIPLIER: &str = "SPINDLE_BACKOFF_MULTIPLIER";
pub const ENV_BACKOFF_CAP_MS: &str = "SPINDLE_BACKOFF_CAP_MS";
pub const ENV_DEAD_QUEUE_RETENTION_MS: &str = "SPINDLE_DEAD_QUEUE_RETENTION_MS";
pub const ENV_EVENT_DELIVERY: &str = "SPINDLE_EVENT_DELIVERY";
pub const ENV_WRITE_RETRY_ATTEMPTS: &str = "SPINDLE_WRITE_RETRY_ATTEMPTS";
pub const ENV_WRITE_RETRY_DELAY_MS: &str = "SPINDLE_WRITE_RETRY_DELAY_MS";

/// Upper bound for every `*_ms` setting (100 years).
pub const MAX_DURATION_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackOffConfig {
    pub base_ms: u64,
    pub multiplier: f64,
    pub cap_ms: u64,
}

impl Default for BackOffConfig {
    fn default() -> Self {
        Self {
            base_ms: 2 * 60 * 1000,
            multiplier: 2.0,
            cap_ms: 24 * 60 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadQueueConfig {
    pub retention_window_ms: u64,
}

impl Default for DeadQueueConfig {
    fn default() -> Self {
        Self {
            retention_window_ms: 15 * 24 * 60 * 60 * 1000,
        }
    }
}

/// Bounded retry of post-claim persistence writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteRetryConfig {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for WriteRetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Permit budget of one runner process.
    pub max_concurrent_tasks: usize,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub stall_recovery_interval_ms: u64,
    /// A RUNNING task whose heartbeat is older than this is reclaimed.
    pub stall_cutoff_ms: u64,
    pub lease_duration_ms: u64,
    pub backoff: BackOffConfig,
    pub dead_queue: DeadQueueConfig,
    pub event_delivery: EventDelivery,
    pub write_retry: WriteRetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            poll_interval_ms: 1000,
            heartbeat_interval_ms: 3 * 60 * 1000,
            stall_recovery_interval_ms: 15 * 60 * 1000,
            stall_cutoff_ms: 15 * 60 * 1000,
            lease_duration_ms: 15 * 60 * 1000,
            backoff: BackOffConfig::default(),
            dead_queue: DeadQueueConfig::default(),
            event_delivery: EventDelivery::default(),
            write_retry: WriteRetryConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, SpindleError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_env_map(&vars)
    }

    /// Defaults overlaid with whichever `SPINDLE_*` variables are present.
    pub fn from_env_map(vars: &HashMap<String, String>) -> Result<Self, SpindleError> {
        let mut config = Self::default();

        if let Some(v) = parse_var(vars, ENV_MAX_CONCURRENT_TASKS)? {
            config.max_concurrent_tasks = v;
        }
        if let Some(v) = parse_var(vars, ENV_POLL_INTERVAL_MS)? {
            config.poll_interval_ms = v;
        }
        if let Some(v) = parse_var(vars, ENV_HEARTBEAT_INTERVAL_MS)? {
            config.heartbeat_interval_ms = v;
        }
        if let Some(v) = parse_var(vars, ENV_STALL_RECOVERY_INTERVAL_MS)? {
            config.stall_recovery_interval_ms = v;
        }
        if let Some(v) = parse_var(vars, ENV_STALL_CUTOFF_MS)? {
            config.stall_cutoff_ms = v;
        }
        if let Some(v) = parse_var(vars, ENV_LEASE_DURATION_MS)? {
            config.lease_duration_ms = v;
        }
        if let Some(v) = parse_var(vars, ENV_BACKOFF_BASE_MS)? {
            config.backoff.base_ms = v;
        }
        if let Some(v) = parse_var(vars, ENV_BACKOFF_MULTIPLIER)? {
            config.backoff.multiplier = v;
        }
        if let Some(v) = parse_var(vars, ENV_BACKOFF_CAP_MS)? {
            config.backoff.cap_ms = v;
        }
        if let Some(v) = parse_var(vars, ENV_DEAD_QUEUE_RETENTION_MS)? {
            config.dead_queue.retention_window_ms = v;
        }
        if let Some(v) = parse_var(vars, ENV_EVENT_DELIVERY)? {
            config.event_delivery = v;
        }
        if let Some(v) = parse_var(vars, ENV_WRITE_RETRY_ATTEMPTS)? {
            config.write_retry.attempts = v;
        }
        if let Some(v) = parse_var(vars, ENV_WRITE_RETRY_DELAY_MS)? {
            config.write_retry.delay_ms = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self, SpindleError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SpindleError::Config(format!("parse engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SpindleError> {
        if self.max_concurrent_tasks == 0 {
            return Err(SpindleError::Config(
                "max_concurrent_tasks must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("stall_recovery_interval_ms", self.stall_recovery_interval_ms),
            ("stall_cutoff_ms", self.stall_cutoff_ms),
            ("lease_duration_ms", self.lease_duration_ms),
            ("backoff.base_ms", self.backoff.base_ms),
            ("backoff.cap_ms", self.backoff.cap_ms),
            (
                "dead_queue.retention_window_ms",
                self.dead_queue.retention_window_ms,
            ),
        ] {
            if value == 0 {
                return Err(SpindleError::Config(format!("{name} must be positive")));
            }
            if value > MAX_DURATION_MS {
                return Err(SpindleError::Config(format!(
                    "{name} ({value}) exceeds {MAX_DURATION_MS}"
                )));
            }
        }
        if self.write_retry.delay_ms > MAX_DURATION_MS {
            return Err(SpindleError::Config(format!(
                "write_retry.delay_ms ({}) exceeds {MAX_DURATION_MS}",
                self.write_retry.delay_ms
            )));
        }
        // heartbeat が lease / cutoff より遅いと健全なタスクまで回収される
        if self.heartbeat_interval_ms >= self.lease_duration_ms {
            return Err(SpindleError::Config(format!(
                "heartbeat_interval_ms ({}) must be shorter than lease_duration_ms ({})",
                self.heartbeat_interval_ms, self.lease_duration_ms
            )));
        }
        if self.heartbeat_interval_ms >= self.stall_cutoff_ms {
            return Err(SpindleError::Config(format!(
                "heartbeat_interval_ms ({}) must be shorter than stall_cutoff_ms ({})",
                self.heartbeat_interval_ms, self.stall_cutoff_ms
            )));
        }
        self.back_off()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn stall_recovery_interval(&self) -> Duration {
        Duration::from_millis(self.stall_recovery_interval_ms)
    }

    pub fn stall_cutoff(&self) -> Duration {
        Duration::from_millis(self.stall_cutoff_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn write_retry_delay(&self) -> Duration {
        Duration::from_millis(self.write_retry.delay_ms)
    }

    pub fn back_off(&self) -> Result<ExpandingBackOff, SpindleError> {
        ExpandingBackOff::new(
            Duration::from_millis(self.backoff.base_ms),
            self.backoff.multiplier,
            Duration::from_millis(self.backoff.cap_ms),
        )
    }

    pub fn dead_queue(&self) -> Result<TimeBasedDeadQueue, SpindleError> {
        TimeBasedDeadQueue::new(Duration::from_millis(
            self.dead_queue.retention_window_ms,
        ))
    }
}

fn parse_var<T>(vars: &HashMap<String, String>, key: &str) -> Result<Option<T>, SpindleError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| SpindleError::Config(format!("{key}={raw}: {e}"))),
    }
}
