//! Engine configuration with sane defaults, overridable from `DEDUP_*` env vars.

use std::time::Duration as StdDuration;

use chrono::Duration;

use crate::error::{EngineError, Result};
use crate::normalize::Canonicalization;

/// Tunable windows, cache bounds and timeouts.
#[derive(Debug, Clone)]
pub struct Config {
  /// Max gap between two events still counted as the same burst.
  pub quiet_window: Duration,
  /// Suppression applied (and slid) on every muted occurrence.
  pub mute_window: Duration,
  /// How far an event may be dated before the stored last_seen_at before it
  /// is treated as a clock anomaly.
  pub clock_skew_tolerance: Duration,
  pub cache: CacheConfig,
  /// Message canonicalization applied before fingerprinting.
  pub canonicalization: Canonicalization,
  /// Upper bound on a single ledger call.
  pub store_timeout: StdDuration,
  /// Upper bound on a single escalation delivery.
  pub notifier_timeout: StdDuration,
  pub sweep_interval: StdDuration,
  /// Max records escalated per sweep pass.
  pub sweep_batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
  pub enabled: bool,
  /// Entry lifetime. Defaults to the mute window so staleness is bounded by one cycle.
  pub ttl: StdDuration,
  pub capacity: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      quiet_window: Duration::minutes(5),
      mute_window: Duration::minutes(30),
      clock_skew_tolerance: Duration::hours(1),
      cache: CacheConfig {
        enabled: true,
        ttl: StdDuration::from_secs(30 * 60),
        capacity: 10_000,
      },
      canonicalization: Canonicalization::identity(),
      store_timeout: StdDuration::from_millis(2_000),
      notifier_timeout: StdDuration::from_millis(5_000),
      sweep_interval: StdDuration::from_secs(60),
      sweep_batch_size: 500,
    }
  }
}

impl Config {
  /// Build a config from the process environment.
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Build a config from an arbitrary key lookup; unset keys keep their defaults.
  pub fn from_lookup<F>(lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let mut config = Self::default();

    if let Some(secs) = parse_u64(&lookup, "DEDUP_QUIET_WINDOW_SECS")? {
      config.quiet_window = seconds("DEDUP_QUIET_WINDOW_SECS", secs)?;
    }
    if let Some(secs) = parse_u64(&lookup, "DEDUP_MUTE_WINDOW_SECS")? {
      config.mute_window = seconds("DEDUP_MUTE_WINDOW_SECS", secs)?;
      config.cache.ttl = StdDuration::from_secs(secs);
    }
    if let Some(secs) = parse_u64(&lookup, "DEDUP_CLOCK_SKEW_TOLERANCE_SECS")? {
      config.clock_skew_tolerance = seconds("DEDUP_CLOCK_SKEW_TOLERANCE_SECS", secs)?;
    }
    if let Some(enabled) = parse_bool(&lookup, "DEDUP_CACHE_ENABLED")? {
      config.cache.enabled = enabled;
    }
    if let Some(secs) = parse_u64(&lookup, "DEDUP_CACHE_TTL_SECS")? {
      config.cache.ttl = StdDuration::from_secs(secs);
    }
    if let Some(cap) = parse_u64(&lookup, "DEDUP_CACHE_CAPACITY")? {
      config.cache.capacity = cap as usize;
    }
    if let Some(policy) = lookup("DEDUP_CANONICALIZATION") {
      config.canonicalization = Canonicalization::parse(&policy)
        .map_err(|reason| EngineError::config("DEDUP_CANONICALIZATION", reason))?;
    }
    if let Some(ms) = parse_u64(&lookup, "DEDUP_STORE_TIMEOUT_MS")? {
      config.store_timeout = StdDuration::from_millis(ms);
    }
    if let Some(ms) = parse_u64(&lookup, "DEDUP_NOTIFIER_TIMEOUT_MS")? {
      config.notifier_timeout = StdDuration::from_millis(ms);
    }
    if let Some(secs) = parse_u64(&lookup, "DEDUP_SWEEP_INTERVAL_SECS")? {
      config.sweep_interval = StdDuration::from_secs(secs);
    }
    if let Some(n) = parse_u64(&lookup, "DEDUP_SWEEP_BATCH_SIZE")? {
      config.sweep_batch_size = n as usize;
    }

    config.validate()?;
    Ok(config)
  }

  /// Reject settings the engine cannot run with.
  pub fn validate(&self) -> Result<()> {
    let max = max_window();
    for (key, window) in [
      ("quiet_window", self.quiet_window),
      ("mute_window", self.mute_window),
      ("clock_skew_tolerance", self.clock_skew_tolerance),
    ] {
      if window > max {
        return Err(EngineError::config(key, format!("must be at most {} days", MAX_WINDOW_DAYS)));
      }
    }
    if self.quiet_window <= Duration::zero() {
      return Err(EngineError::config("quiet_window", "must be positive"));
    }
    if self.mute_window <= Duration::zero() {
      return Err(EngineError::config("mute_window", "must be positive"));
    }
    if self.clock_skew_tolerance < Duration::zero() {
      return Err(EngineError::config("clock_skew_tolerance", "must not be negative"));
    }
    if self.cache.enabled && self.cache.capacity == 0 {
      return Err(EngineError::config("cache.capacity", "must be positive when the cache is enabled"));
    }
    if self.store_timeout.is_zero() {
      return Err(EngineError::config("store_timeout", "must be positive"));
    }
    if self.notifier_timeout.is_zero() {
      return Err(EngineError::config("notifier_timeout", "must be positive"));
    }
    if self.sweep_interval.is_zero() {
      return Err(EngineError::config("sweep_interval", "must be positive"));
    }
    if self.sweep_batch_size == 0 {
      return Err(EngineError::config("sweep_batch_size", "must be positive"));
    }
    Ok(())
  }
}

/// Upper bound on every event-time window.
pub const MAX_WINDOW_DAYS: i64 = 365;

fn max_window() -> Duration {
  Duration::days(MAX_WINDOW_DAYS)
}

fn parse_u64<F>(lookup: &F, key: &str) -> Result<Option<u64>>
where
  F: Fn(&str) -> Option<String>,
{
  match lookup(key) {
    Some(raw) => raw
      .trim()
      .parse::<u64>()
      .map(Some)
      .map_err(|e| EngineError::config(key, format!("expected an unsigned integer: {}", e))),
    None => Ok(None),
  }
}

fn parse_bool<F>(lookup: &F, key: &str) -> Result<Option<bool>>
where
  F: Fn(&str) -> Option<String>,
{
  match lookup(key) {
    Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
      "1" | "true" | "yes" | "on" => Ok(Some(true)),
      "0" | "false" | "no" | "off" => Ok(Some(false)),
      other => Err(EngineError::config(key, format!("expected a boolean, got {:?}", other))),
    },
    None => Ok(None),
  }
}

fn seconds(key: &str, secs: u64) -> Result<Duration> {
  i64::try_from(secs)
    .ok()
    .and_then(Duration::try_seconds)
    .ok_or_else(|| EngineError::config(key, "out of range"))
}
