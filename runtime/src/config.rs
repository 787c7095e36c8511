//! Runtime configuration.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Tunables of the sync loops.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Tenant (workspace) the engine starts in
    pub tenant: String,
    /// Minimum age of a pending op before it is pushed
    pub debounce: Duration,
    /// Maximum rows per push batch
    pub max_batch: usize,
    /// Retry delays; the last entry caps the schedule
    pub backoff: Vec<Duration>,
    /// Random spread applied to each retry delay (0.0 disables jitter)
    pub jitter_ratio: f64,
    /// Changes requested per pull page
    pub pull_limit: usize,
    /// Pages fetched per pull cycle before yielding
    pub max_pull_iterations: usize,
    /// Periodic pull interval when no realtime notification arrives
    pub pull_interval: Duration,
    /// Window in which realtime notifications are coalesced
    pub realtime_window: Duration,
    pub gc_interval: Duration,
    /// Age after which a tombstone becomes a GC candidate
    pub tombstone_retention: Duration,
    /// Consecutive GC failures that open the circuit breaker
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
    /// Remaining-quota ratio below which pushes slow down
    pub rate_limit_threshold: f64,
    /// Wait multiplier while the host is backgrounded
    pub background_throttle: u32,
    /// Bound on waiting for in-flight work during a scope switch
    pub cancellation_deadline: Duration,
    pub event_capacity: usize,
    pub ledger_retention: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tenant: "default".to_string(),
            debounce: Duration::from_millis(250),
            max_batch: 50,
            backoff: vec![
                Duration::from_millis(250),
                Duration::from_millis(1000),
                Duration::from_millis(3000),
                Duration::from_millis(5000),
            ],
            jitter_ratio: 0.2,
            pull_limit: 100,
            max_pull_iterations: 10,
            pull_interval: Duration::from_secs(30),
            realtime_window: Duration::from_millis(20),
            gc_interval: Duration::from_secs(60 * 60),
            tombstone_retention: Duration::from_secs(30 * 24 * 60 * 60),
            breaker_threshold: 3,
            breaker_cooldown: Duration::from_secs(15 * 60),
            rate_limit_threshold: 0.2,
            background_throttle: 4,
            cancellation_deadline: Duration::from_secs(2),
            event_capacity: 256,
            ledger_retention: 200,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

impl SyncConfig {
    /// Load configuration from `DRIFTSYNC_*` environment variables, falling
    /// back to the defaults for unset ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |var, default: Duration| {
            parse_var(&lookup, var, default.as_millis() as u64).map(Duration::from_millis)
        };
        let secs = |var, default: Duration| {
            parse_var(&lookup, var, default.as_secs()).map(Duration::from_secs)
        };

        let tenant = lookup("DRIFTSYNC_TENANT").unwrap_or(defaults.tenant);
        if tenant.trim().is_empty() {
            return Err(ConfigError::Empty("DRIFTSYNC_TENANT"));
        }

        let backoff = match lookup("DRIFTSYNC_BACKOFF_MS") {
            Some(raw) => parse_backoff(&raw)?,
            None => defaults.backoff,
        };

        let jitter_ratio = parse_var(&lookup, "DRIFTSYNC_JITTER", defaults.jitter_ratio)?;
        if !(0.0..=1.0).contains(&jitter_ratio) {
            return Err(ConfigError::Invalid {
                var: "DRIFTSYNC_JITTER",
                value: jitter_ratio.to_string(),
            });
        }

        Ok(Self {
            tenant,
            debounce: millis("DRIFTSYNC_DEBOUNCE_MS", defaults.debounce)?,
            max_batch: parse_var(&lookup, "DRIFTSYNC_MAX_BATCH", defaults.max_batch)?,
            backoff,
            jitter_ratio,
            pull_limit: parse_var(&lookup, "DRIFTSYNC_PULL_LIMIT", defaults.pull_limit)?,
            max_pull_iterations: parse_var(
                &lookup,
                "DRIFTSYNC_MAX_PULL_ITERATIONS",
                defaults.max_pull_iterations,
            )?,
            pull_interval: millis("DRIFTSYNC_PULL_INTERVAL_MS", defaults.pull_interval)?,
            realtime_window: millis("DRIFTSYNC_REALTIME_WINDOW_MS", defaults.realtime_window)?,
            gc_interval: secs("DRIFTSYNC_GC_INTERVAL_SECS", defaults.gc_interval)?,
            tombstone_retention: secs("DRIFTSYNC_RETENTION_SECS", defaults.tombstone_retention)?,
            breaker_threshold: parse_var(
                &lookup,
                "DRIFTSYNC_BREAKER_THRESHOLD",
                defaults.breaker_threshold,
            )?,
            breaker_cooldown: secs("DRIFTSYNC_BREAKER_COOLDOWN_SECS", defaults.breaker_cooldown)?,
            rate_limit_threshold: parse_var(
                &lookup,
                "DRIFTSYNC_RATE_LIMIT_THRESHOLD",
                defaults.rate_limit_threshold,
            )?,
            background_throttle: parse_var(
                &lookup,
                "DRIFTSYNC_BACKGROUND_THROTTLE",
                defaults.background_throttle,
            )?,
            cancellation_deadline: millis(
                "DRIFTSYNC_CANCEL_DEADLINE_MS",
                defaults.cancellation_deadline,
            )?,
            event_capacity: parse_var(
                &lookup,
                "DRIFTSYNC_EVENT_CAPACITY",
                defaults.event_capacity,
            )?,
            ledger_retention: parse_var(
                &lookup,
                "DRIFTSYNC_LEDGER_RETENTION",
                defaults.ledger_retention,
            )?,
        })
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = tenant.into();
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn with_pull_limit(mut self, limit: usize) -> Self {
        self.pull_limit = limit;
        self
    }

    pub fn with_max_pull_iterations(mut self, iterations: usize) -> Self {
        self.max_pull_iterations = iterations;
        self
    }

    pub fn with_pull_interval(mut self, interval: Duration) -> Self {
        self.pull_interval = interval;
        self
    }

    pub fn with_realtime_window(mut self, window: Duration) -> Self {
        self.realtime_window = window;
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = retention;
        self
    }

    pub fn with_breaker(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.breaker_threshold = threshold;
        self.breaker_cooldown = cooldown;
        self
    }

    pub fn with_rate_limit_threshold(mut self, threshold: f64) -> Self {
        self.rate_limit_threshold = threshold;
        self
    }

    pub fn with_background_throttle(mut self, factor: u32) -> Self {
        self.background_throttle = factor;
        self
    }

    pub fn with_cancellation_deadline(mut self, deadline: Duration) -> Self {
        self.cancellation_deadline = deadline;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_ledger_retention(mut self, retention: usize) -> Self {
        self.ledger_retention = retention;
        self
    }

    /// Retry delay after `attempts` earlier failures, before jitter.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let idx = (attempts as usize).min(self.backoff.len().saturating_sub(1));
        self.backoff.get(idx).copied().unwrap_or(self.debounce)
    }

    pub fn debounce_ms(&self) -> u64 {
        self.debounce.as_millis() as u64
    }

    pub fn retention_ms(&self) -> u64 {
        self.tombstone_retention.as_millis() as u64
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
        None => Ok(default),
    }
}

fn parse_backoff(raw: &str) -> Result<Vec<Duration>, ConfigError> {
    let steps = raw
        .split(',')
        .map(|step| {
            step.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| ConfigError::Invalid {
                    var: "DRIFTSYNC_BACKOFF_MS",
                    value: raw.to_string(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if steps.is_empty() {
        return Err(ConfigError::Empty("DRIFTSYNC_BACKOFF_MS"));
    }
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.debounce, Duration::from_millis(250));
        assert_eq!(config.max_batch, 50);
        assert_eq!(config.backoff.len(), 4);
        assert_eq!(config.tombstone_retention.as_secs(), 2_592_000);
        assert_eq!(config.realtime_window, Duration::from_millis(20));
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn environment_overrides() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("DRIFTSYNC_TENANT", "acme"),
            ("DRIFTSYNC_MAX_BATCH", "10"),
            ("DRIFTSYNC_BACKOFF_MS", "100, 200"),
            ("DRIFTSYNC_RETENTION_SECS", "60"),
        ]))
        .unwrap();
        assert_eq!(config.tenant, "acme");
        assert_eq!(config.max_batch, 10);
        assert_eq!(
            config.backoff,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert_eq!(config.tombstone_retention, Duration::from_secs(60));
    }

    #[test]
    fn unparsable_value_is_reported() {
        let err = SyncConfig::from_lookup(lookup(&[("DRIFTSYNC_MAX_BATCH", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: "DRIFTSYNC_MAX_BATCH",
                value: "lots".into()
            }
        );
        assert!(SyncConfig::from_lookup(lookup(&[("DRIFTSYNC_BACKOFF_MS", "1,x")])).is_err());
        assert!(SyncConfig::from_lookup(lookup(&[("DRIFTSYNC_JITTER", "3")])).is_err());
        assert!(SyncConfig::from_lookup(lookup(&[("DRIFTSYNC_TENANT", " ")])).is_err());
    }

    #[test]
    fn backoff_is_capped_at_last_step() {
        let config = SyncConfig::default();
        let delays: Vec<u128> = (0..6).map(|a| config.backoff_delay(a).as_millis()).collect();
        assert_eq!(delays, vec![250, 1000, 3000, 5000, 5000, 5000]);
    }
}
