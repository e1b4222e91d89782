//! Registry configuration loaded from environment variables.

use std::time::Duration;

/// Shortest accepted sweep period; tokio intervals reject zero.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Tuning knobs for the tenant registry.
///
/// Reads from environment variables:
/// - `TENANT_MAX_CONNECTIONS` — cached handles before eviction (default: `50`)
/// - `TENANT_IDLE_TIMEOUT_SECS` — idle time before a handle is reclaimed (default: `1800`)
/// - `TENANT_SWEEP_INTERVAL_SECS` — how often the idle sweep runs (default: `300`)
/// - `TENANT_CONNECT_TIMEOUT_SECS` — bound on a single open (default: `30`)
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_connections: usize,
    /// Percentage of `max_connections` evicted when the cache is full.
    pub eviction_percent: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub connect_timeout: Duration,
}

impl RegistryConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_connections: env_parse("TENANT_MAX_CONNECTIONS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_connections),
            eviction_percent: defaults.eviction_percent,
            idle_timeout: env_parse("TENANT_IDLE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            sweep_interval: env_parse("TENANT_SWEEP_INTERVAL_SECS")
                .filter(|n: &u64| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            connect_timeout: env_parse("TENANT_CONNECT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval.max(MIN_SWEEP_INTERVAL);
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Number of entries removed by one capacity eviction.
    pub fn eviction_batch(&self) -> usize {
        (self.max_connections * self.eviction_percent)
            .div_ceil(100)
            .max(1)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            eviction_percent: 20,
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = RegistryConfig::default();
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_eviction_batch_is_a_fifth_of_capacity() {
        assert_eq!(RegistryConfig::default().eviction_batch(), 10);
        assert_eq!(
            RegistryConfig::default()
                .with_max_connections(7)
                .eviction_batch(),
            2
        );
    }

    #[test]
    fn test_eviction_batch_never_zero() {
        let config = RegistryConfig::default().with_max_connections(1);
        assert_eq!(config.eviction_batch(), 1);
    }

    #[test]
    fn test_zero_sweep_interval_is_clamped() {
        let config = RegistryConfig::default().with_sweep_interval(Duration::ZERO);
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let config = RegistryConfig::default().with_max_connections(0);
        assert_eq!(config.max_connections, 1);
    }
}
