//! Configuration for the aggregation layer.
//!
//! Each aggregator takes its own options struct; [`ClientConfig`] bundles
//! them with the facade-level settings. All intervals are milliseconds held
//! as `i64` so the negative sentinels ("never expire", "disabled") remain
//! representable.

use crate::core::error::{Result, TollgateError};
use serde::{Deserialize, Serialize};

/// Sentinel for `stats_log_frequency` that disables statistics logging.
pub const DO_NOT_LOG_STATS: i64 = -1;

/// Configures check-response caching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckAggregationConfig {
    /// Maximum cache entries; non-positive disables the cache.
    pub num_entries: i64,
    /// TTL after write in milliseconds; negative means never expire by time.
    pub expiration_millis: i64,
}

impl Default for CheckAggregationConfig {
    fn default() -> Self {
        Self {
            num_entries: 1000,
            expiration_millis: 4000,
        }
    }
}

impl CheckAggregationConfig {
    /// Whether caching is enabled at all.
    pub fn is_caching(&self) -> bool {
        self.num_entries > 0
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Configures quota-allocation caching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaAggregationConfig {
    /// Maximum cache entries; non-positive disables the cache.
    pub num_entries: i64,
    /// Idle TTL in milliseconds; negative means never expire by time.
    pub expiration_millis: i64,
    /// Interval at which cached allowances are refreshed upstream.
    pub refresh_millis: i64,
}

impl Default for QuotaAggregationConfig {
    fn default() -> Self {
        Self {
            num_entries: 1000,
            expiration_millis: 60_000,
            refresh_millis: 60_000,
        }
    }
}

impl QuotaAggregationConfig {
    /// Whether caching is enabled at all.
    pub fn is_caching(&self) -> bool {
        self.num_entries > 0
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.is_caching() && self.refresh_millis < 0 {
            return Err(TollgateError::config(
                "quota refresh_millis cannot be negative while caching is enabled",
            ));
        }
        Ok(())
    }
}

/// Configures report batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportAggregationConfig {
    /// Maximum pending slots; non-positive disables aggregation.
    pub num_entries: i64,
    /// Flush cadence in milliseconds; negative means aggregation is disabled.
    pub flush_interval_millis: i64,
    /// Maximum operations packed into one upstream report payload.
    pub max_operations_per_batch: i64,
}

impl Default for ReportAggregationConfig {
    fn default() -> Self {
        Self {
            num_entries: 200,
            flush_interval_millis: 1000,
            max_operations_per_batch: 1000,
        }
    }
}

impl ReportAggregationConfig {
    /// Whether aggregation is enabled at all.
    pub fn is_caching(&self) -> bool {
        self.num_entries > 0 && self.flush_interval_millis >= 0
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_operations_per_batch < 1 {
            return Err(TollgateError::config(
                "report max_operations_per_batch must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Facade-level configuration bundling all aggregator options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// The service whose requests are aggregated; must match every request.
    pub service_name: String,
    /// Emit the statistics summary every N report calls; [`DO_NOT_LOG_STATS`]
    /// disables emission.
    pub stats_log_frequency: i64,
    /// Self-stop after this many seconds without a non-empty report flush.
    pub max_idle_seconds: i64,
    /// Check cache options.
    pub check: CheckAggregationConfig,
    /// Quota cache options.
    pub quota: QuotaAggregationConfig,
    /// Report batching options.
    pub report: ReportAggregationConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            stats_log_frequency: DO_NOT_LOG_STATS,
            max_idle_seconds: 120,
            check: CheckAggregationConfig::default(),
            quota: QuotaAggregationConfig::default(),
            report: ReportAggregationConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Creates a config for the given service with default aggregation options.
    pub fn new<S: Into<String>>(service_name: S) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.service_name.is_empty() {
            return Err(TollgateError::config("service_name must not be empty"));
        }
        if self.max_idle_seconds <= 0 {
            return Err(TollgateError::config("max_idle_seconds must be positive"));
        }
        self.check.validate()?;
        self.quota.validate()?;
        self.report.validate()?;
        Ok(())
    }
}

/// Builder for programmatic [`ClientConfig`] construction.
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Creates a builder with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the configuration from a YAML document.
    pub fn from_yaml(mut self, yaml: &str) -> Result<Self> {
        self.config = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::config(format!("failed to parse YAML config: {}", e)))?;
        Ok(self)
    }

    /// Sets the service name.
    pub fn service_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.service_name = name.into();
        self
    }

    /// Sets the statistics logging cadence.
    pub fn stats_log_frequency(mut self, frequency: i64) -> Self {
        self.config.stats_log_frequency = frequency;
        self
    }

    /// Sets the idle-shutdown threshold.
    pub fn max_idle_seconds(mut self, seconds: i64) -> Self {
        self.config.max_idle_seconds = seconds;
        self
    }

    /// Sets the check cache options.
    pub fn check(mut self, options: CheckAggregationConfig) -> Self {
        self.config.check = options;
        self
    }

    /// Sets the quota cache options.
    pub fn quota(mut self, options: QuotaAggregationConfig) -> Self {
        self.config.quota = options;
        self
    }

    /// Sets the report batching options.
    pub fn report(mut self, options: ReportAggregationConfig) -> Self {
        self.config.report = options;
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> Result<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::new("library.example.com");
        assert!(config.validate().is_ok());
        assert_eq!(config.check.num_entries, 1000);
        assert_eq!(config.check.expiration_millis, 4000);
        assert_eq!(config.quota.refresh_millis, 60_000);
        assert_eq!(config.report.num_entries, 200);
        assert_eq!(config.report.max_operations_per_batch, 1000);
        assert_eq!(config.stats_log_frequency, DO_NOT_LOG_STATS);
        assert_eq!(config.max_idle_seconds, 120);
    }

    #[test]
    fn test_empty_service_name_rejected() {
        let config = ClientConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_batch_size_must_be_positive() {
        let mut config = ClientConfig::new("svc");
        config.report.max_operations_per_batch = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_expiration_allowed() {
        let mut config = ClientConfig::new("svc");
        config.check.expiration_millis = -1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
service_name: library.example.com
stats_log_frequency: 100
check:
  num_entries: 50
  expiration_millis: 2000
quota:
  refresh_millis: 30000
report:
  num_entries: 10
  flush_interval_millis: 500
"#;
        let config = ClientConfigBuilder::new()
            .from_yaml(yaml)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(config.service_name, "library.example.com");
        assert_eq!(config.stats_log_frequency, 100);
        assert_eq!(config.check.num_entries, 50);
        assert_eq!(config.check.expiration_millis, 2000);
        assert_eq!(config.quota.refresh_millis, 30_000);
        assert_eq!(config.quota.num_entries, 1000);
        assert_eq!(config.report.flush_interval_millis, 500);
    }

    #[test]
    fn test_builder_overrides() {
        let config = ClientConfigBuilder::new()
            .service_name("svc")
            .stats_log_frequency(10)
            .check(CheckAggregationConfig {
                num_entries: 0,
                expiration_millis: 4000,
            })
            .build()
            .unwrap();
        assert!(!config.check.is_caching());
        assert_eq!(config.stats_log_frequency, 10);
    }
}
