//! Oracle configuration
//!
//! Loaded from a TOML file with one table per concern:
//!
//! ```toml
//! [service]
//! poll_interval_secs = 300
//! publish_threshold = 50
//!
//! [aggregation]
//! min_confidence = 0.3
//!
//! [source_weights]
//! github = 0.5
//!
//! [publisher]
//! rpc_endpoint = "https://rpc.example"
//! contract_address = "0x..."
//!
//! [[feeds]]
//! source = "forta"
//! url = "https://alerts.example/forta"
//! ```
//!
//! Every table is optional; a missing `[publisher]` runs the oracle read-only.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use oracle_chain::PublisherConfig;
use oracle_core::{
    is_evm_address, AggregationThresholds, SourceWeights, DEFAULT_PUBLISH_THRESHOLD, MAX_EVENT_DECAY_HOURS,
};
use oracle_feeds::JsonFeedConfig;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Upper bound for every interval and timeout setting (ten years)
pub const MAX_INTERVAL_SECS: u64 = 10 * 365 * 24 * 3600;

/// Background loop timing and publish policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub poll_interval_secs: u64,
    pub publish_interval_secs: u64,
    pub prune_interval_secs: u64,
    /// Signals at or above this score are queued for publishing
    pub publish_threshold: u8,
    /// Deadline for one poll tick's feed fetches
    pub fetch_timeout_secs: u64,
    /// Replay stored events into the aggregator on start
    pub restore_on_start: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
            publish_interval_secs: 600,
            prune_interval_secs: 3600,
            publish_threshold: DEFAULT_PUBLISH_THRESHOLD,
            fetch_timeout_secs: 60,
            restore_on_start: false,
        }
    }
}

fn bounded_secs(secs: u64) -> Duration {
    Duration::from_secs(secs.min(MAX_INTERVAL_SECS))
}

/// Durations are clamped to [`MAX_INTERVAL_SECS`] so deadlines never overflow
impl ServiceConfig {
    pub fn poll_interval(&self) -> Duration {
        bounded_secs(self.poll_interval_secs)
    }

    pub fn publish_interval(&self) -> Duration {
        bounded_secs(self.publish_interval_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        bounded_secs(self.prune_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        bounded_secs(self.fetch_timeout_secs)
    }
}

/// Complete oracle configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub aggregation: AggregationThresholds,
    #[serde(default)]
    pub source_weights: SourceWeights,
    #[serde(default)]
    pub feeds: Vec<JsonFeedConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<PublisherConfig>,
}

impl OracleConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML; the private key is never written out
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Set the signing key, overriding any key from the file
    pub fn set_private_key(&mut self, key: &str) -> Result<(), ConfigError> {
        match self.publisher.as_mut() {
            Some(publisher) => {
                publisher.private_key = Some(key.to_string());
                Ok(())
            }
            None => Err(ConfigError::Invalid(
                "a private key was given but no [publisher] section is configured".to_string(),
            )),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let s = &self.service;

        for (name, value) in [
            ("poll_interval_secs", s.poll_interval_secs),
            ("publish_interval_secs", s.publish_interval_secs),
            ("prune_interval_secs", s.prune_interval_secs),
            ("fetch_timeout_secs", s.fetch_timeout_secs),
        ] {
            if value == 0 {
                return invalid(format!("service.{} must be positive", name));
            }
            if value > MAX_INTERVAL_SECS {
                return invalid(format!("service.{} must be at most {}", name, MAX_INTERVAL_SECS));
            }
        }
        if s.publish_interval_secs < s.poll_interval_secs {
            return invalid("service.publish_interval_secs must not be shorter than poll_interval_secs".to_string());
        }
        if s.publish_threshold > 100 {
            return invalid("service.publish_threshold must be at most 100".to_string());
        }

        let a = &self.aggregation;
        if !(0.0..=1.0).contains(&a.min_confidence) {
            return invalid(format!("aggregation.min_confidence {} is outside [0, 1]", a.min_confidence));
        }
        if a.event_decay_hours == 0 {
            return invalid("aggregation.event_decay_hours must be positive".to_string());
        }
        if a.event_decay_hours > MAX_EVENT_DECAY_HOURS {
            return invalid(format!("aggregation.event_decay_hours must be at most {}", MAX_EVENT_DECAY_HOURS));
        }
        if a.max_events_per_target == 0 {
            return invalid("aggregation.max_events_per_target must be positive".to_string());
        }
        if a.min_sources_for_critical < a.min_sources_for_high {
            return invalid("aggregation.min_sources_for_critical must be >= min_sources_for_high".to_string());
        }

        for (source, weight) in self.source_weights.overrides() {
            if !(0.0..=1.0).contains(&weight) {
                return invalid(format!("source_weights.{} {} is outside [0, 1]", source, weight));
            }
        }

        for feed in &self.feeds {
            if !(feed.url.starts_with("http://") || feed.url.starts_with("https://")) {
                return invalid(format!("feed {} has unsupported url {:?}", feed.source, feed.url));
            }
            if feed.max_results == 0 {
                return invalid(format!("feed {} max_results must be positive", feed.source));
            }
            if feed.max_body_bytes == 0 {
                return invalid(format!("feed {} max_body_bytes must be positive", feed.source));
            }
            if feed.timeout_secs > MAX_INTERVAL_SECS {
                return invalid(format!("feed {} timeout_secs must be at most {}", feed.source, MAX_INTERVAL_SECS));
            }
        }

        if let Some(p) = &self.publisher {
            if !(p.rpc_endpoint.starts_with("http://") || p.rpc_endpoint.starts_with("https://")) {
                return invalid(format!("publisher.rpc_endpoint {:?} is not an http(s) url", p.rpc_endpoint));
            }
            if !is_evm_address(&p.contract_address) {
                return invalid(format!("publisher.contract_address {:?} is not an address", p.contract_address));
            }
            if p.chain_id == 0 {
                return invalid("publisher.chain_id must be positive".to_string());
            }
            if p.max_batch_size == 0 {
                return invalid("publisher.max_batch_size must be positive".to_string());
            }
            if p.min_update_interval_secs > MAX_INTERVAL_SECS {
                return invalid(format!("publisher.min_update_interval_secs must be at most {}", MAX_INTERVAL_SECS));
            }
            if p.request_timeout_secs > MAX_INTERVAL_SECS {
                return invalid(format!("publisher.request_timeout_secs must be at most {}", MAX_INTERVAL_SECS));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oracle_core::FeedSource;

    const SAMPLE: &str = r#"
[service]
poll_interval_secs = 120
publish_interval_secs = 600
publish_threshold = 70

[aggregation]
min_confidence = 0.4
max_events_per_target = 50

[source_weights]
github = 0.5
forta = 0.95

[[feeds]]
source = "forta"
url = "https://alerts.example/forta"
api_key = "k"

[[feeds]]
source = "chainabuse"
url = "https://reports.example/latest"
enabled = false

[publisher]
rpc_endpoint = "https://rpc.example"
contract_address = "0x00000000000000000000000000000000000000c0"
chain_id = 137
"#;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = OracleConfig::default();
        assert_eq!(config.service.poll_interval_secs, 300);
        assert_eq!(config.service.publish_interval_secs, 600);
        assert_eq!(config.service.prune_interval_secs, 3600);
        assert_eq!(config.service.publish_threshold, 50);
        assert_eq!(config.aggregation.min_sources_for_high, 2);
        assert_eq!(config.aggregation.min_sources_for_critical, 3);
        assert!(config.publisher.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_sample() {
        let config = OracleConfig::from_toml_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.service.poll_interval_secs, 120);
        assert_eq!(config.service.prune_interval_secs, 3600);
        assert_eq!(config.service.publish_threshold, 70);
        assert!((config.aggregation.min_confidence - 0.4).abs() < 1e-9);
        assert_eq!(config.aggregation.event_decay_hours, 168);

        assert!((config.source_weights.get(FeedSource::GitHub) - 0.5).abs() < 1e-9);
        assert!((config.source_weights.get(FeedSource::Nvd) - 0.9).abs() < 1e-9);

        assert_eq!(config.feeds.len(), 2);
        assert!(config.feeds[0].enabled);
        assert!(!config.feeds[1].enabled);
        assert_eq!(config.feeds[1].max_results, 500);

        let publisher = config.publisher.as_ref().unwrap();
        assert_eq!(publisher.chain_id, 137);
        assert_eq!(publisher.max_batch_size, 50);
        assert_eq!(publisher.min_update_interval_secs, 3600);
        assert!(publisher.private_key.is_none());
    }

    #[test]
    fn test_rendered_config_omits_key() {
        let mut config = OracleConfig::from_toml_str(SAMPLE).unwrap();
        config.set_private_key("0xsecret").unwrap();

        let rendered = config.to_toml_string().unwrap();
        assert!(!rendered.contains("0xsecret"));

        let reparsed = OracleConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(reparsed.service, config.service);
        assert_eq!(reparsed.source_weights, config.source_weights);
    }

    #[test]
    fn test_private_key_needs_publisher() {
        let mut config = OracleConfig::default();
        assert!(matches!(config.set_private_key("0x01"), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = OracleConfig::default();
        config.service.poll_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = OracleConfig::default();
        config.service.publish_interval_secs = 60;
        assert!(config.validate().is_err());

        let mut config = OracleConfig::default();
        config.aggregation.min_confidence = 1.5;
        assert!(config.validate().is_err());

        let mut config = OracleConfig::default();
        config.aggregation.min_sources_for_critical = 1;
        assert!(config.validate().is_err());

        let config = OracleConfig::from_toml_str("[source_weights]\nnvd = 2.0\n").unwrap();
        assert!(config.validate().is_err());

        let mut config = OracleConfig::from_toml_str(SAMPLE).unwrap();
        config.publisher.as_mut().unwrap().contract_address = "0x1234".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_bounds_durations() {
        let mut config = OracleConfig::default();
        config.aggregation.event_decay_hours = 10_000_000_000_000;
        assert!(config.validate().is_err());

        let mut config = OracleConfig::default();
        config.service.fetch_timeout_secs = u64::MAX;
        assert!(config.validate().is_err());
        // Getters stay usable on configs that skipped validation
        assert_eq!(config.service.fetch_timeout(), Duration::from_secs(MAX_INTERVAL_SECS));

        let mut config = OracleConfig::default();
        config.service.poll_interval_secs = MAX_INTERVAL_SECS + 1;
        config.service.publish_interval_secs = MAX_INTERVAL_SECS + 1;
        assert!(config.validate().is_err());

        let mut config = OracleConfig::from_toml_str(SAMPLE).unwrap();
        config.publisher.as_mut().unwrap().min_update_interval_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = OracleConfig::from_toml_str(SAMPLE).unwrap();
        config.service.prune_interval_secs = MAX_INTERVAL_SECS;
        config.aggregation.event_decay_hours = MAX_EVENT_DECAY_HOURS;
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_source_is_a_parse_error() {
        let result = OracleConfig::from_toml_str("[source_weights]\npastebin = 0.2\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_shipped_example_is_valid() {
        let config = OracleConfig::from_toml_str(include_str!("../../oracle.example.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.feeds.len(), 2);
        assert!(config.publisher.is_some());
    }

    #[test]
    fn test_load_reports_missing_file() {
        let result = OracleConfig::load("/nonexistent/oracle.toml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
