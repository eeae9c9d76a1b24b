//! Configuration model.
//!
//! Every section defaults, so an empty file is a valid configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Root of the YAML configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipewrightConfig {
    pub http: HttpConfig,
    /// Second listener that serves only the liveness and readiness routes.
    pub metrics_addr: Option<String>,
    pub log_level: Option<String>,
    pub storage: StorageConfig,
    pub kafka: KafkaConfig,
    pub services_ping: ServicesPingConfig,
    pub task_retry: TaskRetryConfig,
    pub integrations: IntegrationsConfig,
    pub cache: CacheConfig,
    pub engine: EngineConfig,
}

impl PipewrightConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseYaml(e.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::ParseYaml(e.to_string()))
    }

    /// Parsed [`PipewrightConfig::metrics_addr`].
    pub fn metrics_socket(&self) -> Result<Option<SocketAddr>> {
        self.metrics_addr
            .as_deref()
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .map_err(|e| invalid("metrics_addr", &format!("{addr:?}: {e}")))
            })
            .transpose()
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.metrics_socket()?;
        if self.storage.pool_size == 0 {
            return Err(invalid("storage.pool_size", "must be > 0"));
        }
        if self.services_ping.interval_secs == 0 {
            return Err(invalid("services_ping.interval_secs", "must be > 0"));
        }
        if self.services_ping.max_failed == 0 {
            return Err(invalid("services_ping.max_failed", "must be > 0"));
        }
        if self.services_ping.max_ok == 0 {
            return Err(invalid("services_ping.max_ok", "must be > 0"));
        }
        for (field, topic) in [
            ("kafka.function_out_topic", &self.kafka.function_out_topic),
            ("kafka.function_in_topic", &self.kafka.function_in_topic),
            ("kafka.run_task_topic", &self.kafka.run_task_topic),
            ("kafka.sd_events_topic", &self.kafka.sd_events_topic),
        ] {
            if topic.trim().is_empty() {
                return Err(invalid(field, "topic name is empty"));
            }
        }
        if self.kafka.function_workers == 0 || self.kafka.run_task_workers == 0 {
            return Err(invalid("kafka.*_workers", "must be > 0"));
        }
        if self.task_retry.min_lifetime_secs > self.task_retry.max_lifetime_secs {
            return Err(invalid(
                "task_retry.min_lifetime_secs",
                "must not exceed max_lifetime_secs",
            ));
        }
        if self.engine.max_recursion_depth == 0 {
            return Err(invalid("engine.max_recursion_depth", "must be > 0"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub addr: String,
    /// Timeout applied to read endpoints.
    pub request_timeout_secs: u64,
    pub liveness_path: String,
    pub readiness_path: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8181".to_string(),
            request_timeout_secs: 30,
            liveness_path: "/healthz".to_string(),
            readiness_path: "/readyz".to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Storage
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub path: PathBuf,
    /// Connections in total: one writer, the rest read-only.
    pub pool_size: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pipewright.db"),
            pool_size: 1,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message bus
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Empty means the in-process transport is used.
    pub brokers: Vec<String>,
    pub consumer_group: String,
    pub function_out_topic: String,
    pub function_in_topic: String,
    pub run_task_topic: String,
    pub sd_events_topic: String,
    pub function_workers: usize,
    pub run_task_workers: usize,
    /// Delay between relay passes over the outbox.
    pub resend_delay_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            consumer_group: "pipewright".to_string(),
            function_out_topic: "function-out".to_string(),
            function_in_topic: "function-in".to_string(),
            run_task_topic: "run-task".to_string(),
            sd_events_topic: "sd-events".to_string(),
            function_workers: 4,
            run_task_workers: 4,
            resend_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesPingConfig {
    pub interval_secs: u64,
    /// Consecutive failures before consumption stops.
    pub max_failed: u32,
    /// Consecutive successes before consumption resumes.
    pub max_ok: u32,
}

impl Default for ServicesPingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            max_failed: 3,
            max_ok: 3,
        }
    }
}

/// Bounds on how long an inbound message is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRetryConfig {
    pub min_lifetime_secs: u64,
    pub max_lifetime_secs: u64,
}

impl Default for TaskRetryConfig {
    fn default() -> Self {
        Self {
            min_lifetime_secs: 60,
            max_lifetime_secs: 86_400,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Integrations and caches
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationsConfig {
    pub calendar_url: Option<String>,
    pub delegations_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for IntegrationsConfig {
    fn default() -> Self {
        Self {
            calendar_url: None,
            delegations_url: None,
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub delegations_ttl_secs: u64,
    pub delegations_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            delegations_ttl_secs: 300,
            delegations_capacity: 1000,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// List the placeholder block in the catalog.
    pub expose_placeholder: bool,
    /// Blocks one advancement may chain through before failing.
    pub max_recursion_depth: u32,
    pub sla_sweep_interval_secs: u64,
    /// Directory for the rolling JSON log; defaults to the data dir.
    pub log_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            expose_placeholder: false,
            max_recursion_depth: 10,
            sla_sweep_interval_secs: 60,
            log_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_is_default() {
        let config = PipewrightConfig::from_yaml("").unwrap();
        assert_eq!(config, PipewrightConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let config = PipewrightConfig::from_yaml(
            r#"
http:
  addr: "127.0.0.1:9000"
kafka:
  brokers: ["k1:9092", "k2:9092"]
engine:
  expose_placeholder: true
"#,
        )
        .unwrap();
        assert_eq!(config.http.addr, "127.0.0.1:9000");
        assert_eq!(config.http.liveness_path, "/healthz");
        assert_eq!(config.kafka.brokers.len(), 2);
        assert_eq!(config.kafka.function_out_topic, "function-out");
        assert!(config.engine.expose_placeholder);
        assert_eq!(config.engine.max_recursion_depth, 10);
    }

    #[test]
    fn test_validate_rejects_zero_thresholds() {
        let mut config = PipewrightConfig::default();
        config.services_ping.max_failed = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "services_ping.max_failed"));
    }

    #[test]
    fn test_validate_rejects_empty_topic() {
        let mut config = PipewrightConfig::default();
        config.kafka.run_task_topic = " ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_metrics_addr_must_be_a_socket() {
        let mut config = PipewrightConfig::default();
        assert_eq!(config.metrics_socket().unwrap(), None);

        config.metrics_addr = Some("127.0.0.1:9090".into());
        config.validate().unwrap();
        assert_eq!(config.metrics_socket().unwrap().unwrap().port(), 9090);

        config.metrics_addr = Some("localhost".into());
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "metrics_addr"));
    }

    #[test]
    fn test_storage_pool_size() {
        let config = PipewrightConfig::from_yaml("storage:\n  pool_size: 4\n").unwrap();
        assert_eq!(config.storage.pool_size, 4);
        config.validate().unwrap();

        let config = PipewrightConfig::from_yaml("storage:\n  pool_size: 0\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "storage.pool_size"));
    }

    #[test]
    fn test_bad_yaml() {
        let err = PipewrightConfig::from_yaml("http: [").unwrap_err();
        assert!(matches!(err, ConfigError::ParseYaml(_)));
    }

    #[test]
    fn test_yaml_round_trip() {
        let mut config = PipewrightConfig::default();
        config.log_level = Some("debug".into());
        let yaml = config.to_yaml().unwrap();
        assert_eq!(PipewrightConfig::from_yaml(&yaml).unwrap(), config);
    }
}
