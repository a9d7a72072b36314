//! Broker configuration.
//!
//! Deserializable from a config file section and parseable from a flat
//! properties map, which is how embedding processes hand options through.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, QueryResult};

/// Upper bound on selection size and group-by top-N.
pub const QUERY_RESPONSE_LIMIT_KEY: &str = "pinot.broker.query.response.limit";
/// Per-request deadline in milliseconds.
pub const TIMEOUT_MS_KEY: &str = "pinot.broker.timeoutMs";
/// Broker identifier embedded in each per-server request.
pub const BROKER_ID_KEY: &str = "pinot.broker.id";

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Upper bound on selection LIMIT and group-by TOP. Queries exceeding it
    /// are rejected synchronously before any dispatch.
    #[serde(default = "default_query_response_limit")]
    pub query_response_limit: i64,
    /// Per-request deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Identifier of this broker, embedded in every per-server request.
    #[serde(default = "default_broker_id")]
    pub broker_id: String,
}

fn default_query_response_limit() -> i64 {
    i64::MAX
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_broker_id() -> String {
    // The host name is the conventional broker id; fall back to a fixed
    // value when the environment does not provide one.
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            query_response_limit: default_query_response_limit(),
            timeout_ms: default_timeout_ms(),
            broker_id: default_broker_id(),
        }
    }
}

impl BrokerConfig {
    /// Parse recognized keys out of a flat properties map; unknown keys are
    /// ignored, unparsable values are an error.
    pub fn from_properties(properties: &HashMap<String, String>) -> QueryResult<Self> {
        let mut config = BrokerConfig::default();
        if let Some(value) = properties.get(QUERY_RESPONSE_LIMIT_KEY) {
            config.query_response_limit = value.parse().map_err(|_| {
                QueryError::Internal(format!(
                    "invalid value for {}: {}",
                    QUERY_RESPONSE_LIMIT_KEY, value
                ))
            })?;
        }
        if let Some(value) = properties.get(TIMEOUT_MS_KEY) {
            config.timeout_ms = value.parse().map_err(|_| {
                QueryError::Internal(format!("invalid value for {}: {}", TIMEOUT_MS_KEY, value))
            })?;
        }
        if let Some(value) = properties.get(BROKER_ID_KEY) {
            config.broker_id = value.clone();
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.query_response_limit, i64::MAX);
        assert_eq!(config.timeout_ms, 10_000);
        assert!(!config.broker_id.is_empty());
    }

    #[test]
    fn from_properties_overrides_known_keys() {
        let mut props = HashMap::new();
        props.insert(QUERY_RESPONSE_LIMIT_KEY.to_string(), "1000".to_string());
        props.insert(TIMEOUT_MS_KEY.to_string(), "2500".to_string());
        props.insert(BROKER_ID_KEY.to_string(), "broker-7".to_string());
        props.insert("pinot.broker.unknown".to_string(), "x".to_string());

        let config = BrokerConfig::from_properties(&props).unwrap();
        assert_eq!(config.query_response_limit, 1000);
        assert_eq!(config.timeout_ms, 2500);
        assert_eq!(config.broker_id, "broker-7");
    }

    #[test]
    fn from_properties_rejects_garbage() {
        let mut props = HashMap::new();
        props.insert(TIMEOUT_MS_KEY.to_string(), "soon".to_string());
        assert!(BrokerConfig::from_properties(&props).is_err());
    }
}
