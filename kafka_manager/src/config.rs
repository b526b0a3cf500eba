//! Producer configuration
//!
//! [`InputConfig`] is what callers hand to `init`. It is checked by
//! [`validate_config`] and then reshaped by [`build_local_config`] into the
//! grouped [`LocalConfig`] that Broker Clients are constructed from.

use crate::error::ConfigError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Longest topic name a Kafka broker accepts
pub const MAX_TOPIC_NAME_LEN: usize = 249;

/// Caller-supplied producer settings
///
/// Deserializes from JSON with camelCase keys, e.g.
/// `{"clientId": "c1", "brokers": ["b1:9092"], "topic": "t"}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InputConfig {
    pub client_id: String,
    pub brokers: Vec<String>,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_auto_topic_creation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_retries: Option<u32>,
}

impl InputConfig {
    /// Loads a configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading {:?}", path.as_ref()))?;
        let config: InputConfig =
            serde_json::from_str(&raw).with_context(|| "parsing producer config JSON")?;
        Ok(config)
    }
}

/// Connection identity and target topic
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaConfig {
    pub client_id: String,
    pub brokers: Vec<String>,
    pub topic: String,
}

/// Producer behaviour
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerConfig {
    /// `None` leaves the decision to the client's own default
    pub allow_auto_topic_creation: Option<bool>,
}

/// Admin retry policy
#[derive(Debug, Clone, PartialEq)]
pub struct AdminConfig {
    pub retry: Option<u32>,
}

/// Immutable snapshot derived from an [`InputConfig`]
#[derive(Debug, Clone, PartialEq)]
pub struct LocalConfig {
    pub kafka: KafkaConfig,
    pub producer: ProducerConfig,
    pub admin: AdminConfig,
}

/// Regroups the caller's settings; values are copied as given, nothing is defaulted
pub fn build_local_config(config: &InputConfig) -> LocalConfig {
    LocalConfig {
        kafka: KafkaConfig {
            client_id: config.client_id.clone(),
            brokers: config.brokers.clone(),
            topic: config.topic.clone(),
        },
        producer: ProducerConfig {
            allow_auto_topic_creation: config.allow_auto_topic_creation,
        },
        admin: AdminConfig {
            retry: config.admin_retries,
        },
    }
}

/// Rejects configurations that can never produce a working client
pub fn validate_config(config: &InputConfig) -> Result<(), ConfigError> {
    if config.client_id.trim().is_empty() {
        return Err(ConfigError::MissingClientId);
    }

    if config.brokers.is_empty() {
        return Err(ConfigError::NoBrokers);
    }
    for broker in &config.brokers {
        if !is_broker_address(broker) {
            return Err(ConfigError::InvalidBroker(broker.clone()));
        }
    }

    validate_topic_name(&config.topic)
}

/// Checks `host:port`; an IPv6 host must be bracketed, as in `[::1]:9092`
fn is_broker_address(address: &str) -> bool {
    let Some((host, port)) = address.rsplit_once(':') else {
        return false;
    };
    let host = match host.strip_prefix('[') {
        Some(inner) => match inner.strip_suffix(']') {
            Some(inner) => inner,
            None => return false,
        },
        None if host.contains([':', ']']) => return false,
        None => host,
    };
    !host.is_empty()
        && !host.chars().any(char::is_whitespace)
        && matches!(port.parse::<u16>(), Ok(p) if p > 0)
}

fn validate_topic_name(topic: &str) -> Result<(), ConfigError> {
    let invalid = |reason| ConfigError::InvalidTopic {
        name: topic.to_string(),
        reason,
    };

    if topic.is_empty() {
        return Err(ConfigError::MissingTopic);
    }
    if topic == "." || topic == ".." {
        return Err(invalid("'.' and '..' are reserved"));
    }
    if topic.len() > MAX_TOPIC_NAME_LEN {
        return Err(invalid("longer than 249 characters"));
    }
    if !topic
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(invalid("only ASCII alphanumerics, '.', '_' and '-' are allowed"));
    }
    Ok(())
}
