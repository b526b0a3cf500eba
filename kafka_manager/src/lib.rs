//! Kafka Producer Manager Library
//!
//! This library manages the lifecycle of a single Kafka producer connection:
//! validate a configuration, connect once, check health, produce messages and
//! close. [`BrokerProducerManager`] drives any [`BrokerClient`];
//! [`KafkaClient`] is the protocol-level client used by default.

pub mod args;
pub mod client;
pub mod config;
pub mod error;
pub mod kafka_client;
pub mod manager;
pub mod utils;

#[cfg(test)]
mod fake_broker;

// Re-export commonly used types
pub use client::{BrokerClient, ProduceMessage};
pub use config::{build_local_config, validate_config, InputConfig, LocalConfig};
pub use error::{ConfigError, InitError, ManagerError, Operation};
pub use kafka_client::KafkaClient;
pub use manager::BrokerProducerManager;
