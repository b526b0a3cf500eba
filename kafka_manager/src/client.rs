//! Broker Client contract
//!
//! The manager never talks to brokers itself. It drives any type implementing
//! [`BrokerClient`]; the crate ships [`KafkaClient`](crate::kafka_client::KafkaClient)
//! as the default implementation.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// A single message handed to [`BrokerClient::publish`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceMessage {
    /// Opaque payload, already serialized by the caller
    pub value: Bytes,
}

impl ProduceMessage {
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

/// Connection-owning client the manager delegates to
///
/// Implementations are constructed without I/O and connected by
/// [`connect`](BrokerClient::connect). Every method may suspend on network I/O.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Opens connections to the configured brokers
    async fn connect(&self) -> Result<()>;

    /// One-shot liveness check against the cluster
    async fn health_probe(&self) -> Result<()>;

    /// Publishes `messages` to the configured topic in a single request
    async fn publish(&self, messages: Vec<ProduceMessage>) -> Result<()>;

    /// Closes every broker connection
    async fn disconnect(&self) -> Result<()>;
}
