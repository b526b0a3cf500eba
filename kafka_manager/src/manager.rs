//! Producer connection lifecycle
//!
//! [`BrokerProducerManager`] owns at most one connected [`BrokerClient`] and
//! exposes `init`, `health`, `produce` and `close` over it. Every outcome is
//! logged; every failure except those from `close` is returned to the caller.

use crate::client::{BrokerClient, ProduceMessage};
use crate::config::{build_local_config, validate_config, InputConfig, LocalConfig};
use crate::error::{InitError, ManagerError, Operation};
use crate::kafka_client::KafkaClient;
use anyhow::anyhow;
use bytes::Bytes;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

/// Builds an unconnected client from the derived configuration
pub type ClientFactory<C> = Box<dyn Fn(&LocalConfig) -> anyhow::Result<C> + Send + Sync>;

/// A connected client together with the configuration it was built from
struct Session<C> {
    client: C,
    local_config: LocalConfig,
}

/// Manages the single producer connection of an application
///
/// `init` is guarded by an async once-cell: concurrent calls on an empty
/// manager construct and connect exactly one client, and a failed attempt
/// leaves the manager empty so the next call starts over.
pub struct BrokerProducerManager<C: BrokerClient = KafkaClient> {
    factory: ClientFactory<C>,
    session: OnceCell<Session<C>>,
}

impl BrokerProducerManager<KafkaClient> {
    /// Manager backed by the bundled [`KafkaClient`]
    pub fn new() -> Self {
        Self::with_factory(KafkaClient::new)
    }
}

impl Default for BrokerProducerManager<KafkaClient> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: BrokerClient> BrokerProducerManager<C> {
    /// Manager that builds its client with `factory`
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn(&LocalConfig) -> anyhow::Result<C> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            session: OnceCell::new(),
        }
    }

    /// Validates `config`, builds a client from it and connects
    ///
    /// Does nothing if a client is already connected, even when `config`
    /// differs from the one it was built with.
    pub async fn init(&self, config: &InputConfig) -> Result<(), ManagerError> {
        if self.session.initialized() {
            return Ok(());
        }

        match self.session.get_or_try_init(|| self.connect(config)).await {
            Ok(_) => Ok(()),
            Err(source) => {
                let err = ManagerError::Initialization { source };
                error!("{}", err);
                Err(err)
            }
        }
    }

    async fn connect(&self, config: &InputConfig) -> Result<Session<C>, InitError> {
        validate_config(config)?;
        let local_config = build_local_config(config);
        let client = (self.factory)(&local_config).map_err(InitError::Client)?;
        client.connect().await.map_err(InitError::Client)?;

        info!("Kafka client initialized successfully");
        Ok(Session {
            client,
            local_config,
        })
    }

    /// Asks the client to probe the cluster once
    pub async fn health(&self) -> Result<(), ManagerError> {
        let session = self.session_for(Operation::Health)?;

        session.client.health_probe().await.map_err(|source| {
            let err = ManagerError::HealthCheck { source };
            error!("{}", err);
            err
        })
    }

    /// Publishes `message` as a batch of exactly one record
    pub async fn produce(&self, message: impl Into<Bytes>) -> Result<(), ManagerError> {
        let session = self.session_for(Operation::Produce)?;
        let messages = vec![ProduceMessage::new(message)];

        match session.client.publish(messages).await {
            Ok(()) => {
                debug!("Produced message to kafka");
                Ok(())
            }
            Err(source) => {
                error!(
                    "Failed to produce message to kafka with error {}. stack {:?}",
                    source, source
                );
                Err(ManagerError::Produce { source })
            }
        }
    }

    /// Disconnects the client; failures are logged and never returned
    ///
    /// The client handle is kept, so a later `init` stays a no-op.
    pub async fn close(&self) {
        info!("Closing Kafka connection");

        let result = match self.session.get() {
            Some(session) => session.client.disconnect().await,
            None => Err(anyhow!(ManagerError::NotInitialized {
                operation: Operation::Close,
            })),
        };

        match result {
            Ok(()) => info!("Kafka connections were closed successfully."),
            Err(e) => error!("Kafka disconnect failed with error {}", e),
        }
    }

    /// Whether `init` has completed successfully
    pub fn is_initialized(&self) -> bool {
        self.session.initialized()
    }

    /// Configuration the current client was built from
    pub fn local_config(&self) -> Option<&LocalConfig> {
        self.session.get().map(|session| &session.local_config)
    }

    /// The connected client, if any
    pub fn client(&self) -> Option<&C> {
        self.session.get().map(|session| &session.client)
    }

    fn session_for(&self, operation: Operation) -> Result<&Session<C>, ManagerError> {
        self.session.get().ok_or_else(|| {
            let err = ManagerError::NotInitialized { operation };
            error!("{}", err);
            err
        })
    }
}
