//! Kafka Client Implementation
//!
//! This module provides the Kafka client the manager uses by default. It talks
//! to brokers directly over the Kafka protocol: [`BrokerConnection`] owns one
//! framed TCP connection with API version negotiation, and [`KafkaClient`]
//! builds on it to discover topic metadata, route records to partition
//! leaders and check produce acknowledgements.

use crate::client::{BrokerClient, ProduceMessage};
use crate::config::LocalConfig;
use crate::utils::{error_codes, is_retriable, kafka_error_message};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use kafka_protocol::{
    messages::{
        api_versions_request::ApiVersionsRequest,
        api_versions_response::ApiVersionsResponse,
        metadata_request::{MetadataRequest, MetadataRequestTopic},
        metadata_response::MetadataResponse,
        produce_request::{PartitionProduceData, ProduceRequest, TopicProduceData},
        produce_response::ProduceResponse,
        ApiKey, RequestHeader, ResponseHeader, TopicName,
    },
    protocol::{Decodable, Encodable, StrBytes},
    records::{Compression, Record, RecordBatchEncoder, RecordEncodeOptions, TimestampType},
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{Mutex, RwLock},
    time::{sleep, Duration},
};
use tracing::{debug, info, warn};

/// Retry budget used when the admin config leaves it unset
pub const DEFAULT_RETRIES: u32 = 5;

/// Pause between connection and metadata retries
const RETRY_INTERVAL: Duration = Duration::from_millis(300);

/// Broker-side timeout for produce acknowledgements
const PRODUCE_TIMEOUT_MS: i32 = 30000;

/// Largest response body accepted from a broker
const MAX_RESPONSE_SIZE: usize = 100 * 1024 * 1024;

const PREFERRED_METADATA_VERSION: i16 = 4;
const PREFERRED_PRODUCE_VERSION: i16 = 3;

/// A single framed connection to one Kafka broker
///
/// Requests on one connection are serialized: the stream mutex is held for a
/// whole request/response exchange.
pub struct BrokerConnection {
    /// Address this connection was opened to, "host:port"
    pub address: String,

    client_id: String,

    stream: Mutex<TcpStream>,

    /// Set while an exchange is in flight and left set when it fails or is
    /// cancelled; the stream position is then unknown and must be reopened
    broken: AtomicBool,

    /// Monotonically increasing correlation ID for request/response matching
    correlation_id: AtomicI32,

    /// Supported API versions discovered from the broker
    /// Maps API key (i16) to (min_version, max_version) tuple
    pub api_versions: HashMap<i16, (i16, i16)>,
}

impl BrokerConnection {
    /// Opens a connection and discovers the broker's supported API versions
    pub async fn connect(address: &str, client_id: &str) -> Result<Self> {
        debug!("Connecting to Kafka broker at {}", address);

        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| anyhow!("Failed to connect to Kafka broker at {}: {}", address, e))?;

        let mut connection = Self::from_stream(address, client_id, stream, HashMap::new());
        connection.discover_api_versions().await?;

        debug!("Successfully connected to Kafka broker at {}", address);
        Ok(connection)
    }

    /// Opens a connection reusing API versions discovered on another broker of the cluster
    pub async fn connect_with_versions(
        address: &str,
        client_id: &str,
        api_versions: HashMap<i16, (i16, i16)>,
    ) -> Result<Self> {
        debug!(
            "Connecting to Kafka broker at {} (using pre-discovered API versions)",
            address
        );

        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| anyhow!("Failed to connect to Kafka broker at {}: {}", address, e))?;

        Ok(Self::from_stream(address, client_id, stream, api_versions))
    }

    fn from_stream(
        address: &str,
        client_id: &str,
        stream: TcpStream,
        api_versions: HashMap<i16, (i16, i16)>,
    ) -> Self {
        BrokerConnection {
            address: address.to_string(),
            client_id: client_id.to_string(),
            stream: Mutex::new(stream),
            broken: AtomicBool::new(false),
            correlation_id: AtomicI32::new(1),
            api_versions,
        }
    }

    /// Sends a Kafka protocol request and returns the raw response bytes
    ///
    /// Frames the encoded header and body with a 4-byte big-endian length
    /// prefix, then reads one length-prefixed response and checks that its
    /// correlation ID matches the request. A connection left mid-exchange by
    /// an error or a dropped future is reopened before the next request.
    pub async fn send_request<T: Encodable + std::fmt::Debug>(
        &self,
        api_key: ApiKey,
        request: &T,
        version: i16,
    ) -> Result<Bytes> {
        let correlation_id = self.correlation_id.fetch_add(1, Ordering::SeqCst);

        debug!(
            "Sending {:?} request to {} (correlation_id: {}, version: {})",
            api_key, self.address, correlation_id, version
        );

        let mut header = RequestHeader::default();
        header.request_api_key = api_key as i16;
        header.request_api_version = version;
        header.correlation_id = correlation_id;
        header.client_id = Some(StrBytes::from_string(self.client_id.clone()));

        let header_version = api_key.request_header_version(version);

        let mut buf = Vec::new();
        header
            .encode(&mut buf, header_version)
            .map_err(|e| anyhow!("Failed to encode request header: {}", e))?;
        request
            .encode(&mut buf, version)
            .map_err(|e| anyhow!("Failed to encode {:?} request body: {}", api_key, e))?;

        let mut message = Vec::with_capacity(4 + buf.len());
        message.extend_from_slice(&(buf.len() as i32).to_be_bytes());
        message.extend_from_slice(&buf);

        let mut stream = self.stream.lock().await;
        if self.broken.load(Ordering::SeqCst) {
            warn!("Reopening connection to {} after an interrupted request", self.address);
            *stream = TcpStream::connect(&self.address).await.map_err(|e| {
                anyhow!("Failed to reconnect to Kafka broker at {}: {}", self.address, e)
            })?;
        }
        self.broken.store(true, Ordering::SeqCst);

        stream
            .write_all(&message)
            .await
            .map_err(|e| anyhow!("Failed to write request to {}: {}", self.address, e))?;

        let mut size_buf = [0u8; 4];
        stream.read_exact(&mut size_buf).await.map_err(|e| {
            anyhow!(
                "Failed to read response size from {}: {} (the broker may have closed the connection)",
                self.address,
                e
            )
        })?;

        let response_size = i32::from_be_bytes(size_buf) as usize;
        if response_size > MAX_RESPONSE_SIZE {
            return Err(anyhow!("Response size too large: {} bytes", response_size));
        }

        let mut response_buf = vec![0u8; response_size];
        stream
            .read_exact(&mut response_buf)
            .await
            .map_err(|e| anyhow!("Failed to read response body from {}: {}", self.address, e))?;

        // Every response header version starts with the correlation ID
        if response_buf.len() < 4 {
            return Err(anyhow!("Response too short: {} bytes", response_buf.len()));
        }
        let response_correlation_id = i32::from_be_bytes([
            response_buf[0],
            response_buf[1],
            response_buf[2],
            response_buf[3],
        ]);
        if response_correlation_id != correlation_id {
            return Err(anyhow!(
                "Correlation ID mismatch: sent {}, received {}",
                correlation_id,
                response_correlation_id
            ));
        }
        self.broken.store(false, Ordering::SeqCst);
        drop(stream);

        Ok(Bytes::from(response_buf))
    }

    /// Sends a request and decodes the typed response body
    pub async fn request<T, R>(&self, api_key: ApiKey, request: &T, version: i16) -> Result<R>
    where
        T: Encodable + std::fmt::Debug,
        R: Decodable,
    {
        let response_bytes = self.send_request(api_key, request, version).await?;
        let mut cursor = std::io::Cursor::new(response_bytes.as_ref());

        let header_version = api_key.response_header_version(version);
        ResponseHeader::decode(&mut cursor, header_version)
            .map_err(|e| anyhow!("Failed to decode {:?} response header: {}", api_key, e))?;

        R::decode(&mut cursor, version)
            .map_err(|e| anyhow!("Failed to decode {:?} response: {}", api_key, e))
    }

    /// Discovers and caches the broker's supported API versions
    async fn discover_api_versions(&mut self) -> Result<()> {
        debug!("Discovering supported API versions...");

        // Version 0 is understood by every broker
        let response: ApiVersionsResponse = self
            .request(ApiKey::ApiVersions, &ApiVersionsRequest::default(), 0)
            .await?;
        if response.error_code != error_codes::NONE {
            bail!(
                "ApiVersions request rejected by {}: {}",
                self.address,
                kafka_error_message(response.error_code)
            );
        }

        for api_version in response.api_keys {
            self.api_versions.insert(
                api_version.api_key,
                (api_version.min_version, api_version.max_version),
            );
        }

        debug!("Discovered {} supported APIs", self.api_versions.len());
        Ok(())
    }

    /// Selects a protocol version for `api_key` the broker supports
    ///
    /// Uses `preferred_version` when it is in the broker's range, the broker's
    /// maximum otherwise, and `preferred_version` if the API was never advertised.
    pub fn get_supported_version(&self, api_key: ApiKey, preferred_version: i16) -> i16 {
        if let Some((min_version, max_version)) = self.api_versions.get(&(api_key as i16)) {
            if preferred_version >= *min_version && preferred_version <= *max_version {
                preferred_version
            } else {
                debug!(
                    "Preferred version {} for {:?} not supported (range: {}-{}), using {}",
                    preferred_version, api_key, min_version, max_version, max_version
                );
                *max_version
            }
        } else {
            warn!(
                "API {:?} not found in version discovery, using version {}",
                api_key, preferred_version
            );
            preferred_version
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.stream
            .lock()
            .await
            .shutdown()
            .await
            .map_err(|e| anyhow!("Failed to close connection to {}: {}", self.address, e))
    }
}

/// A partition of the configured topic and the node currently leading it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInfo {
    pub index: i32,
    /// Leader node id, negative while no leader is elected
    pub leader: i32,
}

/// Routing table for the configured topic
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopicMetadata {
    /// node id -> "host:port"
    pub brokers: HashMap<i32, String>,
    /// Sorted by partition index
    pub partitions: Vec<PartitionInfo>,
}

/// Extracts `topic`'s routing table, or the Kafka error code explaining why it is unusable
fn parse_topic_metadata(topic: &str, response: MetadataResponse) -> Result<TopicMetadata, i16> {
    let brokers = response
        .brokers
        .iter()
        .map(|broker| {
            (
                broker.node_id.0,
                format!("{}:{}", broker.host.as_str(), broker.port),
            )
        })
        .collect();

    let topic_response = response
        .topics
        .into_iter()
        .find(|t| t.name.as_ref().map(|name| name.0.as_str()) == Some(topic))
        .ok_or(error_codes::UNKNOWN_TOPIC_OR_PARTITION)?;

    if topic_response.error_code != error_codes::NONE {
        return Err(topic_response.error_code);
    }

    let mut partitions: Vec<PartitionInfo> = topic_response
        .partitions
        .iter()
        .map(|partition| PartitionInfo {
            index: partition.partition_index,
            leader: partition.leader_id.0,
        })
        .collect();
    if partitions.is_empty() {
        // A freshly auto-created topic may be listed before its partitions
        return Err(error_codes::LEADER_NOT_AVAILABLE);
    }
    partitions.sort_by_key(|partition| partition.index);

    Ok(TopicMetadata {
        brokers,
        partitions,
    })
}

/// Round-robin choice among partitions that currently have a leader
fn pick_partition(partitions: &[PartitionInfo], counter: usize) -> Option<PartitionInfo> {
    let available: Vec<PartitionInfo> = partitions
        .iter()
        .filter(|partition| partition.leader >= 0)
        .copied()
        .collect();
    if available.is_empty() {
        return None;
    }
    Some(available[counter % available.len()])
}

/// Live connections of a connected client
struct Cluster {
    bootstrap: Arc<BrokerConnection>,
    metadata: RwLock<TopicMetadata>,
    /// Connections to partition leaders other than the bootstrap broker, by node id
    leaders: Mutex<HashMap<i32, Arc<BrokerConnection>>>,
}

impl Cluster {
    async fn leader_connection(&self, leader: i32) -> Result<Arc<BrokerConnection>> {
        let address = self
            .metadata
            .read()
            .await
            .brokers
            .get(&leader)
            .cloned()
            .ok_or_else(|| anyhow!("Broker {} is missing from cluster metadata", leader))?;

        if address == self.bootstrap.address {
            return Ok(self.bootstrap.clone());
        }

        let mut leaders = self.leaders.lock().await;
        if let Some(connection) = leaders.get(&leader) {
            if connection.address == address {
                return Ok(connection.clone());
            }
        }

        let connection = Arc::new(
            BrokerConnection::connect_with_versions(
                &address,
                &self.bootstrap.client_id,
                self.bootstrap.api_versions.clone(),
            )
            .await?,
        );
        info!("Connected to partition leader {} at {}", leader, address);
        leaders.insert(leader, connection.clone());
        Ok(connection)
    }

    /// Drops the cached connection to `leader` so the next use dials it again
    async fn evict_leader(&self, leader: i32) {
        if let Some(connection) = self.leaders.lock().await.remove(&leader) {
            debug!("Evicted connection to partition leader {} at {}", leader, connection.address);
        }
    }

    /// Closes every connection, reporting the first failure
    async fn shutdown(&self) -> Result<()> {
        let mut connections = vec![self.bootstrap.clone()];
        connections.extend(self.leaders.lock().await.drain().map(|(_, c)| c));

        let mut first_error = None;
        for connection in connections {
            if let Err(e) = connection.shutdown().await {
                warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Kafka producer client for one topic
///
/// Constructed from a [`LocalConfig`] without any I/O; [`BrokerClient::connect`]
/// opens the bootstrap connection and loads the topic's partition table.
pub struct KafkaClient {
    client_id: String,
    bootstrap_brokers: Vec<String>,
    topic: String,
    allow_auto_topic_creation: bool,
    retries: u32,
    cluster: RwLock<Option<Arc<Cluster>>>,
    next_partition: AtomicUsize,
}

impl KafkaClient {
    pub fn new(config: &LocalConfig) -> Result<Self> {
        if config.kafka.brokers.is_empty() {
            bail!("At least one bootstrap broker is required");
        }

        Ok(KafkaClient {
            client_id: config.kafka.client_id.clone(),
            bootstrap_brokers: config.kafka.brokers.clone(),
            topic: config.kafka.topic.clone(),
            allow_auto_topic_creation: config.producer.allow_auto_topic_creation.unwrap_or(true),
            retries: config.admin.retry.unwrap_or(DEFAULT_RETRIES),
            cluster: RwLock::new(None),
            // Spread independent producers over partitions from the first record
            next_partition: AtomicUsize::new(rand::random::<u32>() as usize),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Snapshot of the current routing table, if connected
    pub async fn topic_metadata(&self) -> Option<TopicMetadata> {
        let cluster = self.cluster.read().await.clone()?;
        let metadata = cluster.metadata.read().await.clone();
        Some(metadata)
    }

    async fn cluster(&self) -> Result<Arc<Cluster>> {
        self.cluster
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("Kafka client is not connected"))
    }

    /// Tries every bootstrap broker in order, for up to `retries + 1` rounds
    async fn connect_bootstrap(&self) -> Result<BrokerConnection> {
        let rounds = self.retries + 1;
        let mut last_error = None;

        for round in 1..=rounds {
            for broker in &self.bootstrap_brokers {
                match BrokerConnection::connect(broker, &self.client_id).await {
                    Ok(connection) => {
                        if round > 1 {
                            info!("Connected to Kafka broker {} on attempt {}", broker, round);
                        }
                        return Ok(connection);
                    }
                    Err(e) => {
                        warn!("Connection attempt {} to {} failed: {}", round, broker, e);
                        last_error = Some(e);
                    }
                }
            }

            if round < rounds {
                sleep(RETRY_INTERVAL).await;
            }
        }

        Err(match last_error {
            Some(e) => anyhow!(
                "{} (tried {} after {} attempts)",
                e,
                self.bootstrap_brokers.join(", "),
                rounds
            ),
            None => anyhow!("No bootstrap brokers configured"),
        })
    }

    /// Loads the topic's routing table, retrying transient metadata errors
    async fn fetch_metadata(
        &self,
        connection: &BrokerConnection,
        allow_auto_topic_creation: bool,
        retries: u32,
    ) -> Result<TopicMetadata> {
        let mut topic = MetadataRequestTopic::default();
        topic.name = Some(TopicName(StrBytes::from_string(self.topic.clone())));

        let mut request = MetadataRequest::default();
        request.topics = Some(vec![topic]);
        request.allow_auto_topic_creation = allow_auto_topic_creation;

        let version = connection.get_supported_version(ApiKey::Metadata, PREFERRED_METADATA_VERSION);

        let mut attempt = 0;
        loop {
            let response: MetadataResponse = connection
                .request(ApiKey::Metadata, &request, version)
                .await
                .map_err(|e| anyhow!("Failed to fetch metadata for topic '{}': {}", self.topic, e))?;

            let code = match parse_topic_metadata(&self.topic, response) {
                Ok(metadata) => return Ok(metadata),
                Err(code) => code,
            };

            if code == error_codes::UNKNOWN_TOPIC_OR_PARTITION && !allow_auto_topic_creation {
                bail!("Topic '{}' does not exist", self.topic);
            }

            let transient = is_retriable(code) || code == error_codes::UNKNOWN_TOPIC_OR_PARTITION;
            if !transient || attempt >= retries {
                bail!(
                    "Metadata for topic '{}' unavailable: {}",
                    self.topic,
                    kafka_error_message(code)
                );
            }

            attempt += 1;
            debug!(
                "Topic '{}' not ready ({}), retry {}/{}",
                self.topic,
                kafka_error_message(code),
                attempt,
                retries
            );
            sleep(RETRY_INTERVAL).await;
        }
    }

    /// Encodes `messages` as a single record batch for `partition`
    fn build_produce_request(
        &self,
        partition: i32,
        messages: &[ProduceMessage],
    ) -> Result<ProduceRequest> {
        let timestamp = chrono::Utc::now().timestamp_millis();

        let records: Vec<Record> = messages
            .iter()
            .enumerate()
            .map(|(i, message)| Record {
                transactional: false,
                control: false,
                partition_leader_epoch: 0,
                producer_id: -1, // Idempotence disabled
                producer_epoch: -1,
                timestamp_type: TimestampType::Creation,
                offset: i as i64, // Relative to the batch, the broker assigns real offsets
                // The encoder splits batches wherever offset - sequence changes;
                // the first record carries the batch's -1 base sequence
                sequence: i as i32 - 1,
                timestamp,
                key: None,
                value: Some(message.value.clone()),
                headers: indexmap::IndexMap::new(),
            })
            .collect();

        let options = RecordEncodeOptions {
            version: 2,
            compression: Compression::None,
        };
        let mut batch_buf = BytesMut::new();
        RecordBatchEncoder::encode(&mut batch_buf, records.iter().collect::<Vec<_>>(), &options)?;

        let mut partition_data = PartitionProduceData::default();
        partition_data.index = partition;
        partition_data.records = Some(batch_buf.freeze());

        let mut topic_data = TopicProduceData::default();
        topic_data.name = TopicName(StrBytes::from_string(self.topic.clone()));
        topic_data.partition_data.push(partition_data);

        let mut request = ProduceRequest::default();
        request.acks = -1;
        request.timeout_ms = PRODUCE_TIMEOUT_MS;
        request.topic_data.push(topic_data);
        Ok(request)
    }

    /// Reloads the routing table after a leadership change
    async fn refresh_metadata(&self, cluster: &Cluster) {
        match self.fetch_metadata(&cluster.bootstrap, false, 0).await {
            Ok(metadata) => *cluster.metadata.write().await = metadata,
            Err(e) => warn!("Metadata refresh failed: {}", e),
        }
    }
}

#[async_trait]
impl BrokerClient for KafkaClient {
    async fn connect(&self) -> Result<()> {
        info!(
            "Connecting to Kafka brokers {} as '{}'",
            self.bootstrap_brokers.join(", "),
            self.client_id
        );

        let bootstrap = self.connect_bootstrap().await?;
        let metadata = self
            .fetch_metadata(&bootstrap, self.allow_auto_topic_creation, self.retries)
            .await?;
        info!(
            "Topic '{}' has {} partitions across {} brokers",
            self.topic,
            metadata.partitions.len(),
            metadata.brokers.len()
        );

        let cluster = Arc::new(Cluster {
            bootstrap: Arc::new(bootstrap),
            metadata: RwLock::new(metadata),
            leaders: Mutex::new(HashMap::new()),
        });

        let previous = self.cluster.write().await.replace(cluster);
        if let Some(previous) = previous {
            if let Err(e) = previous.shutdown().await {
                warn!("Closing the previous Kafka connections failed: {}", e);
            }
        }
        Ok(())
    }

    async fn health_probe(&self) -> Result<()> {
        let cluster = self.cluster().await?;

        let metadata = self.fetch_metadata(&cluster.bootstrap, false, 0).await?;
        if metadata.brokers.is_empty() {
            bail!("Cluster metadata lists no brokers");
        }
        *cluster.metadata.write().await = metadata;

        debug!("Kafka health check passed for topic '{}'", self.topic);
        Ok(())
    }

    async fn publish(&self, messages: Vec<ProduceMessage>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let cluster = self.cluster().await?;

        let counter = self.next_partition.fetch_add(1, Ordering::Relaxed);
        let partition = pick_partition(&cluster.metadata.read().await.partitions, counter)
            .ok_or_else(|| anyhow!("No partition of topic '{}' has a leader", self.topic))?;

        let connection = cluster.leader_connection(partition.leader).await?;
        let request = self.build_produce_request(partition.index, &messages)?;
        let version = connection.get_supported_version(ApiKey::Produce, PREFERRED_PRODUCE_VERSION);

        let response: ProduceResponse =
            match connection.request(ApiKey::Produce, &request, version).await {
                Ok(response) => response,
                Err(e) => {
                    // The leader may have moved or gone away
                    cluster.evict_leader(partition.leader).await;
                    self.refresh_metadata(&cluster).await;
                    bail!(
                        "Failed to produce to partition {} of '{}': {}",
                        partition.index,
                        self.topic,
                        e
                    );
                }
            };

        let partition_response = response
            .responses
            .iter()
            .flat_map(|topic_response| topic_response.partition_responses.iter())
            .find(|partition_response| partition_response.index == partition.index)
            .ok_or_else(|| {
                anyhow!(
                    "Produce response has no result for partition {}",
                    partition.index
                )
            })?;

        if partition_response.error_code != error_codes::NONE {
            let code = partition_response.error_code;
            if is_retriable(code) {
                self.refresh_metadata(&cluster).await;
            }
            bail!(
                "Broker rejected produce to partition {} of '{}': {}",
                partition.index,
                self.topic,
                kafka_error_message(code)
            );
        }

        debug!(
            "Produced {} records to partition {} (base offset {})",
            messages.len(),
            partition.index,
            partition_response.base_offset
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let cluster = self
            .cluster
            .write()
            .await
            .take()
            .ok_or_else(|| anyhow!("Kafka client is not connected"))?;
        cluster.shutdown().await
    }
}
