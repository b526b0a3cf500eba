//! In-process single-node Kafka broker for tests
//!
//! Answers ApiVersions, Metadata and Produce over real Kafka framing so the
//! client can be exercised end to end without a cluster.

use bytes::Bytes;
use kafka_protocol::{
    messages::{
        api_versions_response::{ApiVersion, ApiVersionsResponse},
        metadata_request::MetadataRequest,
        metadata_response::{
            MetadataResponse, MetadataResponseBroker, MetadataResponsePartition,
            MetadataResponseTopic,
        },
        produce_request::ProduceRequest,
        produce_response::{PartitionProduceResponse, ProduceResponse, TopicProduceResponse},
        ApiKey, BrokerId, RequestHeader, ResponseHeader,
    },
    protocol::{Decodable, Encodable, StrBytes},
    records::RecordBatchDecoder,
};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicI16, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Duration};

const NODE_ID: i32 = 1;
const UNKNOWN_TOPIC_OR_PARTITION: i16 = 3;

/// What the broker has seen and how it should answer
#[derive(Default)]
pub struct FakeState {
    /// topic name -> partition count
    pub topics: Mutex<HashMap<String, i32>>,
    /// (partition, value) of every record received
    pub produced: Mutex<Vec<(i32, Bytes)>>,
    /// `allow_auto_topic_creation` of every Metadata request
    pub auto_create_flags: Mutex<Vec<bool>>,
    /// Record batches found in each produced partition payload
    pub batches_per_partition: Mutex<Vec<usize>>,
    pub produce_requests: AtomicUsize,
    pub connections: AtomicUsize,
    /// Error code returned for every produced partition
    pub produce_error: AtomicI16,
    /// Milliseconds to hold every response before writing it
    pub response_delay_ms: AtomicU64,
    next_offset: AtomicI64,
}

pub struct FakeBroker {
    pub address: String,
    pub state: Arc<FakeState>,
}

impl FakeBroker {
    /// Starts a broker on an ephemeral port hosting `topics`
    pub async fn start(topics: &[(&str, i32)]) -> FakeBroker {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let state = Arc::new(FakeState::default());
        {
            let mut known = state.topics.lock().unwrap();
            for (name, partitions) in topics {
                known.insert(name.to_string(), *partitions);
            }
        }

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(socket, accept_state.clone(), port));
            }
        });

        FakeBroker {
            address: format!("127.0.0.1:{}", port),
            state,
        }
    }

    /// Values received so far, in arrival order
    pub fn produced_values(&self) -> Vec<Bytes> {
        self.state
            .produced
            .lock()
            .unwrap()
            .iter()
            .map(|(_, value)| value.clone())
            .collect()
    }
}

/// Address nothing listens on
pub async fn unreachable_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);
    address
}

async fn serve(mut socket: TcpStream, state: Arc<FakeState>, port: u16) {
    loop {
        let mut size_buf = [0u8; 4];
        if socket.read_exact(&mut size_buf).await.is_err() {
            return;
        }
        let mut frame = vec![0u8; i32::from_be_bytes(size_buf) as usize];
        if socket.read_exact(&mut frame).await.is_err() {
            return;
        }

        let body = respond(&frame, &state, port);
        let delay = state.response_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            sleep(Duration::from_millis(delay)).await;
        }
        let mut message = Vec::with_capacity(4 + body.len());
        message.extend_from_slice(&(body.len() as i32).to_be_bytes());
        message.extend_from_slice(&body);
        if socket.write_all(&message).await.is_err() {
            return;
        }
    }
}

fn respond(frame: &[u8], state: &FakeState, port: u16) -> Vec<u8> {
    let api_key = ApiKey::try_from(i16::from_be_bytes([frame[0], frame[1]])).unwrap();
    let version = i16::from_be_bytes([frame[2], frame[3]]);

    let mut cursor = Cursor::new(frame);
    let header = RequestHeader::decode(&mut cursor, api_key.request_header_version(version)).unwrap();

    let mut response_header = ResponseHeader::default();
    response_header.correlation_id = header.correlation_id;
    let mut buf = Vec::new();
    response_header
        .encode(&mut buf, api_key.response_header_version(version))
        .unwrap();

    match api_key {
        ApiKey::ApiVersions => api_versions().encode(&mut buf, version).unwrap(),
        ApiKey::Metadata => {
            let request = MetadataRequest::decode(&mut cursor, version).unwrap();
            metadata(request, state, port).encode(&mut buf, version).unwrap();
        }
        ApiKey::Produce => {
            let request = ProduceRequest::decode(&mut cursor, version).unwrap();
            produce(request, state).encode(&mut buf, version).unwrap();
        }
        other => panic!("fake broker does not handle {:?}", other),
    }
    buf
}

fn api_versions() -> ApiVersionsResponse {
    let mut response = ApiVersionsResponse::default();
    for (api_key, max_version) in [
        (ApiKey::Produce, 9),
        (ApiKey::Metadata, 12),
        (ApiKey::ApiVersions, 3),
    ] {
        let mut api = ApiVersion::default();
        api.api_key = api_key as i16;
        api.min_version = 0;
        api.max_version = max_version;
        response.api_keys.push(api);
    }
    response
}

fn metadata(request: MetadataRequest, state: &FakeState, port: u16) -> MetadataResponse {
    state
        .auto_create_flags
        .lock()
        .unwrap()
        .push(request.allow_auto_topic_creation);

    let mut response = MetadataResponse::default();
    let mut broker = MetadataResponseBroker::default();
    broker.node_id = BrokerId(NODE_ID);
    broker.host = StrBytes::from_static_str("127.0.0.1");
    broker.port = port as i32;
    response.brokers.push(broker);
    response.controller_id = BrokerId(NODE_ID);

    let mut topics = state.topics.lock().unwrap();
    for requested in request.topics.unwrap_or_default() {
        let Some(name) = requested.name else {
            continue;
        };
        let key = name.0.as_str().to_string();
        if !topics.contains_key(&key) && request.allow_auto_topic_creation {
            topics.insert(key.clone(), 1);
        }

        let mut topic = MetadataResponseTopic::default();
        topic.name = Some(name);
        match topics.get(&key) {
            Some(&count) => {
                for index in 0..count {
                    let mut partition = MetadataResponsePartition::default();
                    partition.partition_index = index;
                    partition.leader_id = BrokerId(NODE_ID);
                    partition.replica_nodes = vec![BrokerId(NODE_ID)];
                    partition.isr_nodes = vec![BrokerId(NODE_ID)];
                    topic.partitions.push(partition);
                }
            }
            None => topic.error_code = UNKNOWN_TOPIC_OR_PARTITION,
        }
        response.topics.push(topic);
    }
    response
}

fn produce(request: ProduceRequest, state: &FakeState) -> ProduceResponse {
    state.produce_requests.fetch_add(1, Ordering::SeqCst);
    let error_code = state.produce_error.load(Ordering::SeqCst);

    let mut response = ProduceResponse::default();
    for topic_data in request.topic_data {
        let mut topic_response = TopicProduceResponse::default();
        topic_response.name = topic_data.name.clone();

        for partition_data in topic_data.partition_data {
            let records = partition_data.records.clone().unwrap_or_default();
            let mut records_cursor = Cursor::new(records.as_ref());
            let record_sets = RecordBatchDecoder::decode_all(&mut records_cursor).unwrap();
            state
                .batches_per_partition
                .lock()
                .unwrap()
                .push(record_sets.len());
            let records: Vec<_> = record_sets
                .into_iter()
                .flat_map(|record_set| record_set.records)
                .collect();
            let count = records.len() as i64;

            if error_code == 0 {
                let mut produced = state.produced.lock().unwrap();
                for record in records {
                    produced.push((partition_data.index, record.value.unwrap_or_default()));
                }
            }

            let mut partition_response = PartitionProduceResponse::default();
            partition_response.index = partition_data.index;
            partition_response.error_code = error_code;
            partition_response.base_offset = state.next_offset.fetch_add(count, Ordering::SeqCst);
            topic_response.partition_responses.push(partition_response);
        }
        response.responses.push(topic_response);
    }
    response
}
