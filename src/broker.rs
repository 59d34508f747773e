//! Broker transport contract.
//!
//! The stream runner only sees these traits; the production implementation
//! lives in [`crate::kafka`] and an in-memory implementation below makes
//! the end-to-end paths reproducible without a real broker.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broker connection failed: {0}")]
    Connect(String),
    #[error("metadata request failed: {0}")]
    Metadata(String),
    #[error("subscribe to topic {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("produce to topic {topic} rejected: {reason}")]
    Produce { topic: String, reason: String },
    #[error("consume failed: {0}")]
    Consume(String),
}

/// A consumed record
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub payload: Vec<u8>,
    pub key: Option<Vec<u8>>,
    pub partition: i32,
    pub offset: i64,
    /// Broker-assigned creation time, milliseconds since the epoch
    pub timestamp_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct TopicInfo {
    pub name: String,
    pub partitions: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterMetadata {
    pub topics: Vec<TopicInfo>,
}

impl ClusterMetadata {
    pub fn topic(&self, name: &str) -> Option<&TopicInfo> {
        self.topics.iter().find(|t| t.name == name)
    }
}

/// Current consumer position in one partition
#[derive(Debug, Clone)]
pub struct TopicPosition {
    pub topic: String,
    pub partition: i32,
    /// None until the broker has assigned an offset
    pub offset: Option<i64>,
}

/// Everything one `consume` call can yield
#[derive(Debug)]
pub enum ConsumerEvent {
    Message(BrokerMessage),
    Timeout,
    PartitionEof { partition: i32 },
    UnknownTopic,
    UnknownPartition,
    Error(TransportError),
}

/// Where to start reading a partition on first subscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    Beginning,
    End,
    Stored,
    Absolute(i64),
}

impl FromStr for StartOffset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "beginning" => Ok(StartOffset::Beginning),
            "end" => Ok(StartOffset::End),
            "stored" => Ok(StartOffset::Stored),
            other => other
                .parse::<i64>()
                .map(StartOffset::Absolute)
                .map_err(|_| format!("invalid offset \"{}\"", other)),
        }
    }
}

#[async_trait]
pub trait BrokerConsumer: Send {
    /// Fetch cluster metadata, blocking up to `timeout`
    async fn metadata(&self, timeout: Duration) -> Result<ClusterMetadata, TransportError>;

    fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    fn position(&self) -> Result<Vec<TopicPosition>, TransportError>;

    /// Wait up to `timeout` for the next event
    async fn consume(&mut self, timeout: Duration) -> ConsumerEvent;
}

pub trait BrokerProducer: Send {
    /// Hand a payload to the client library. Returning `Ok` means the
    /// library accepted the message for delivery, not that it was
    /// delivered; delivery is asynchronous.
    fn produce(
        &self,
        topic: &str,
        partition: Option<i32>,
        payload: &[u8],
        key: Option<&[u8]>,
    ) -> Result<(), TransportError>;
}

/// Factory for consumer/producer pairs. The runner calls this once per
/// bootstrap generation.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn create_consumer(&self) -> Result<Box<dyn BrokerConsumer>, TransportError>;
    async fn create_producer(&self) -> Result<Box<dyn BrokerProducer>, TransportError>;
}

// ============================================================================
// In-memory transport
// ============================================================================

/// A produced record captured by the in-memory transport
#[derive(Debug, Clone)]
pub struct ProducedRecord {
    pub topic: String,
    pub partition: Option<i32>,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct MemoryState {
    topics: HashMap<String, usize>,
    script: VecDeque<ConsumerEvent>,
    published: Vec<ProducedRecord>,
}

/// Scripted in-memory broker. Consumer events are drained from a shared
/// script (so a reconnecting consumer resumes where the previous one
/// stopped), produced records are captured for assertions, and bootstrap
/// and produce failures can be injected.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
    next_offset: Arc<AtomicI64>,
    consumer_faults: Arc<AtomicUsize>,
    produce_faults: Arc<AtomicUsize>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_topic(&self, name: &str, partitions: usize) {
        self.state
            .lock()
            .unwrap()
            .topics
            .insert(name.to_string(), partitions);
    }

    /// Append a message to the consumer script
    pub fn push_payload(&self, payload: &[u8]) {
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        self.push_event(ConsumerEvent::Message(BrokerMessage {
            payload: payload.to_vec(),
            key: None,
            partition: 0,
            offset,
            timestamp_ms: None,
        }));
    }

    pub fn push_event(&self, event: ConsumerEvent) {
        self.state.lock().unwrap().script.push_back(event);
    }

    /// Make the next `n` create_consumer calls fail
    pub fn fail_next_consumers(&self, n: usize) {
        self.consumer_faults.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` produce calls fail
    pub fn fail_next_produces(&self, n: usize) {
        self.produce_faults.store(n, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<ProducedRecord> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn remaining_events(&self) -> usize {
        self.state.lock().unwrap().script.len()
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    async fn create_consumer(&self) -> Result<Box<dyn BrokerConsumer>, TransportError> {
        if Self::take_fault(&self.consumer_faults) {
            return Err(TransportError::Connect(
                "scripted consumer failure".to_string(),
            ));
        }
        Ok(Box::new(MemoryConsumer {
            transport: self.clone(),
            subscribed: Mutex::new(None),
        }))
    }

    async fn create_producer(&self) -> Result<Box<dyn BrokerProducer>, TransportError> {
        Ok(Box::new(MemoryProducer {
            transport: self.clone(),
        }))
    }
}

struct MemoryConsumer {
    transport: MemoryTransport,
    subscribed: Mutex<Option<String>>,
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn metadata(&self, _timeout: Duration) -> Result<ClusterMetadata, TransportError> {
        let state = self.transport.state.lock().unwrap();
        Ok(ClusterMetadata {
            topics: state
                .topics
                .iter()
                .map(|(name, &partitions)| TopicInfo {
                    name: name.clone(),
                    partitions,
                })
                .collect(),
        })
    }

    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let known = self.transport.state.lock().unwrap().topics.contains_key(topic);
        if !known {
            return Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "unknown topic".to_string(),
            });
        }
        *self.subscribed.lock().unwrap() = Some(topic.to_string());
        Ok(())
    }

    fn position(&self) -> Result<Vec<TopicPosition>, TransportError> {
        Ok(self
            .subscribed
            .lock()
            .unwrap()
            .iter()
            .map(|topic| TopicPosition {
                topic: topic.clone(),
                partition: 0,
                offset: None,
            })
            .collect())
    }

    async fn consume(&mut self, _timeout: Duration) -> ConsumerEvent {
        let event = self.transport.state.lock().unwrap().script.pop_front();
        match event {
            Some(event) => event,
            None => ConsumerEvent::Timeout,
        }
    }
}

struct MemoryProducer {
    transport: MemoryTransport,
}

impl BrokerProducer for MemoryProducer {
    fn produce(
        &self,
        topic: &str,
        partition: Option<i32>,
        payload: &[u8],
        _key: Option<&[u8]>,
    ) -> Result<(), TransportError> {
        if MemoryTransport::take_fault(&self.transport.produce_faults) {
            return Err(TransportError::Produce {
                topic: topic.to_string(),
                reason: "scripted produce failure".to_string(),
            });
        }
        self.transport
            .state
            .lock()
            .unwrap()
            .published
            .push(ProducedRecord {
                topic: topic.to_string(),
                partition,
                payload: payload.to_vec(),
            });
        Ok(())
    }
}
