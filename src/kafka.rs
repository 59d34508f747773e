//! Kafka implementation of the broker transport.
//!
//! Built on rdkafka: a `StreamConsumer` with `enable.partition.eof` so the
//! runner sees end-of-partition markers, and a `FutureProducer` whose
//! enqueue acceptance maps to the transport's `produce` contract; delivery
//! happens on the client's background thread and failures are logged by a
//! spawned watcher.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use tracing::{debug, error, trace, warn};

use crate::broker::{
    BrokerConsumer, BrokerMessage, BrokerProducer, BrokerTransport, ClusterMetadata,
    ConsumerEvent, StartOffset, TopicInfo, TopicPosition, TransportError,
};
use crate::config::PpmConfig;

/// Consumer group used when the operator does not supply one. librdkafka
/// refuses to subscribe without a group id.
const DEFAULT_GROUP_ID: &str = "ppm";

pub struct KafkaTransport {
    consumer_config: ClientConfig,
    producer_config: ClientConfig,
    partition: Option<i32>,
    offset: StartOffset,
}

impl KafkaTransport {
    pub fn new(config: &PpmConfig) -> Self {
        let mut consumer_config = ClientConfig::new();
        consumer_config
            .set("metadata.broker.list", &config.brokers)
            .set(
                "group.id",
                config.group.as_deref().unwrap_or(DEFAULT_GROUP_ID),
            )
            .set("enable.partition.eof", "true");

        match config.offset {
            StartOffset::Beginning => {
                consumer_config.set("auto.offset.reset", "earliest");
            }
            StartOffset::End => {
                consumer_config.set("auto.offset.reset", "latest");
            }
            // committed offsets take precedence on their own; absolute
            // offsets are applied at subscribe time
            StartOffset::Stored | StartOffset::Absolute(_) => {}
        }

        let mut producer_config = ClientConfig::new();
        producer_config.set("metadata.broker.list", &config.brokers);

        if let Some(facets) = &config.debug_facets {
            consumer_config.set("debug", facets);
            producer_config.set("debug", facets);
        }

        // everything the resolver did not recognize goes to the client
        // verbatim
        for (key, value) in &config.client_overrides {
            consumer_config.set(key, value);
            producer_config.set(key, value);
        }

        Self {
            consumer_config,
            producer_config,
            partition: config.partition,
            offset: config.offset,
        }
    }
}

#[async_trait]
impl BrokerTransport for KafkaTransport {
    async fn create_consumer(&self) -> Result<Box<dyn BrokerConsumer>, TransportError> {
        let inner: StreamConsumer = self
            .consumer_config
            .create()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!("kafka consumer created");
        Ok(Box::new(KafkaConsumer {
            inner,
            partition: self.partition,
            offset: self.offset,
        }))
    }

    async fn create_producer(&self) -> Result<Box<dyn BrokerProducer>, TransportError> {
        let inner: FutureProducer = self
            .producer_config
            .create()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!("kafka producer created");
        Ok(Box::new(KafkaProducer { inner }))
    }
}

struct KafkaConsumer {
    inner: StreamConsumer,
    partition: Option<i32>,
    offset: StartOffset,
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn metadata(&self, timeout: Duration) -> Result<ClusterMetadata, TransportError> {
        let md = self
            .inner
            .client()
            .fetch_metadata(None, Timeout::After(timeout))
            .map_err(|e| TransportError::Metadata(e.to_string()))?;
        Ok(ClusterMetadata {
            topics: md
                .topics()
                .iter()
                .map(|t| TopicInfo {
                    name: t.name().to_string(),
                    partitions: t.partitions().len(),
                })
                .collect(),
        })
    }

    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        // An explicit byte offset needs a direct assignment; everything
        // else goes through group subscription.
        if let (StartOffset::Absolute(offset), Some(partition)) = (self.offset, self.partition) {
            let mut assignment = TopicPartitionList::new();
            assignment
                .add_partition_offset(topic, partition, Offset::Offset(offset))
                .map_err(|e| TransportError::Subscribe {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })?;
            return self
                .inner
                .assign(&assignment)
                .map_err(|e| TransportError::Subscribe {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                });
        }
        if matches!(self.offset, StartOffset::Absolute(_)) {
            warn!("explicit offset configured without a partition; using group subscription");
        }

        self.inner
            .subscribe(&[topic])
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn position(&self) -> Result<Vec<TopicPosition>, TransportError> {
        let positions = self
            .inner
            .position()
            .map_err(|e| TransportError::Consume(e.to_string()))?;
        Ok(positions
            .elements()
            .iter()
            .map(|el| TopicPosition {
                topic: el.topic().to_string(),
                partition: el.partition(),
                offset: match el.offset() {
                    Offset::Offset(n) => Some(n),
                    _ => None,
                },
            })
            .collect())
    }

    async fn consume(&mut self, timeout: Duration) -> ConsumerEvent {
        match tokio::time::timeout(timeout, self.inner.recv()).await {
            Err(_) => ConsumerEvent::Timeout,
            Ok(Ok(message)) => {
                let timestamp_ms = message.timestamp().to_millis();
                if let Some(ts) = timestamp_ms
                    && let Some(when) = DateTime::<Utc>::from_timestamp_millis(ts)
                {
                    trace!("message create time: {}", when.to_rfc3339());
                }
                ConsumerEvent::Message(BrokerMessage {
                    payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    key: message.key().map(<[u8]>::to_vec),
                    partition: message.partition(),
                    offset: message.offset(),
                    timestamp_ms,
                })
            }
            Ok(Err(KafkaError::PartitionEOF(partition))) => {
                ConsumerEvent::PartitionEof { partition }
            }
            Ok(Err(KafkaError::MessageConsumption(code))) => match code {
                RDKafkaErrorCode::UnknownTopic
                | RDKafkaErrorCode::UnknownTopicOrPartition => ConsumerEvent::UnknownTopic,
                RDKafkaErrorCode::UnknownPartition => ConsumerEvent::UnknownPartition,
                other => ConsumerEvent::Error(TransportError::Consume(other.to_string())),
            },
            Ok(Err(e)) => ConsumerEvent::Error(TransportError::Consume(e.to_string())),
        }
    }
}

struct KafkaProducer {
    inner: FutureProducer,
}

impl BrokerProducer for KafkaProducer {
    fn produce(
        &self,
        topic: &str,
        partition: Option<i32>,
        payload: &[u8],
        key: Option<&[u8]>,
    ) -> Result<(), TransportError> {
        let mut record = FutureRecord::<[u8], [u8]>::to(topic).payload(payload);
        if let Some(partition) = partition {
            record = record.partition(partition);
        }
        if let Some(key) = key {
            record = record.key(key);
        }

        match self.inner.send_result(record) {
            Ok(delivery) => {
                // the enqueue was accepted; watch the delivery in the
                // background so failures still reach the error log
                let topic = topic.to_string();
                tokio::spawn(async move {
                    match delivery.await {
                        Ok(Ok(_)) => {}
                        Ok(Err((e, _))) => {
                            error!("delivery to topic {} failed: {}", topic, e);
                        }
                        Err(_) => {
                            error!("delivery watcher for topic {} cancelled", topic);
                        }
                    }
                });
                Ok(())
            }
            Err((e, _)) => Err(TransportError::Produce {
                topic: topic.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
