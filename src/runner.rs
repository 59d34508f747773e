//! Consume-process-produce stream runner.
//!
//! An outer bootstrap loop owns the broker session: it creates a consumer,
//! waits for the consumed topic to show up in metadata, subscribes, then
//! creates the producer. Transport failures back off and rebuild the
//! session; they never end the process. The inner loop consumes one event
//! per iteration and publishes retained messages. Delivery is
//! at-least-once: duplicates after a reconnect are acceptable, losses are
//! not.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use metrics::counter;
use tracing::{debug, error, info, trace, warn};

use crate::broker::{BrokerConsumer, BrokerProducer, BrokerTransport, BrokerMessage, ConsumerEvent};
use crate::config::PpmConfig;
use crate::handler::{BsmHandler, Disposition};
use crate::quadtree::Quadtree;
use crate::shutdown::ShutdownFlags;

/// Pause between bootstrap retries
const BOOTSTRAP_BACKOFF: Duration = Duration::from_millis(1500);

/// Metadata request timeout
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Monotonic counters, single-writer from the runner thread. The metrics
/// facade mirrors every increment so an exporter can be attached without
/// touching the hot path.
#[derive(Debug, Clone, Default)]
pub struct PpmCounters {
    pub recv_count: u64,
    pub recv_bytes: u64,
    pub send_count: u64,
    pub send_bytes: u64,
    pub filt_count: u64,
    pub filt_bytes: u64,
    pub produce_errors: u64,
}

impl PpmCounters {
    fn record_recv(&mut self, len: usize) {
        self.recv_count += 1;
        self.recv_bytes += len as u64;
        counter!("ppm.bsm.recv_total").increment(1);
        counter!("ppm.bsm.recv_bytes_total").increment(len as u64);
    }

    fn record_send(&mut self, len: usize) {
        self.send_count += 1;
        self.send_bytes += len as u64;
        counter!("ppm.bsm.send_total").increment(1);
        counter!("ppm.bsm.send_bytes_total").increment(len as u64);
    }

    fn record_filt(&mut self, len: usize) {
        self.filt_count += 1;
        self.filt_bytes += len as u64;
        counter!("ppm.bsm.filtered_total").increment(1);
        counter!("ppm.bsm.filtered_bytes_total").increment(len as u64);
    }

    fn record_produce_error(&mut self) {
        self.produce_errors += 1;
        counter!("ppm.produce.errors_total").increment(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Booting,
    Consuming,
    Stopped,
}

pub struct StreamRunner {
    config: PpmConfig,
    transport: Arc<dyn BrokerTransport>,
    geofence: Arc<Quadtree>,
    flags: Arc<ShutdownFlags>,
    counters: PpmCounters,
    state: RunnerState,
    eof_count: usize,
    partition_count: usize,
}

impl StreamRunner {
    pub fn new(
        config: PpmConfig,
        transport: Arc<dyn BrokerTransport>,
        geofence: Arc<Quadtree>,
        flags: Arc<ShutdownFlags>,
    ) -> Self {
        Self {
            config,
            transport,
            geofence,
            flags,
            counters: PpmCounters::default(),
            state: RunnerState::Booting,
            eof_count: 0,
            partition_count: 1,
        }
    }

    pub fn counters(&self) -> &PpmCounters {
        &self.counters
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Run until a shutdown signal (or EOF-all with the exit flag) stops
    /// the module. Always emits the summary counters before returning.
    pub async fn run(&mut self) -> Result<()> {
        while self.flags.bootstrap() {
            self.set_state(RunnerState::Booting);
            self.flags.reset_available();
            self.eof_count = 0;

            let mut consumer = match self.transport.create_consumer().await {
                Ok(consumer) => consumer,
                Err(e) => {
                    error!("failed to create consumer: {}", e);
                    tokio::time::sleep(BOOTSTRAP_BACKOFF).await;
                    continue;
                }
            };

            if !self.await_topic(consumer.as_ref()).await {
                continue;
            }

            if let Err(e) = consumer.subscribe(&self.config.consumed_topic) {
                error!("failed to subscribe: {}", e);
                tokio::time::sleep(BOOTSTRAP_BACKOFF).await;
                continue;
            }
            info!(
                "consumer subscribed to topic {}",
                self.config.consumed_topic
            );
            self.log_positions(consumer.as_ref());

            let producer = match self.transport.create_producer().await {
                Ok(producer) => producer,
                Err(e) => {
                    error!("failed to create producer: {}", e);
                    tokio::time::sleep(BOOTSTRAP_BACKOFF).await;
                    continue;
                }
            };
            info!(
                "producer ready for topic {}",
                self.config.published_topic
            );

            // one handler per session, reused across messages
            let mut handler = BsmHandler::new(
                self.geofence.clone(),
                self.config.filter_policy(),
                self.config.redact_fields.clone(),
            );

            self.set_state(RunnerState::Consuming);
            while self.flags.bsms_available() {
                let event = consumer.consume(self.config.consumer_timeout).await;
                self.handle_event(event, &mut handler, producer.as_ref());
            }
        }

        self.set_state(RunnerState::Stopped);
        self.log_summary();
        Ok(())
    }

    /// Poll metadata until the consumed topic appears. Returns false when
    /// the flags were cleared while waiting.
    async fn await_topic(&mut self, consumer: &dyn BrokerConsumer) -> bool {
        while self.flags.bsms_available() && self.flags.bootstrap() {
            match consumer.metadata(METADATA_TIMEOUT).await {
                Ok(metadata) => {
                    if let Some(topic) = metadata.topic(&self.config.consumed_topic) {
                        self.partition_count = topic.partitions.max(1);
                        info!(
                            "topic {} found in broker metadata with {} partition(s)",
                            topic.name, self.partition_count
                        );
                        return true;
                    }
                    warn!(
                        "metadata does not contain topic {} yet",
                        self.config.consumed_topic
                    );
                }
                Err(e) => {
                    error!("cannot retrieve consumer metadata: {}", e);
                }
            }
            tokio::time::sleep(BOOTSTRAP_BACKOFF).await;
        }
        false
    }

    fn log_positions(&self, consumer: &dyn BrokerConsumer) {
        match consumer.position() {
            Ok(positions) => {
                for p in positions {
                    info!(
                        topic = %p.topic,
                        partition = p.partition,
                        offset = ?p.offset,
                        "consumer position"
                    );
                }
            }
            Err(e) => debug!("consumer position unavailable: {}", e),
        }
    }

    fn handle_event(
        &mut self,
        event: ConsumerEvent,
        handler: &mut BsmHandler,
        producer: &dyn BrokerProducer,
    ) {
        match event {
            ConsumerEvent::Message(message) => self.handle_message(message, handler, producer),
            ConsumerEvent::Timeout => {
                debug!("waiting for more BSMs from the producer");
            }
            ConsumerEvent::PartitionEof { partition } => {
                info!(partition, "partition end of file reached");
                if self.config.exit_on_eof {
                    self.eof_count += 1;
                    if self.eof_count >= self.partition_count {
                        info!(
                            "EOF reached for all {} partition(s), stopping",
                            self.partition_count
                        );
                        self.flags.shutdown();
                    }
                }
            }
            ConsumerEvent::UnknownTopic => {
                error!(
                    "cannot consume, topic {} is unknown to the broker",
                    self.config.consumed_topic
                );
                self.flags.halt_consume();
            }
            ConsumerEvent::UnknownPartition => {
                error!(
                    topic = %self.config.consumed_topic,
                    partition = ?self.config.partition,
                    "cannot consume from an unknown partition"
                );
                self.flags.halt_consume();
            }
            ConsumerEvent::Error(e) => {
                error!("cannot consume due to an error: {}", e);
                self.flags.halt_consume();
            }
        }
    }

    fn handle_message(
        &mut self,
        message: BrokerMessage,
        handler: &mut BsmHandler,
        producer: &dyn BrokerProducer,
    ) {
        let recv_len = message.payload.len();
        self.counters.record_recv(recv_len);
        trace!(offset = message.offset, "read message");

        match handler.process(&message.payload) {
            Disposition::Retain { payload, bsm } => {
                info!("BSM [RETAINED]: {}", bsm.log_string());
                match producer.produce(
                    &self.config.published_topic,
                    self.config.partition,
                    &payload,
                    None,
                ) {
                    Ok(()) => {
                        self.counters.record_send(payload.len());
                        trace!("produced BSM successfully");
                    }
                    Err(e) => {
                        // drop the message and keep the loop alive; the
                        // consumer still advances
                        error!("failed to produce retained BSM: {}", e);
                        self.counters.record_produce_error();
                    }
                }
            }
            Disposition::Suppress { reason, bsm } => {
                match &bsm {
                    Some(bsm) => info!("BSM [SUPPRESSED-{}]: {}", reason, bsm.log_string()),
                    None => info!("BSM [SUPPRESSED-{}]", reason),
                }
                self.counters.record_filt(recv_len);
            }
        }
    }

    fn set_state(&mut self, next: RunnerState) {
        if self.state != next {
            debug!("runner state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn log_summary(&self) {
        info!("PPM operations complete; shutting down");
        info!(
            "PPM consumed  : {} BSMs and {} bytes",
            self.counters.recv_count, self.counters.recv_bytes
        );
        info!(
            "PPM published : {} BSMs and {} bytes",
            self.counters.send_count, self.counters.send_bytes
        );
        info!(
            "PPM suppressed: {} BSMs and {} bytes",
            self.counters.filt_count, self.counters.filt_bytes
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryTransport, StartOffset};
    use crate::geo::{Bounds, Entity, Point};
    use crate::policy::FilterMode;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn test_config() -> PpmConfig {
        PpmConfig {
            consumed_topic: "raw".to_string(),
            published_topic: "filtered".to_string(),
            partition: None,
            group: None,
            brokers: "localhost".to_string(),
            offset: StartOffset::Beginning,
            exit_on_eof: true,
            debug_facets: None,
            consumer_timeout: Duration::from_millis(500),
            mapfile: PathBuf::from("unused.csv"),
            geofence_bounds: Bounds::new(Point::new(35.0, -85.0), Point::new(37.0, -83.0)),
            quadtree_max_depth: 6,
            quadtree_leaf_capacity: 4,
            mode: FilterMode::Inclusive,
            min_speed_mps: 2.235,
            max_speed_mps: 44.7,
            redact_fields: Vec::new(),
            client_overrides: BTreeMap::new(),
        }
    }

    fn test_geofence() -> Arc<Quadtree> {
        let mut tree = Quadtree::new(Bounds::new(
            Point::new(35.0, -85.0),
            Point::new(37.0, -83.0),
        ));
        tree.insert(Entity::Circle {
            id: "cbd".to_string(),
            center: Point::new(35.9606, -83.9207),
            radius_m: 1000.0,
        });
        Arc::new(tree)
    }

    fn bsm(lat: f64, lon: f64, speed_raw: f64) -> Vec<u8> {
        serde_json::json!({
            "coreData": {
                "id": "BEEF1234",
                "secMark": 100,
                "position": { "latitude": lat, "longitude": lon },
                "speed": speed_raw,
            }
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_conservation() {
        let transport = MemoryTransport::new();
        transport.add_topic("raw", 1);
        // first retained message hits an injected produce failure
        transport.fail_next_produces(1);
        transport.push_payload(&bsm(35.9610, -83.9200, 500.0)); // retained, produce fails
        transport.push_payload(&bsm(35.9610, -83.9200, 500.0)); // retained
        transport.push_payload(&bsm(36.5, -84.5, 500.0)); // outside geofence
        transport.push_payload(b"{broken"); // parse error
        transport.push_event(ConsumerEvent::PartitionEof { partition: 0 });

        let flags = ShutdownFlags::new();
        let mut runner = StreamRunner::new(
            test_config(),
            Arc::new(transport.clone()),
            test_geofence(),
            flags,
        );
        runner.run().await.unwrap();

        let c = runner.counters();
        assert_eq!(c.recv_count, 4);
        assert_eq!(c.send_count, 1);
        assert_eq!(c.filt_count, 2);
        assert_eq!(c.produce_errors, 1);
        assert_eq!(c.send_count + c.filt_count + c.produce_errors, c.recv_count);
        assert!(c.recv_bytes >= c.filt_bytes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eof_stops_runner_and_counts() {
        let transport = MemoryTransport::new();
        transport.add_topic("raw", 1);
        for _ in 0..3 {
            transport.push_payload(&bsm(35.9610, -83.9200, 500.0));
        }
        transport.push_event(ConsumerEvent::PartitionEof { partition: 0 });

        let flags = ShutdownFlags::new();
        let mut runner = StreamRunner::new(
            test_config(),
            Arc::new(transport.clone()),
            test_geofence(),
            flags.clone(),
        );
        runner.run().await.unwrap();

        assert_eq!(runner.counters().send_count, 3);
        assert_eq!(runner.counters().filt_count, 0);
        assert_eq!(runner.state(), RunnerState::Stopped);
        assert_eq!(transport.published().len(), 3);
        assert!(!flags.bootstrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_produce_failure_keeps_loop_alive() {
        let transport = MemoryTransport::new();
        transport.add_topic("raw", 1);
        transport.fail_next_produces(1);
        transport.push_payload(&bsm(35.9610, -83.9200, 500.0)); // produce fails
        transport.push_payload(&bsm(35.9610, -83.9200, 500.0)); // produce succeeds
        transport.push_event(ConsumerEvent::PartitionEof { partition: 0 });

        let flags = ShutdownFlags::new();
        let mut runner = StreamRunner::new(
            test_config(),
            Arc::new(transport.clone()),
            test_geofence(),
            flags,
        );
        runner.run().await.unwrap();

        let c = runner.counters();
        assert_eq!(c.recv_count, 2);
        assert_eq!(c.send_count, 1);
        assert_eq!(c.produce_errors, 1);
        assert_eq!(transport.published().len(), 1);
    }
}
