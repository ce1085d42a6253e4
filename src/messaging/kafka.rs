use std::sync::Arc;
use std::time::{Duration, Instant};

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use tokio_util::sync::CancellationToken;

use crate::cache::OrderCache;
use crate::config::KafkaConfig;
use crate::db::{OrderStore, StoreError};
use crate::metrics::Metrics;
use crate::models::Order;

// ============================================================================
// Streaming Consumer - fetch / decode / persist / commit cycle
// ============================================================================
//
// Owns the durability boundary between "delivered by the broker" and "safely
// reflected in the store and cache". Offsets are committed manually, and only
// along the success, duplicate and malformed paths; a transiently failed
// record is left uncommitted so the broker redelivers it. Combined with the
// store's idempotent-write contract this gives at-least-once delivery with
// effectively-once storage.
//
// Per record: FETCH -> BUFFER/DECODE -> (incomplete: hold, no commit)
//                                     | (malformed: discard + commit)
//           -> DEDUP-CHECK -> (exists: commit, skip)
//           -> PERSIST -> (fail: no commit) -> CACHE-UPDATE -> COMMIT
//
// ============================================================================

/// Delay after a transient fetch error, to avoid a hot error loop.
const ERROR_RETRY_DELAY: Duration = Duration::from_secs(1);

// ----------------------------------------------------------------------------
// Reassembly Buffer
// ----------------------------------------------------------------------------

/// Result of pushing one record's bytes into the reassembly buffer.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// A complete, valid document was decoded; the accumulator is cleared.
    Complete(Box<Order>),
    /// The accumulated bytes are a truncated document; more records are
    /// needed. The triggering record must not be committed.
    Incomplete,
    /// The accumulated bytes can never become a valid document. The
    /// accumulator is discarded and the record should be committed so the
    /// stream does not stall on a poison message.
    Malformed { reason: String, payload: String },
}

/// Accumulates raw record bytes until they decode as one order document.
///
/// A producer is expected to send one complete document per record; the
/// buffer exists to tolerate a document split across consecutive records.
/// It is not partition- or key-aware: at most one in-flight partial document
/// per consumer.
pub struct ReassemblyBuffer {
    buf: Vec<u8>,
    reassemble: bool,
}

impl ReassemblyBuffer {
    pub fn new(reassemble: bool) -> Self {
        Self {
            buf: Vec::new(),
            reassemble,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> DecodeOutcome {
        self.buf.extend_from_slice(bytes);

        match serde_json::from_slice::<Order>(&self.buf) {
            Ok(order) => match order.validate() {
                Ok(()) => {
                    self.buf.clear();
                    DecodeOutcome::Complete(Box::new(order))
                }
                Err(e) => self.discard(e.to_string()),
            },
            // EOF from the JSON parser means the structure is unterminated:
            // wait for the rest of the document on the next record.
            Err(e) if e.is_eof() && self.reassemble => DecodeOutcome::Incomplete,
            Err(e) => self.discard(e.to_string()),
        }
    }

    fn discard(&mut self, reason: String) -> DecodeOutcome {
        let payload = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        DecodeOutcome::Malformed { reason, payload }
    }
}

// ----------------------------------------------------------------------------
// Ingestor - the broker-independent half of the consumer
// ----------------------------------------------------------------------------

/// What happened to one record, and whether its offset may be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Decoded, persisted, cache updated.
    Stored(String),
    /// Already present in the store (dedup check or lost insert race).
    Duplicate(String),
    /// Permanently undecodable; discarded.
    Malformed,
    /// Truncated document held in the reassembly buffer.
    Buffering,
    /// Store unavailable; the record must be redelivered.
    TransientFailure,
}

impl IngestOutcome {
    /// The offset is committed iff the record can never need redelivery.
    pub fn should_commit(&self) -> bool {
        matches!(
            self,
            IngestOutcome::Stored(_) | IngestOutcome::Duplicate(_) | IngestOutcome::Malformed
        )
    }
}

/// Drives buffer, decode, dedup, persist and cache-update for raw record
/// payloads. Split out from the Kafka plumbing so the whole commit decision
/// is testable without a broker.
pub struct Ingestor {
    store: Arc<dyn OrderStore>,
    cache: Arc<OrderCache>,
    metrics: Arc<Metrics>,
    buffer: ReassemblyBuffer,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn OrderStore>,
        cache: Arc<OrderCache>,
        metrics: Arc<Metrics>,
        reassemble: bool,
    ) -> Self {
        Self {
            store,
            cache,
            metrics,
            buffer: ReassemblyBuffer::new(reassemble),
        }
    }

    pub async fn ingest(&mut self, payload: &[u8]) -> IngestOutcome {
        self.metrics.messages_received.inc();

        let order = match self.buffer.push(payload) {
            DecodeOutcome::Complete(order) => order,
            DecodeOutcome::Incomplete => {
                tracing::trace!("Document incomplete, buffering until next record");
                return IngestOutcome::Buffering;
            }
            DecodeOutcome::Malformed { reason, payload } => {
                tracing::error!(
                    reason = %reason,
                    payload = %payload,
                    "Discarding malformed document"
                );
                self.metrics.decode_failures.inc();
                return IngestOutcome::Malformed;
            }
        };

        self.persist(&order).await
    }

    async fn persist(&self, order: &Order) -> IngestOutcome {
        let uid = order.order_uid.clone();

        match self.store.get_by_uid(&uid).await {
            Ok(_) => {
                tracing::warn!(order_uid = %uid, "Order already in store, skipping");
                self.metrics.duplicate_orders.inc();
                return IngestOutcome::Duplicate(uid);
            }
            Err(StoreError::NotFound) => {}
            Err(e) => {
                tracing::error!(order_uid = %uid, error = %e, "Dedup check failed");
                return IngestOutcome::TransientFailure;
            }
        }

        let started = Instant::now();
        match self.store.save(order).await {
            Ok(()) => {
                self.metrics
                    .persist_duration
                    .observe(started.elapsed().as_secs_f64());
                // Cache is updated only after the persist succeeded, and the
                // cache lock is never held across the store call.
                self.cache.set(order.clone());
                self.metrics.orders_persisted.inc();
                tracing::info!(
                    order_uid = %uid,
                    track_number = %order.track_number,
                    "Order persisted"
                );
                IngestOutcome::Stored(uid)
            }
            Err(StoreError::Duplicate) => {
                // Lost the existence-check/insert race to a concurrent
                // writer; the store's uniqueness constraint makes this safe.
                tracing::warn!(order_uid = %uid, "Insert hit unique constraint, treating as duplicate");
                self.metrics.duplicate_orders.inc();
                IngestOutcome::Duplicate(uid)
            }
            Err(e) => {
                tracing::error!(order_uid = %uid, error = %e, "Failed to persist order");
                IngestOutcome::TransientFailure
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Kafka consumer loop
// ----------------------------------------------------------------------------

pub struct OrderConsumer {
    consumer: StreamConsumer,
    ingestor: Ingestor,
    metrics: Arc<Metrics>,
    topic: String,
}

impl OrderConsumer {
    pub fn new(
        config: &KafkaConfig,
        store: Arc<dyn OrderStore>,
        cache: Arc<OrderCache>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;

        consumer.subscribe(&[config.topic.as_str()])?;

        Ok(Self {
            consumer,
            ingestor: Ingestor::new(store, cache, metrics.clone(), config.reassembly),
            metrics,
            topic: config.topic.clone(),
        })
    }

    /// Run until the token is cancelled. Processing is strictly sequential:
    /// one in-flight document at a time, commit strictly after the outcome
    /// is known. Per-message failures never terminate the loop.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(topic = %self.topic, "Kafka consumer started");

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown signal received, stopping consumer");
                    break;
                }
                result = self.consumer.recv() => match result {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::error!(error = %e, "Kafka fetch error");
                        self.metrics.consumer_errors.inc();
                        tokio::time::sleep(ERROR_RETRY_DELAY).await;
                        continue;
                    }
                }
            };

            let payload = message.payload().unwrap_or_default();
            tracing::debug!(
                offset = message.offset(),
                partition = message.partition(),
                len = payload.len(),
                "Received record"
            );

            let outcome = self.ingestor.ingest(payload).await;

            if outcome.should_commit() {
                if let Err(e) = self.consumer.commit_message(&message, CommitMode::Sync) {
                    tracing::error!(
                        offset = message.offset(),
                        error = %e,
                        "Failed to commit offset"
                    );
                }
            }
        }

        tracing::info!("Kafka consumer stopped");
    }
}
