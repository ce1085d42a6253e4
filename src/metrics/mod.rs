use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Counters for the ingestion pipeline (records consumed, orders persisted,
// duplicates skipped, poison messages) and the read path (cache hits and
// misses). Exposed via /metrics on the read API server.
//
// ============================================================================

/// Central metrics registry for the entire application.
pub struct Metrics {
    registry: Registry,

    // Ingestion pipeline
    pub messages_received: IntCounter,
    pub orders_persisted: IntCounter,
    pub duplicate_orders: IntCounter,
    pub decode_failures: IntCounter,
    pub consumer_errors: IntCounter,
    pub persist_duration: Histogram,

    // Read path
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let messages_received = IntCounter::new(
            "kafka_messages_received_total",
            "Total Kafka records received by the consumer",
        )?;
        registry.register(Box::new(messages_received.clone()))?;

        let orders_persisted = IntCounter::new(
            "orders_persisted_total",
            "Total orders successfully written to the store",
        )?;
        registry.register(Box::new(orders_persisted.clone()))?;

        let duplicate_orders = IntCounter::new(
            "duplicate_orders_total",
            "Total orders skipped because they already existed in the store",
        )?;
        registry.register(Box::new(duplicate_orders.clone()))?;

        let decode_failures = IntCounter::new(
            "decode_failures_total",
            "Total permanently malformed documents discarded",
        )?;
        registry.register(Box::new(decode_failures.clone()))?;

        let consumer_errors = IntCounter::new(
            "consumer_errors_total",
            "Total transient Kafka fetch errors",
        )?;
        registry.register(Box::new(consumer_errors.clone()))?;

        let persist_duration = Histogram::with_opts(
            HistogramOpts::new("order_persist_duration_seconds", "Order persist duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(persist_duration.clone()))?;

        let cache_hits = IntCounter::new(
            "order_cache_hits_total",
            "Total read-path lookups answered from the cache",
        )?;
        registry.register(Box::new(cache_hits.clone()))?;

        let cache_misses = IntCounter::new(
            "order_cache_misses_total",
            "Total read-path lookups that fell through to the store",
        )?;
        registry.register(Box::new(cache_misses.clone()))?;

        Ok(Self {
            registry,
            messages_received,
            orders_persisted,
            duplicate_orders,
            decode_failures,
            consumer_errors,
            persist_duration,
            cache_hits,
            cache_misses,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
