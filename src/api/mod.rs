use std::sync::Arc;

use actix_web::dev::Server;
use actix_web::{web, App, HttpResponse, HttpServer, Responder, ResponseError};
use prometheus::{Encoder, Registry, TextEncoder};

use crate::cache::OrderCache;
use crate::db::{OrderStore, StoreError};
use crate::metrics::Metrics;
use crate::models::Order;

// ============================================================================
// Read API - cache-aside point lookups
// ============================================================================
//
// GET /order/{order_uid} answers from the cache when possible, falls back to
// the store on a miss, backfills the cache with what it found, and never
// writes to the store. /health and /metrics ride on the same server.
//
// ============================================================================

/// Reject obviously invalid or abusive identifiers before touching the
/// cache or store.
const MAX_ORDER_UID_LEN: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("order_uid must be non-empty and at most {MAX_ORDER_UID_LEN} characters")]
    InvalidId,

    #[error("order not found")]
    NotFound,

    #[error("internal error")]
    Internal(#[source] StoreError),
}

impl ResponseError for QueryError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            QueryError::InvalidId => StatusCode::BAD_REQUEST,
            QueryError::NotFound => StatusCode::NOT_FOUND,
            QueryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "error": self.to_string() }))
    }
}

/// Cache-aside lookup shared by every request handler.
pub struct QueryService {
    cache: Arc<OrderCache>,
    store: Arc<dyn OrderStore>,
    metrics: Arc<Metrics>,
}

impl QueryService {
    pub fn new(cache: Arc<OrderCache>, store: Arc<dyn OrderStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            cache,
            store,
            metrics,
        }
    }

    pub async fn get_order(&self, order_uid: &str) -> Result<Order, QueryError> {
        if order_uid.is_empty() || order_uid.len() > MAX_ORDER_UID_LEN {
            tracing::warn!(length = order_uid.len(), "Rejected invalid order_uid");
            return Err(QueryError::InvalidId);
        }

        if let Some(order) = self.cache.get(order_uid) {
            tracing::debug!(order_uid = %order_uid, "Cache hit");
            self.metrics.cache_hits.inc();
            return Ok(order);
        }

        tracing::debug!(order_uid = %order_uid, "Cache miss, querying store");
        self.metrics.cache_misses.inc();

        match self.store.get_by_uid(order_uid).await {
            Ok(order) => {
                // Backfill so the next lookup is served from memory.
                self.cache.set(order.clone());
                Ok(order)
            }
            Err(StoreError::NotFound) => Err(QueryError::NotFound),
            Err(e) => {
                tracing::error!(order_uid = %order_uid, error = %e, "Store lookup failed");
                Err(QueryError::Internal(e))
            }
        }
    }
}

async fn get_order_handler(
    path: web::Path<String>,
    service: web::Data<QueryService>,
) -> Result<HttpResponse, QueryError> {
    let order = service.get_order(&path).await?;
    Ok(HttpResponse::Ok().json(order))
}

async fn health_handler() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "orderstream"
    }))
}

async fn metrics_handler(registry: web::Data<Arc<Registry>>) -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(buffer)
}

/// Build the HTTP server. In-flight requests get a bounded grace period on
/// shutdown before the workers are stopped.
pub fn build_server(
    addr: &str,
    service: web::Data<QueryService>,
    registry: Arc<Registry>,
) -> std::io::Result<Server> {
    tracing::info!(addr = %addr, "Starting HTTP server");

    let server = HttpServer::new(move || {
        App::new()
            .app_data(service.clone())
            .app_data(web::Data::new(registry.clone()))
            .route("/order/{order_uid}", web::get().to(get_order_handler))
            .route("/health", web::get().to(health_handler))
            .route("/metrics", web::get().to(metrics_handler))
    })
    .bind(addr)?
    .shutdown_timeout(5)
    .run();

    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_fixtures::sample_order;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MockStore {
        orders: Mutex<HashMap<String, Order>>,
        unavailable: AtomicBool,
        get_calls: AtomicUsize,
        save_calls: AtomicUsize,
    }

    impl MockStore {
        fn new() -> Self {
            Self {
                orders: Mutex::new(HashMap::new()),
                unavailable: AtomicBool::new(false),
                get_calls: AtomicUsize::new(0),
                save_calls: AtomicUsize::new(0),
            }
        }

        fn with_order(order: Order) -> Self {
            let store = Self::new();
            store
                .orders
                .lock()
                .unwrap()
                .insert(order.order_uid.clone(), order);
            store
        }
    }

    #[async_trait]
    impl OrderStore for MockStore {
        async fn save(&self, _order: &Order) -> Result<(), StoreError> {
            self.save_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn get_by_uid(&self, order_uid: &str) -> Result<Order, StoreError> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            self.orders
                .lock()
                .unwrap()
                .get(order_uid)
                .cloned()
                .ok_or(StoreError::NotFound)
        }

        async fn get_all(&self) -> Result<Vec<Order>, StoreError> {
            Ok(self.orders.lock().unwrap().values().cloned().collect())
        }
    }

    fn service(store: MockStore) -> (QueryService, Arc<MockStore>, Arc<OrderCache>) {
        let store = Arc::new(store);
        let cache = Arc::new(OrderCache::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let service = QueryService::new(cache.clone(), store.clone(), metrics);
        (service, store, cache)
    }

    #[tokio::test]
    async fn empty_id_is_rejected_before_cache_and_store() {
        let (service, store, _cache) = service(MockStore::new());

        let result = service.get_order("").await;

        assert!(matches!(result, Err(QueryError::InvalidId)));
        assert_eq!(store.get_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oversized_id_is_rejected_before_cache_and_store() {
        let (service, store, _cache) = service(MockStore::new());
        let id = "x".repeat(MAX_ORDER_UID_LEN + 1);

        let result = service.get_order(&id).await;

        assert!(matches!(result, Err(QueryError::InvalidId)));
        assert_eq!(store.get_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn id_at_the_length_bound_is_accepted() {
        let (service, _store, cache) = service(MockStore::new());
        let id = "x".repeat(MAX_ORDER_UID_LEN);
        cache.set({
            let mut order = sample_order("placeholder");
            order.order_uid = id.clone();
            order
        });

        assert!(service.get_order(&id).await.is_ok());
    }

    #[tokio::test]
    async fn cache_hit_short_circuits_the_store() {
        let (service, store, cache) = service(MockStore::new());
        let order = sample_order("abc123");
        cache.set(order.clone());

        let found = service.get_order("abc123").await.unwrap();

        assert_eq!(found, order);
        assert_eq!(store.get_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn miss_falls_back_to_store_and_backfills_the_cache() {
        let order = sample_order("abc123");
        let (service, store, cache) = service(MockStore::with_order(order.clone()));

        // First lookup goes to the store and backfills.
        let found = service.get_order("abc123").await.unwrap();
        assert_eq!(found, order);
        assert_eq!(store.get_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("abc123"), Some(order));

        // Second lookup is served from the cache, no further store call.
        service.get_order("abc123").await.unwrap();
        assert_eq!(store.get_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_id_maps_to_not_found() {
        let (service, _store, _cache) = service(MockStore::new());
        assert!(matches!(
            service.get_order("missing").await,
            Err(QueryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn store_failure_maps_to_internal_error() {
        let (service, store, _cache) = service(MockStore::new());
        store.unavailable.store(true, Ordering::SeqCst);

        assert!(matches!(
            service.get_order("abc123").await,
            Err(QueryError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn read_path_never_writes_to_the_store() {
        let order = sample_order("abc123");
        let (service, store, _cache) = service(MockStore::with_order(order));

        service.get_order("abc123").await.unwrap();
        service.get_order("missing").await.unwrap_err();
        service.get_order("").await.unwrap_err();

        assert_eq!(store.save_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn query_errors_map_to_expected_status_codes() {
        use actix_web::http::StatusCode;
        assert_eq!(QueryError::InvalidId.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(QueryError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            QueryError::Internal(StoreError::NotFound).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
