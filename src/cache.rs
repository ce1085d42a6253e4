use std::collections::HashMap;
use std::sync::RwLock;

use crate::models::Order;

// ============================================================================
// In-Memory Order Cache
// ============================================================================
//
// Concurrent-safe map from order_uid to Order, shared by the Kafka consumer
// (writer) and the query path (readers, plus miss backfill). A single
// reader-writer lock guards the map: any number of concurrent readers, or
// one exclusive writer, never both.
//
// No eviction, no TTL, no capacity bound: memory grows monotonically with
// the number of distinct order_uids seen. The store remains the source of
// truth and the whole cache is rebuilt from it at process start.
//
// ============================================================================

pub struct OrderCache {
    inner: RwLock<HashMap<String, Order>>,
}

impl OrderCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Look up an order by its uid. Absence is a normal outcome, not an
    /// error. The value is cloned out so the lock is released immediately.
    pub fn get(&self, order_uid: &str) -> Option<Order> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(order_uid).cloned()
    }

    /// Unconditional upsert, last writer wins. Called from the consumer
    /// after a successful persist and from the read path on miss backfill;
    /// neither caller may rely on arrival order for the final value.
    pub fn set(&self, order: Order) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.insert(order.order_uid.clone(), order);
    }

    /// Bulk upsert used once at startup to rehydrate from the store.
    /// Existing entries with the same uid are overwritten.
    pub fn load(&self, orders: Vec<Order>) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for order in orders {
            map.insert(order.order_uid.clone(), order);
        }
    }

    pub fn len(&self) -> usize {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for OrderCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_fixtures::sample_order;
    use std::sync::Arc;

    #[test]
    fn get_on_empty_cache_misses() {
        let cache = OrderCache::new();
        assert!(cache.get("unknown").is_none());
    }

    #[test]
    fn set_then_get_hits() {
        let cache = OrderCache::new();
        let order = sample_order("abc123");
        cache.set(order.clone());
        assert_eq!(cache.get("abc123"), Some(order));
    }

    #[test]
    fn set_overwrites_existing_entry() {
        let cache = OrderCache::new();
        let mut order = sample_order("abc123");
        cache.set(order.clone());
        order.locale = "ru".to_string();
        cache.set(order.clone());
        assert_eq!(cache.get("abc123").unwrap().locale, "ru");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn warm_load_makes_every_order_retrievable() {
        let cache = OrderCache::new();
        let orders: Vec<_> = (0..5).map(|i| sample_order(&format!("uid-{i}"))).collect();
        cache.load(orders.clone());

        for order in &orders {
            assert_eq!(cache.get(&order.order_uid).as_ref(), Some(order));
        }
        assert!(cache.get("unrelated").is_none());
        assert_eq!(cache.len(), 5);
    }

    #[test]
    fn load_overwrites_entries_with_same_uid() {
        let cache = OrderCache::new();
        let mut stale = sample_order("uid-0");
        stale.locale = "stale".to_string();
        cache.set(stale);

        cache.load(vec![sample_order("uid-0")]);
        assert_eq!(cache.get("uid-0").unwrap().locale, "en");
    }

    #[test]
    fn concurrent_readers_and_writer_do_not_corrupt_the_map() {
        let cache = Arc::new(OrderCache::new());
        let mut handles = Vec::new();

        for w in 0..4 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    cache.set(sample_order(&format!("w{w}-{i}")));
                }
            }));
        }
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    let _ = cache.get(&format!("w0-{i}"));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 400);
    }
}
