// =============================================================================
// Idempotency cache — client-order-id indexed (spec §4.4)
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::persistence::keys::cloid_key;
use crate::persistence::kv::KvStore;

pub struct IdempotencyCache {
    store: Arc<dyn KvStore>,
    memory: Mutex<HashMap<String, String>>,
    warned: AtomicBool,
}

impl IdempotencyCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            memory: Mutex::new(HashMap::new()),
            warned: AtomicBool::new(false),
        }
    }

    /// Returns the previously stored server order-id, if any, checking the
    /// in-memory map first and falling back to the persisted store.
    pub async fn lookup(&self, client_order_id: &str) -> Option<String> {
        if client_order_id.is_empty() {
            return None;
        }
        if let Some(id) = self.memory.lock().get(client_order_id).cloned() {
            return Some(id);
        }
        match self.store.get(&cloid_key(client_order_id)).await {
            Ok(Some(id)) => {
                self.memory.lock().insert(client_order_id.to_string(), id.clone());
                Some(id)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, cloid = client_order_id, "idempotency lookup failed, proceeding without dedup");
                None
            }
        }
    }

    /// Records a freshly placed order's server id, both in memory and
    /// best-effort in the persisted store.
    pub async fn record(&self, client_order_id: &str, server_order_id: &str) {
        if client_order_id.is_empty() {
            return;
        }
        self.memory
            .lock()
            .insert(client_order_id.to_string(), server_order_id.to_string());
        match self.store.set(&cloid_key(client_order_id), server_order_id).await {
            Ok(()) => self.warned.store(false, Ordering::Relaxed),
            Err(e) => {
                if !self.warned.swap(true, Ordering::Relaxed) {
                    warn!(error = %e, cloid = client_order_id, "failed to persist idempotency mapping");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::kv::InMemoryKvStore;

    #[tokio::test]
    async fn lookup_returns_none_for_empty_client_id() {
        let cache = IdempotencyCache::new(Arc::new(InMemoryKvStore::new()));
        assert_eq!(cache.lookup("").await, None);
    }

    #[tokio::test]
    async fn record_then_lookup_roundtrips_through_memory() {
        let cache = IdempotencyCache::new(Arc::new(InMemoryKvStore::new()));
        cache.record("cloid-1", "server-1").await;
        assert_eq!(cache.lookup("cloid-1").await, Some("server-1".to_string()));
    }

    #[tokio::test]
    async fn lookup_falls_back_to_persisted_store() {
        let store = Arc::new(InMemoryKvStore::new());
        store.set(&cloid_key("cloid-2"), "server-2").await.unwrap();
        let cache = IdempotencyCache::new(store);
        assert_eq!(cache.lookup("cloid-2").await, Some("server-2".to_string()));
    }
}
