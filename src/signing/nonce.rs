// =============================================================================
// Monotonic persisted nonce (spec §4.1, §5)
// =============================================================================
//
// `last` is an atomic u64 so the issuing fast path never blocks; a separate
// mutex only serializes the best-effort persistence write. Persistence
// failure is warn-logged once and never blocks issuance (spec's explicit
// "failures are non-fatal" rule).
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::persistence::keys::nonce_key;
use crate::persistence::kv::KvStore;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct NonceManager {
    key: String,
    last: AtomicU64,
    persist_lock: Mutex<()>,
    store: Arc<dyn KvStore>,
    warned: AtomicBool,
}

impl NonceManager {
    /// Seeds `last = max(now_ms, persisted, 0)` by reading the k/v store.
    pub async fn init(store: Arc<dyn KvStore>, base_url: &str, signer_address: &str, vault: Option<&str>) -> Self {
        let key = nonce_key(base_url, signer_address, vault);
        let persisted = match store.get(&key).await {
            Ok(Some(value)) => value.parse::<u64>().unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                warn!(error = %e, key = %key, "failed to read persisted nonce, seeding from clock only");
                0
            }
        };
        let seed = now_ms().max(persisted);
        Self {
            key,
            last: AtomicU64::new(seed),
            persist_lock: Mutex::new(()),
            store,
            warned: AtomicBool::new(false),
        }
    }

    /// `next = max(now_ms, last+1)` via a CAS loop — strictly monotonic and
    /// unique across concurrent callers (property law 4).
    pub async fn next_nonce(&self) -> u64 {
        let next = loop {
            let current = self.last.load(Ordering::SeqCst);
            let candidate = now_ms().max(current + 1);
            if self
                .last
                .compare_exchange(current, candidate, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break candidate;
            }
        };
        self.persist_best_effort(next).await;
        next
    }

    async fn persist_best_effort(&self, value: u64) {
        let _guard = self.persist_lock.lock();
        match self.store.set(&self.key, &value.to_string()).await {
            Ok(()) => {
                self.warned.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                if !self.warned.swap(true, Ordering::Relaxed) {
                    warn!(error = %e, key = %self.key, "failed to persist nonce, will retry silently");
                }
            }
        }
    }

    #[cfg(test)]
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::kv::InMemoryKvStore;

    #[tokio::test]
    async fn seeds_from_persisted_value_ahead_of_clock() {
        let store = Arc::new(InMemoryKvStore::new());
        let seed = now_ms() + 10_000;
        store.set("exchange:nonce:url:signer:", &seed.to_string()).await.unwrap();

        let manager = NonceManager::init(store.clone(), "url", "signer", None).await;
        assert_eq!(manager.current(), seed);

        let first = manager.next_nonce().await;
        assert_eq!(first, seed + 1);

        let persisted = store.get("exchange:nonce:url:signer:").await.unwrap().unwrap();
        assert_eq!(persisted.parse::<u64>().unwrap(), seed + 1);
    }

    #[tokio::test]
    async fn concurrent_callers_get_strictly_increasing_values() {
        let store = Arc::new(InMemoryKvStore::new());
        let manager = Arc::new(NonceManager::init(store, "url", "signer", None).await);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let m = manager.clone();
            handles.push(tokio::spawn(async move { m.next_nonce().await }));
        }
        let mut values = Vec::new();
        for h in handles {
            values.push(h.await.unwrap());
        }
        values.sort_unstable();
        values.dedup();
        assert_eq!(values.len(), 50, "all 50 nonces must be unique");
    }

    #[tokio::test]
    async fn key_includes_vault_segment() {
        let k1 = nonce_key("url", "signer", None);
        let k2 = nonce_key("url", "signer", Some("vault1"));
        assert_ne!(k1, k2);
    }
}
