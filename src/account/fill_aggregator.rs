// =============================================================================
// FillAggregator — bounded LRU+FIFO fill dedup (spec §3, §4.2)
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

pub const CAPACITY: usize = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub size: f64,
    pub price: f64,
    pub time_ms: u64,
    #[serde(default)]
    pub provider_hash: Option<String>,
}

fn key_component(x: f64) -> String {
    format!("{:.12}", x)
}

fn fingerprint(fill: &Fill) -> String {
    if let Some(hash) = &fill.provider_hash {
        return hash.clone();
    }
    format!(
        "{}:{}:{}:{}",
        fill.order_id,
        fill.time_ms,
        key_component(fill.size),
        key_component(fill.price)
    )
}

#[derive(Debug, Default)]
pub struct FillAggregator {
    fills_by_order: HashMap<String, f64>,
    /// Most-recently-used at the back.
    order_lru: VecDeque<String>,
    seen_fill_keys: HashSet<String>,
    seen_fill_fifo: VecDeque<String>,
}

impl FillAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one fill. Duplicates (by fingerprint) are silently dropped
    /// (property law 2). Returns `true` if the fill was newly counted.
    pub fn ingest(&mut self, fill: Fill) -> bool {
        if fill.order_id.is_empty() || fill.size == 0.0 {
            return false;
        }
        let key = fingerprint(&fill);
        if self.seen_fill_keys.contains(&key) {
            return false;
        }

        self.seen_fill_keys.insert(key.clone());
        self.seen_fill_fifo.push_back(key);
        self.evict_seen_keys();

        self.promote(&fill.order_id);
        *self.fills_by_order.entry(fill.order_id.clone()).or_insert(0.0) += fill.size.abs();
        self.evict_lru();
        true
    }

    fn promote(&mut self, order_id: &str) {
        if let Some(pos) = self.order_lru.iter().position(|id| id == order_id) {
            self.order_lru.remove(pos);
        }
        self.order_lru.push_back(order_id.to_string());
    }

    fn evict_seen_keys(&mut self) {
        while self.seen_fill_fifo.len() > CAPACITY {
            if let Some(oldest) = self.seen_fill_fifo.pop_front() {
                self.seen_fill_keys.remove(&oldest);
            }
        }
    }

    fn evict_lru(&mut self) {
        while self.order_lru.len() > CAPACITY {
            if let Some(evicted) = self.order_lru.pop_front() {
                self.fills_by_order.remove(&evicted);
            }
        }
    }

    pub fn fill_size(&self, order_id: &str) -> f64 {
        self.fills_by_order.get(order_id).copied().unwrap_or(0.0)
    }

    pub fn tracked_order_count(&self) -> usize {
        self.fills_by_order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(order_id: &str, time_ms: u64, size: f64, price: f64) -> Fill {
        Fill {
            order_id: order_id.to_string(),
            size,
            price,
            time_ms,
            provider_hash: None,
        }
    }

    #[test]
    fn duplicate_fingerprint_is_ignored() {
        let mut agg = FillAggregator::new();
        agg.ingest(fill("1", 100, 1.0, 50.0));
        agg.ingest(fill("1", 100, 1.0, 50.0));
        assert_eq!(agg.fill_size("1"), 1.0);
    }

    #[test]
    fn dedup_matches_law_2() {
        let mut with_dupes = FillAggregator::new();
        let mut deduped = FillAggregator::new();
        let fills = vec![
            fill("a", 1, 1.0, 10.0),
            fill("a", 1, 1.0, 10.0),
            fill("a", 2, 2.0, 10.0),
        ];
        for f in &fills {
            with_dupes.ingest(f.clone());
        }
        let mut seen = HashSet::new();
        for f in &fills {
            let k = fingerprint(f);
            if seen.insert(k) {
                deduped.ingest(f.clone());
            }
        }
        assert_eq!(with_dupes.fill_size("a"), deduped.fill_size("a"));
    }

    #[test]
    fn scenario_1_dedup_plus_lru_2001_orders() {
        let mut agg = FillAggregator::new();
        for i in 0..=2000u32 {
            agg.ingest(fill(&i.to_string(), i as u64, 1.0, 10.0));
        }
        assert_eq!(agg.fill_size("0"), 0.0);
        assert_eq!(agg.fill_size("2000"), 1.0);
        assert_eq!(agg.tracked_order_count(), CAPACITY);
    }

    #[test]
    fn zero_size_fill_is_ignored() {
        let mut agg = FillAggregator::new();
        assert!(!agg.ingest(fill("1", 1, 0.0, 10.0)));
        assert_eq!(agg.fill_size("1"), 0.0);
    }

    #[test]
    fn empty_order_id_is_ignored() {
        let mut agg = FillAggregator::new();
        assert!(!agg.ingest(fill("", 1, 1.0, 10.0)));
    }

    #[test]
    fn provider_hash_used_as_fingerprint_when_present() {
        let mut agg = FillAggregator::new();
        let mut f1 = fill("1", 1, 1.0, 10.0);
        f1.provider_hash = Some("same-hash".into());
        let mut f2 = fill("1", 2, 5.0, 99.0);
        f2.provider_hash = Some("same-hash".into());
        agg.ingest(f1);
        agg.ingest(f2);
        assert_eq!(agg.fill_size("1"), 1.0);
    }
}
