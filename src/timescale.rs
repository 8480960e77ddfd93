// =============================================================================
// MetricsSink — optional tick/fill telemetry sink (spec §1 "out of scope,
// referenced only by contract": TimescaleDB)
// =============================================================================
//
// A real TimescaleDB driver is outside this component's scope. When
// `HL_TIMESCALE_DSN` is unset the engine runs with `NoopSink`; when set, we
// fall back to appending NDJSON rows through the same `KvStore` the rest of
// the engine already persists through, keyed by timestamp, rather than
// pulling in a second database client for a side channel.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use crate::account::fill_aggregator::Fill;
use crate::persistence::kv::KvStore;
use crate::strategy::snapshot::StrategySnapshot;

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record_tick(&self, snapshot: &StrategySnapshot);
    async fn record_fill(&self, order_id: &str, fill: &Fill);
}

pub struct NoopSink;

#[async_trait]
impl MetricsSink for NoopSink {
    async fn record_tick(&self, _snapshot: &StrategySnapshot) {}
    async fn record_fill(&self, _order_id: &str, _fill: &Fill) {}
}

pub struct KvSink {
    store: Arc<dyn KvStore>,
}

impl KvSink {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MetricsSink for KvSink {
    async fn record_tick(&self, snapshot: &StrategySnapshot) {
        let key = format!("metrics:tick:{}", snapshot.updated_at_ms);
        let row = match serde_json::to_string(snapshot) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to serialise tick telemetry row");
                return;
            }
        };
        if let Err(e) = self.store.set(&key, &row).await {
            warn!(error = %e, "failed to persist tick telemetry row");
        }
    }

    async fn record_fill(&self, order_id: &str, fill: &Fill) {
        let key = format!("metrics:fill:{}:{}", fill.time_ms, order_id);
        let row = json!({
            "order_id": order_id,
            "size": fill.size,
            "price": fill.price,
            "time_ms": fill.time_ms,
        })
        .to_string();
        if let Err(e) = self.store.set(&key, &row).await {
            warn!(error = %e, "failed to persist fill telemetry row");
        }
    }
}

/// Build the configured sink. `dsn.is_some()` selects `KvSink` over the
/// store already open for the rest of the engine's persisted state; a real
/// TimescaleDB client would replace this with its own connection pool.
pub fn build_sink(dsn: Option<&str>, store: Arc<dyn KvStore>) -> Arc<dyn MetricsSink> {
    match dsn {
        Some(_) => Arc::new(KvSink::new(store)),
        None => Arc::new(NoopSink),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::kv::InMemoryKvStore;
    use crate::strategy::state_machine::State;

    fn sample_snapshot() -> StrategySnapshot {
        StrategySnapshot {
            action: State::Idle,
            spot_asset: "PURR/USDC".into(),
            perp_asset: "PURR".into(),
            spot_mid: 1.0,
            perp_mid: 1.0,
            spot_balance: 0.0,
            perp_position: 0.0,
            open_orders: vec![],
            updated_at_ms: 42,
        }
    }

    #[tokio::test]
    async fn noop_sink_accepts_without_storing() {
        let sink = NoopSink;
        sink.record_tick(&sample_snapshot()).await;
    }

    #[tokio::test]
    async fn kv_sink_persists_tick_row() {
        let store = Arc::new(InMemoryKvStore::new());
        let sink = KvSink::new(store.clone());
        sink.record_tick(&sample_snapshot()).await;
        assert!(store.get("metrics:tick:42").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn build_sink_selects_noop_without_dsn() {
        let store = Arc::new(InMemoryKvStore::new());
        let sink = build_sink(None, store.clone());
        sink.record_tick(&sample_snapshot()).await;
        // NoopSink never writes; KvSink would have under "metrics:tick:42".
        assert!(store.get("metrics:tick:42").await.unwrap().is_none());
    }
}
