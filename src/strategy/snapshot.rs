// =============================================================================
// StrategySnapshot — persisted JSON shape (spec §3, §4.7)
// =============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::persistence::keys::LAST_SNAPSHOT_KEY;
use crate::persistence::kv::KvStore;
use crate::strategy::state_machine::State;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategySnapshot {
    pub action: State,
    pub spot_asset: String,
    pub perp_asset: String,
    pub spot_mid: f64,
    pub perp_mid: f64,
    pub spot_balance: f64,
    pub perp_position: f64,
    pub open_orders: Vec<String>,
    pub updated_at_ms: u64,
}

impl StrategySnapshot {
    pub async fn save(&self, store: &dyn KvStore) {
        match serde_json::to_string(self) {
            Ok(json) => {
                if let Err(e) = store.set(LAST_SNAPSHOT_KEY, &json).await {
                    warn!(error = %e, "failed to persist strategy snapshot");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialise strategy snapshot"),
        }
    }

    pub async fn load(store: &Arc<dyn KvStore>) -> Option<Self> {
        match store.get(LAST_SNAPSHOT_KEY).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(error = %e, "failed to parse persisted strategy snapshot");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "failed to read persisted strategy snapshot");
                None
            }
        }
    }

    /// Startup replay rule (spec §4.7): an exposed account resumes in
    /// HEDGE_OK (or the preserved state if already mid-workflow); a flat
    /// account always starts IDLE.
    pub fn startup_state(&self, is_exposed: bool) -> State {
        if !is_exposed {
            return State::Idle;
        }
        match self.action {
            State::Enter | State::Exit | State::HedgeOk => {
                if self.action == State::HedgeOk {
                    State::HedgeOk
                } else {
                    self.action
                }
            }
            State::Idle => State::HedgeOk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::kv::InMemoryKvStore;

    fn sample() -> StrategySnapshot {
        StrategySnapshot {
            action: State::HedgeOk,
            spot_asset: "PURR/USDC".into(),
            perp_asset: "PURR".into(),
            spot_mid: 1.23,
            perp_mid: 1.24,
            spot_balance: 100.0,
            perp_position: -100.0,
            open_orders: vec!["1".into(), "2".into()],
            updated_at_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn round_trip_encode_decode_matches_property_5() {
        let snapshot = sample();
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: StrategySnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snapshot, back);
    }

    #[tokio::test]
    async fn save_then_load_roundtrips_through_store() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let snapshot = sample();
        snapshot.save(store.as_ref()).await;
        let loaded = StrategySnapshot::load(&store).await.unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn flat_account_always_starts_idle() {
        let snapshot = sample();
        assert_eq!(snapshot.startup_state(false), State::Idle);
    }

    #[test]
    fn exposed_account_resumes_hedge_ok() {
        let mut snapshot = sample();
        snapshot.action = State::Enter;
        assert_eq!(snapshot.startup_state(true), State::Enter);
        snapshot.action = State::Idle;
        assert_eq!(snapshot.startup_state(true), State::HedgeOk);
    }
}
