// =============================================================================
// AccountState — the per-tick snapshot (spec §3)
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Balances/positions below this magnitude are treated as dust and dropped.
pub const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarginSummary {
    pub account_value: Option<f64>,
    pub margin_ratio: Option<f64>,
    pub health_ratio: Option<f64>,
}

impl MarginSummary {
    pub fn has_account_value(&self) -> bool {
        self.account_value.is_some()
    }
    pub fn has_margin_ratio(&self) -> bool {
        self.margin_ratio.is_some()
    }
    pub fn has_health_ratio(&self) -> bool {
        self.health_ratio.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub asset: Option<String>,
    pub status: String,
    pub remaining_sz: Option<f64>,
    #[serde(default)]
    pub payload: Value,
}

/// Terminal statuses per spec §4.2: anything that is not one of
/// `open`/`live`/`pending`, or an explicit terminal name, or a remaining
/// size of exactly zero.
pub fn is_terminal(status: &str, remaining_sz: Option<f64>) -> bool {
    const TERMINAL_NAMES: &[&str] = &["filled", "canceled", "cancelled", "rejected", "expired", "triggered"];
    const NON_TERMINAL_NAMES: &[&str] = &["open", "live", "pending"];

    let lower = status.to_ascii_lowercase();
    if TERMINAL_NAMES.contains(&lower.as_str()) {
        return true;
    }
    if !NON_TERMINAL_NAMES.contains(&lower.as_str()) {
        return true;
    }
    matches!(remaining_sz, Some(sz) if sz == 0.0)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountState {
    pub spot_balances: HashMap<String, f64>,
    pub perp_positions: HashMap<String, f64>,
    pub open_orders: HashMap<String, Order>,
    pub margin_summary: Option<MarginSummary>,
    #[serde(default)]
    pub last_raw_update: Value,
}

impl AccountState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace spot balances wholesale (snapshot frame), dropping dust.
    pub fn replace_spot_balances(&mut self, balances: HashMap<String, f64>) {
        self.spot_balances = balances
            .into_iter()
            .filter(|(_, v)| v.abs() > EPSILON)
            .collect();
    }

    /// Replace perp positions wholesale (snapshot frame), dropping zeros.
    pub fn replace_perp_positions(&mut self, positions: HashMap<String, f64>) {
        self.perp_positions = positions.into_iter().filter(|(_, v)| *v != 0.0).collect();
    }

    /// Replace open orders wholesale (snapshot frame), dropping terminal ones.
    pub fn replace_open_orders(&mut self, orders: Vec<Order>) {
        self.open_orders = orders
            .into_iter()
            .filter(|o| !is_terminal(&o.status, o.remaining_sz))
            .map(|o| (o.id.clone(), o))
            .collect();
    }

    /// Apply one order delta: insert/overwrite if non-terminal, else remove.
    pub fn apply_order_delta(&mut self, order: Order) {
        if is_terminal(&order.status, order.remaining_sz) {
            self.open_orders.remove(&order.id);
        } else {
            self.open_orders.insert(order.id.clone(), order);
        }
    }

    /// Apply one perp-position delta. A size of exactly zero removes the
    /// entry (invariant iii).
    pub fn apply_perp_delta(&mut self, asset: String, size: f64) {
        if size == 0.0 {
            self.perp_positions.remove(&asset);
        } else {
            self.perp_positions.insert(asset, size);
        }
    }

    /// Apply a signed delta to a spot balance, dropping it if the
    /// resulting magnitude is below `EPSILON` (invariant iv).
    pub fn apply_spot_delta(&mut self, asset: &str, delta: f64) {
        let entry = self.spot_balances.entry(asset.to_string()).or_insert(0.0);
        *entry += delta;
        if entry.abs() <= EPSILON {
            self.spot_balances.remove(asset);
        }
    }

    pub fn spot_balance(&self, asset: &str) -> f64 {
        self.spot_balances.get(asset).copied().unwrap_or(0.0)
    }

    pub fn perp_position(&self, asset: &str) -> f64 {
        self.perp_positions.get(asset).copied().unwrap_or(0.0)
    }

    pub fn open_order_count(&self) -> usize {
        self.open_orders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_then_delta_removes_terminal_orders() {
        let mut state = AccountState::new();
        state.replace_open_orders(vec![
            Order {
                id: "1".into(),
                asset: None,
                status: "open".into(),
                remaining_sz: None,
                payload: Value::Null,
            },
            Order {
                id: "2".into(),
                asset: None,
                status: "open".into(),
                remaining_sz: None,
                payload: Value::Null,
            },
        ]);
        state.apply_order_delta(Order {
            id: "2".into(),
            asset: None,
            status: "filled".into(),
            remaining_sz: None,
            payload: Value::Null,
        });
        state.apply_order_delta(Order {
            id: "3".into(),
            asset: None,
            status: "open".into(),
            remaining_sz: None,
            payload: Value::Null,
        });

        let mut ids: Vec<_> = state.open_orders.keys().cloned().collect();
        ids.sort();
        assert_eq!(ids, vec!["1".to_string(), "3".to_string()]);
    }

    #[test]
    fn zero_position_is_absent() {
        let mut state = AccountState::new();
        state.apply_perp_delta("BTC".into(), 1.0);
        assert_eq!(state.perp_position("BTC"), 1.0);
        state.apply_perp_delta("BTC".into(), -1.0);
        assert_eq!(state.perp_position("BTC"), 0.0);
        assert!(!state.perp_positions.contains_key("BTC"));
    }

    #[test]
    fn dust_balance_is_dropped() {
        let mut state = AccountState::new();
        state.apply_spot_delta("USDC", 1e-10);
        assert!(!state.spot_balances.contains_key("USDC"));
    }

    #[test]
    fn remaining_sz_zero_is_terminal_even_if_status_open() {
        assert!(is_terminal("open", Some(0.0)));
        assert!(!is_terminal("open", Some(1.0)));
        assert!(!is_terminal("open", None));
    }

    #[test]
    fn unknown_status_is_treated_as_terminal() {
        assert!(is_terminal("marked_stale", None));
    }
}
