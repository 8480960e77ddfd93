// =============================================================================
// AccountEngine — streaming reconciler + REST fallbacks (spec §4.2)
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::account::fill_aggregator::{Fill, FillAggregator};
use crate::account::state::{AccountState, MarginSummary, Order};
use crate::errors::AccountError;
use crate::exchange::rest::RestClient;
use crate::exchange::ws::{WsClient, WsEvent};
use crate::util::{coerce_f64, first_field, first_field_f64, first_field_str, normalize_time_to_ms};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingPayment {
    pub coin: String,
    pub usdc: f64,
    pub funding_rate: Option<f64>,
    pub time_ms: u64,
}

pub struct AccountEngine {
    user: String,
    rest: RestClient,
    ws_url: String,

    state: RwLock<AccountState>,
    fills: RwLock<FillAggregator>,

    has_spot_snapshot: AtomicBool,
    has_perp_snapshot: AtomicBool,
    has_orders_snapshot: AtomicBool,
    started: AtomicBool,

    /// Handle to the currently-connected socket, if any, so the spot
    /// reconciler (spec §5 task 4) can issue `Post` requests without owning
    /// the connection itself.
    ws_handle: RwLock<Option<Arc<WsClient>>>,

    /// Local monotonic counter for `Post(id, ...)` spot refresh requests.
    next_post_id: AtomicI64,

    /// Wall-clock ms of the last successful reconcile or applied WS frame,
    /// used by the orchestrator's connectivity kill-switch (spec §4.6).
    last_update_ms: AtomicI64,
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl AccountEngine {
    pub fn new(rest: RestClient, ws_url: String, user: String) -> Self {
        Self {
            user,
            rest,
            ws_url,
            state: RwLock::new(AccountState::new()),
            fills: RwLock::new(FillAggregator::new()),
            has_spot_snapshot: AtomicBool::new(false),
            has_perp_snapshot: AtomicBool::new(false),
            has_orders_snapshot: AtomicBool::new(false),
            started: AtomicBool::new(false),
            ws_handle: RwLock::new(None),
            next_post_id: AtomicI64::new(1),
            last_update_ms: AtomicI64::new(0),
        }
    }

    /// Wall-clock ms of the last reconcile or applied WS frame, for the
    /// orchestrator's staleness check. `0` before the first update.
    pub fn last_update(&self) -> u64 {
        self.last_update_ms.load(Ordering::SeqCst) as u64
    }

    // -------------------------------------------------------------------
    // Public operations (spec §4.2)
    // -------------------------------------------------------------------

    /// REST bootstrap: three calls, substates installed wholesale.
    pub async fn reconcile(&self) -> Result<AccountState, AccountError> {
        let spot = self
            .rest
            .spot_clearinghouse_state(&self.user)
            .await
            .map_err(|e| AccountError::Rest(e.to_string()))?;
        let perp = self
            .rest
            .clearinghouse_state(&self.user)
            .await
            .map_err(|e| AccountError::Rest(e.to_string()))?;
        let orders = self
            .rest
            .open_orders(&self.user)
            .await
            .map_err(|e| AccountError::Rest(e.to_string()))?;

        let mut state = self.state.write();
        state.replace_spot_balances(parse_spot_balances(&spot));
        state.replace_perp_positions(parse_perp_positions(&perp));
        state.margin_summary = Some(parse_margin_summary(&perp));
        state.replace_open_orders(parse_open_orders(&orders));
        state.last_raw_update = perp;
        self.has_spot_snapshot.store(true, Ordering::SeqCst);
        self.has_perp_snapshot.store(true, Ordering::SeqCst);
        self.has_orders_snapshot.store(true, Ordering::SeqCst);
        self.last_update_ms.store(now_ms(), Ordering::SeqCst);
        Ok(state.clone())
    }

    /// Connect the WS, subscribe to every channel this engine consumes, and
    /// spawn the dispatch loop. Reconnection is owned by the caller task
    /// (spec §5 task 2).
    pub async fn start(self: &Arc<Self>) -> Result<(), AccountError> {
        let (ws, mut events) = WsClient::connect(&self.ws_url)
            .await
            .map_err(|e| AccountError::WebSocket(e.to_string()))?;

        ws.subscribe("openOrders", Some(&self.user))
            .map_err(|e| AccountError::WebSocket(e.to_string()))?;
        ws.subscribe("clearinghouseState", Some(&self.user))
            .map_err(|e| AccountError::WebSocket(e.to_string()))?;
        ws.subscribe("userFills", Some(&self.user))
            .map_err(|e| AccountError::WebSocket(e.to_string()))?;
        ws.subscribe("userNonFundingLedgerUpdates", Some(&self.user))
            .map_err(|e| AccountError::WebSocket(e.to_string()))?;

        *self.ws_handle.write() = Some(Arc::clone(&ws));

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                engine.apply_ws_event(event);
            }
            warn!("account engine websocket event stream ended");
            engine.ws_handle.write().take();
        });

        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn snapshot(&self) -> AccountState {
        self.state.read().clone()
    }

    /// Current socket handle, if the stream is connected. The spot
    /// reconciler (spec §5 task 4) uses this to issue its periodic `Post`
    /// without owning the connection; `None` means the reader is between
    /// connections and the reconciler should skip this tick.
    pub fn ws_handle(&self) -> Option<Arc<WsClient>> {
        self.ws_handle.read().clone()
    }

    pub fn fills_enabled(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn fill_size(&self, order_id: &str) -> f64 {
        self.fills.read().fill_size(order_id)
    }

    pub async fn user_fills_by_time(&self, start_ms: u64, end_ms: Option<u64>) -> Result<Vec<Fill>, AccountError> {
        let body = self
            .rest
            .user_fills_by_time(&self.user, start_ms, end_ms)
            .await
            .map_err(|e| AccountError::Rest(e.to_string()))?;
        Ok(parse_fills(&body))
    }

    /// Authoritative open-order list via REST (used by wait-for-fill).
    pub async fn open_orders(&self) -> Result<Vec<Order>, AccountError> {
        let body = self
            .rest
            .open_orders(&self.user)
            .await
            .map_err(|e| AccountError::Rest(e.to_string()))?;
        Ok(parse_open_orders(&body))
    }

    pub async fn user_funding(&self, start_ms: u64) -> Result<Vec<FundingPayment>, AccountError> {
        let body = self
            .rest
            .user_funding(&self.user, start_ms)
            .await
            .map_err(|e| AccountError::Rest(e.to_string()))?;
        Ok(parse_user_funding(&body))
    }

    /// `Post(id, {type:"info", payload:{type:"spotClearinghouseState", user}})`
    /// used by the spot-reconciler background task (spec §5 task 4).
    pub fn request_spot_refresh(&self, ws: &WsClient) -> Result<i64, AccountError> {
        let id = self.next_post_id.fetch_add(1, Ordering::SeqCst);
        ws.post_info(serde_json::json!({ "type": "spotClearinghouseState", "user": self.user }))
            .map_err(|e| AccountError::WebSocket(e.to_string()))?;
        Ok(id)
    }

    /// Handle a `{channel:"post", data:{response:{type, payload}}}` reply.
    pub fn apply_post_reply(&self, data: &Value) -> Result<(), AccountError> {
        let response = data.get("response").ok_or_else(|| {
            AccountError::PostError {
                id: 0,
                message: "missing response envelope".to_string(),
            }
        })?;
        let response_type = response.get("type").and_then(Value::as_str).unwrap_or("");
        if response_type == "error" {
            return Err(AccountError::PostError {
                id: 0,
                message: response
                    .get("payload")
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            });
        }
        if response_type == "spotClearinghouseState" {
            if let Some(payload) = response.get("payload") {
                let mut state = self.state.write();
                state.replace_spot_balances(parse_spot_balances(payload));
                self.has_spot_snapshot.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // WS channel dispatch
    // -------------------------------------------------------------------

    fn apply_ws_event(&self, event: WsEvent) {
        self.last_update_ms.store(now_ms(), Ordering::SeqCst);
        match event.channel.as_str() {
            "openOrders" => self.apply_open_orders_event(&event.data),
            "clearinghouseState" => self.apply_clearinghouse_event(&event.data),
            "userFills" => self.apply_user_fills_event(&event.data),
            "userNonFundingLedgerUpdates" => self.apply_ledger_event(&event.data),
            "post" => {
                if let Err(e) = self.apply_post_reply(&event.data) {
                    debug!(error = %e, "post reply error");
                }
            }
            other => debug!(channel = other, "ignoring unrecognized channel"),
        }
    }

    fn apply_open_orders_event(&self, data: &Value) {
        let is_snapshot = data.get("isSnapshot").and_then(Value::as_bool).unwrap_or(false);
        let orders = parse_open_orders(data);
        let mut state = self.state.write();
        if is_snapshot || !self.has_orders_snapshot.swap(true, Ordering::SeqCst) {
            state.replace_open_orders(orders);
        } else {
            for order in orders {
                state.apply_order_delta(order);
            }
        }
    }

    fn apply_clearinghouse_event(&self, data: &Value) {
        let is_snapshot = data.get("isSnapshot").and_then(Value::as_bool).unwrap_or(false);
        let positions = parse_perp_positions(data);
        let margin = parse_margin_summary(data);
        let mut state = self.state.write();
        if is_snapshot || !self.has_perp_snapshot.swap(true, Ordering::SeqCst) {
            state.replace_perp_positions(positions);
        } else {
            for (asset, size) in positions {
                state.apply_perp_delta(asset, size);
            }
        }
        state.margin_summary = Some(margin);
    }

    fn apply_user_fills_event(&self, data: &Value) {
        let parsed = parse_fills(data);
        let mut fills = self.fills.write();
        for fill in parsed {
            fills.ingest(fill);
        }
    }

    fn apply_ledger_event(&self, data: &Value) {
        if !self.has_spot_snapshot.load(Ordering::SeqCst) {
            debug!("dropping ledger update received before spot snapshot");
            return;
        }
        let updates = data
            .get("nonFundingLedgerUpdates")
            .or_else(|| data.get("updates"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut state = self.state.write();
        for update in updates {
            let Some(delta) = update.get("delta") else { continue };
            let kind = delta.get("type").and_then(Value::as_str).unwrap_or("");
            let Some(token) = first_field_str(delta, &["coin", "token", "symbol"]) else { continue };
            let Some(amount) = first_field_f64(delta, &["usdc", "amount"]) else { continue };

            match kind {
                "spotTransfer" => {
                    let destination_is_self = delta
                        .get("destination")
                        .and_then(Value::as_str)
                        .map(|d| d.eq_ignore_ascii_case(&self.user))
                        .unwrap_or(false);
                    let sign = if destination_is_self { 1.0 } else { -1.0 };
                    state.apply_spot_delta(token, sign * amount);
                }
                "spotGenesis" => {
                    state.apply_spot_delta(token, amount);
                }
                "accountClassTransfer" => {
                    let to_perp = delta.get("toPerp").and_then(Value::as_bool).unwrap_or(false);
                    let sign = if to_perp { -1.0 } else { 1.0 };
                    state.apply_spot_delta("USDC", sign * amount);
                }
                other => debug!(kind = other, "unrecognized ledger delta type"),
            }
        }
    }
}

// ===========================================================================
// Parsing helpers (spec §9 "weakly-typed JSON payloads")
// ===========================================================================

fn parse_spot_balances(payload: &Value) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    let balances = payload
        .get("balances")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for entry in balances {
        let Some(coin) = first_field_str(&entry, &["coin", "symbol", "asset"]) else { continue };
        let Some(total) = first_field_f64(&entry, &["total", "balance", "available"]) else { continue };
        out.insert(coin.to_string(), total);
    }
    out
}

fn parse_perp_positions(payload: &Value) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    let positions = payload
        .get("assetPositions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for entry in positions {
        let Some(position) = entry.get("position") else { continue };
        let Some(coin) = first_field_str(position, &["coin", "symbol", "asset"]) else { continue };
        let Some(szi) = first_field_f64(position, &["szi", "size"]) else { continue };
        out.insert(coin.to_string(), szi);
    }
    out
}

fn parse_margin_summary(payload: &Value) -> MarginSummary {
    let summary = payload.get("marginSummary");
    MarginSummary {
        account_value: summary.and_then(|s| first_field_f64(s, &["accountValue"])),
        margin_ratio: payload.get("marginRatio").and_then(coerce_f64),
        health_ratio: payload.get("healthRatio").and_then(coerce_f64),
    }
}

fn parse_open_orders(payload: &Value) -> Vec<Order> {
    let orders = payload
        .as_array()
        .cloned()
        .or_else(|| payload.get("orders").and_then(Value::as_array).cloned())
        .unwrap_or_default();
    orders
        .into_iter()
        .filter_map(|entry| {
            let id = first_field_str(&entry, &["oid", "orderId", "id"])?.to_string();
            let status = first_field_str(&entry, &["status"]).unwrap_or("open").to_string();
            let remaining_sz = first_field_f64(&entry, &["remainingSz", "sz"]);
            let asset = first_field_str(&entry, &["coin", "symbol", "asset"]).map(str::to_string);
            Some(Order {
                id,
                asset,
                status,
                remaining_sz,
                payload: entry,
            })
        })
        .collect()
}

fn parse_fills(payload: &Value) -> Vec<Fill> {
    let fills = payload
        .as_array()
        .cloned()
        .or_else(|| payload.get("fills").and_then(Value::as_array).cloned())
        .unwrap_or_default();
    fills
        .into_iter()
        .filter_map(|entry| {
            let order_id = first_field_str(&entry, &["oid", "orderId", "order_id"])?.to_string();
            let size = first_field_f64(&entry, &["sz", "size"])?;
            let price = first_field_f64(&entry, &["px", "price"]).unwrap_or(0.0);
            let time_ms = first_field_f64(&entry, &["time", "timestamp"]).unwrap_or(0.0) as u64;
            let provider_hash = first_field_str(&entry, &["hash", "tid"]).map(str::to_string);
            Some(Fill {
                order_id,
                size,
                price,
                time_ms,
                provider_hash,
            })
        })
        .collect()
}

fn parse_user_funding(payload: &Value) -> Vec<FundingPayment> {
    let entries = payload
        .as_array()
        .cloned()
        .or_else(|| {
            first_field(payload, &["userFunding", "fundings", "data"])
                .and_then(Value::as_array)
                .cloned()
        })
        .unwrap_or_default();

    entries
        .into_iter()
        .filter_map(|entry| parse_funding_entry(&entry))
        .collect()
}

fn parse_funding_entry(entry: &Value) -> Option<FundingPayment> {
    if let Some(arr) = entry.as_array() {
        // Tuple form: [coin, amount, time?, rate?]
        let coin = arr.first()?.as_str()?.to_string();
        let usdc = arr.get(1).and_then(coerce_f64)?;
        let time_ms = arr
            .get(2)
            .and_then(coerce_f64)
            .map(normalize_time_to_ms)
            .unwrap_or(0);
        let funding_rate = arr.get(3).and_then(coerce_f64);
        return Some(FundingPayment {
            coin,
            usdc,
            funding_rate,
            time_ms,
        });
    }

    if let Some(delta) = entry.get("delta") {
        if delta.get("type").and_then(Value::as_str) == Some("funding") {
            let coin = first_field_str(delta, &["coin"])?.to_string();
            let usdc = first_field_f64(delta, &["usdc"])?;
            let funding_rate = first_field_f64(delta, &["fundingRate"]);
            let time_ms = first_field_f64(entry, &["time"]).map(normalize_time_to_ms).unwrap_or(0);
            return Some(FundingPayment {
                coin,
                usdc,
                funding_rate,
                time_ms,
            });
        }
        return None;
    }

    let coin = first_field_str(entry, &["coin", "symbol", "asset"])?.to_string();
    let usdc = first_field_f64(entry, &["funding", "usdc"])?;
    let funding_rate = first_field_f64(entry, &["fundingRate"]);
    let time_ms = first_field_f64(entry, &["time"]).map(normalize_time_to_ms).unwrap_or(0);
    Some(FundingPayment {
        coin,
        usdc,
        funding_rate,
        time_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_spot_balances_uses_first_matching_field_names() {
        let payload = json!({ "balances": [{ "coin": "USDC", "total": "100.5" }] });
        let balances = parse_spot_balances(&payload);
        assert_eq!(balances.get("USDC"), Some(&100.5));
    }

    #[test]
    fn parse_perp_positions_reads_szi() {
        let payload = json!({ "assetPositions": [{ "position": { "coin": "BTC", "szi": "-1.5" } }] });
        let positions = parse_perp_positions(&payload);
        assert_eq!(positions.get("BTC"), Some(&-1.5));
    }

    #[test]
    fn parse_open_orders_accepts_bare_array() {
        let payload = json!([{ "oid": "1", "status": "open" }]);
        let orders = parse_open_orders(&payload);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].id, "1");
    }

    #[test]
    fn parse_user_funding_handles_delta_shape() {
        let payload = json!([
            { "delta": { "type": "funding", "coin": "BTC", "usdc": "1.5", "fundingRate": "0.0001" }, "time": 1_700_000_000_000i64, "hash": "0xabc" }
        ]);
        let payments = parse_user_funding(&payload);
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].coin, "BTC");
        assert_eq!(payments[0].usdc, 1.5);
    }

    #[test]
    fn parse_user_funding_handles_tuple_shape() {
        let payload = json!([["ETH", "2.0", 1_700_000_000i64, "0.0002"]]);
        let payments = parse_user_funding(&payload);
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].coin, "ETH");
        assert_eq!(payments[0].usdc, 2.0);
    }

    #[test]
    fn parse_user_funding_handles_nested_envelope() {
        let payload = json!({ "userFunding": [{ "coin": "BTC", "funding": "0.5", "fundingRate": "0.0001", "time": 1_700_000_000_000i64 }] });
        let payments = parse_user_funding(&payload);
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].usdc, 0.5);
    }
}
