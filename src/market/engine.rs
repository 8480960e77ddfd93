// =============================================================================
// MarketEngine — mid-price map, context caches, volatility, funding forecast
// (spec §4.3)
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::exchange::rest::RestClient;
use crate::exchange::ws::{WsClient, WsEvent};
use crate::market::context::{CloseBuffer, FundingForecast, PerpContext, SpotContext};
use crate::util::{coerce_f64, first_field_f64, first_field_str};

const CONTEXT_REFRESH_INTERVAL_MS: u64 = 30_000;
const FORECAST_REFRESH_INTERVAL_MS: u64 = 30_000;
const CANDLE_INTERVAL: &str = "1m";

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct MarketEngine {
    rest: RestClient,
    perp_symbol: String,
    spot_symbol: String,

    mids: RwLock<std::collections::HashMap<String, f64>>,
    perp_ctx: RwLock<Option<PerpContext>>,
    spot_ctx: RwLock<Option<SpotContext>>,
    close_buffer: RwLock<CloseBuffer>,
    forecast: RwLock<Option<FundingForecast>>,

    last_mid_update_ms: AtomicU64,
    last_ctx_refresh_ms: AtomicU64,
    last_forecast_refresh_ms: AtomicU64,
}

impl MarketEngine {
    pub fn new(rest: RestClient, perp_symbol: String, spot_symbol: String, candle_window: usize) -> Arc<Self> {
        Arc::new(Self {
            rest,
            perp_symbol,
            spot_symbol,
            mids: RwLock::new(std::collections::HashMap::new()),
            perp_ctx: RwLock::new(None),
            spot_ctx: RwLock::new(None),
            close_buffer: RwLock::new(CloseBuffer::new(candle_window)),
            forecast: RwLock::new(None),
            last_mid_update_ms: AtomicU64::new(0),
            last_ctx_refresh_ms: AtomicU64::new(0),
            last_forecast_refresh_ms: AtomicU64::new(0),
        })
    }

    /// One-time REST bootstrap so contexts/mids are populated before the WS
    /// stream (`start`) connects. Best-effort: failures are logged and leave
    /// the cache untouched.
    pub async fn refresh_all(&self) {
        if let Err(e) = self.refresh_mids().await {
            warn!(error = %e, "failed to refresh mid prices");
        }
        self.refresh_metadata().await;
    }

    /// Refreshes the perp/spot context caches and the funding forecast, each
    /// throttled to its own interval. Neither has a WS channel in this API,
    /// so a background task polls this on a short cadence (spec §5 task 3).
    pub async fn refresh_metadata(&self) {
        if self.should_refresh(&self.last_ctx_refresh_ms, CONTEXT_REFRESH_INTERVAL_MS) {
            if let Err(e) = self.refresh_contexts().await {
                warn!(error = %e, "failed to refresh asset contexts");
            }
        }
        if self.should_refresh(&self.last_forecast_refresh_ms, FORECAST_REFRESH_INTERVAL_MS) {
            if let Err(e) = self.refresh_forecast().await {
                warn!(error = %e, "failed to refresh funding forecast");
            }
        }
    }

    /// Connects the WS, subscribes to `allMids` and `candle`, and spawns the
    /// dispatch loop. Reconnection is owned by the caller task (spec §5 task
    /// 3, same shape as task 2's account stream reader).
    pub async fn start(self: &Arc<Self>, ws_url: &str) -> anyhow::Result<()> {
        let (ws, mut events) = WsClient::connect(ws_url).await?;
        ws.subscribe("allMids", None)?;
        ws.subscribe_json(json!({
            "type": "candle",
            "coin": self.perp_symbol,
            "interval": CANDLE_INTERVAL,
        }))?;

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                engine.apply_ws_event(event);
            }
            warn!("market engine websocket event stream ended");
        });

        Ok(())
    }

    fn apply_ws_event(&self, event: WsEvent) {
        match event.channel.as_str() {
            "allMids" => self.apply_all_mids_event(&event.data),
            "candle" => self.apply_candle_event(&event.data),
            other => debug!(channel = other, "ignoring unrecognized channel"),
        }
    }

    fn apply_all_mids_event(&self, data: &Value) {
        let map = parse_all_mids(data);
        if map.is_empty() {
            return;
        }
        if let Some(mid) = map.get(&self.perp_symbol) {
            self.close_buffer.write().push(*mid);
        }
        *self.mids.write() = map;
        self.last_mid_update_ms.store(now_ms(), Ordering::SeqCst);
    }

    fn apply_candle_event(&self, data: &Value) {
        if let Some(close) = first_field_f64(data, &["c", "close"]) {
            self.close_buffer.write().push(close);
        }
    }

    fn should_refresh(&self, last: &AtomicU64, interval_ms: u64) -> bool {
        let now = now_ms();
        let prev = last.load(Ordering::SeqCst);
        now.saturating_sub(prev) >= interval_ms
    }

    async fn refresh_mids(&self) -> anyhow::Result<()> {
        let body = self.rest.all_mids().await?;
        let map = parse_all_mids(&body);
        if let Some(mid) = map.get(&self.perp_symbol) {
            self.close_buffer.write().push(*mid);
        }
        *self.mids.write() = map;
        self.last_mid_update_ms.store(now_ms(), Ordering::SeqCst);
        Ok(())
    }

    async fn refresh_contexts(&self) -> anyhow::Result<()> {
        let perp_body = self.rest.meta_and_asset_ctxs().await?;
        if let Some(ctx) = parse_perp_context(&perp_body, &self.perp_symbol) {
            *self.perp_ctx.write() = Some(ctx);
        }
        let spot_body = self.rest.spot_meta_and_asset_ctxs().await?;
        if let Some(ctx) = parse_spot_context(&spot_body, &self.spot_symbol) {
            *self.spot_ctx.write() = Some(ctx);
        }
        self.last_ctx_refresh_ms.store(now_ms(), Ordering::SeqCst);
        Ok(())
    }

    async fn refresh_forecast(&self) -> anyhow::Result<()> {
        let body = self.rest.predicted_fundings().await?;
        if let Some(forecast) = parse_predicted_funding(&body, &self.perp_symbol) {
            *self.forecast.write() = Some(forecast.rolled_forward(now_ms()));
        }
        self.last_forecast_refresh_ms.store(now_ms(), Ordering::SeqCst);
        Ok(())
    }

    pub fn mid(&self, symbol: &str) -> Option<f64> {
        self.mids.read().get(symbol).copied()
    }

    pub fn perp_context(&self) -> Option<PerpContext> {
        self.perp_ctx.read().clone()
    }

    pub fn spot_context(&self) -> Option<SpotContext> {
        self.spot_ctx.read().clone()
    }

    pub fn forecast(&self) -> Option<FundingForecast> {
        self.forecast.read().clone()
    }

    pub fn volatility(&self) -> f64 {
        self.close_buffer.read().volatility()
    }

    pub fn last_mid_update(&self) -> u64 {
        self.last_mid_update_ms.load(Ordering::SeqCst)
    }
}

// ===========================================================================
// Parsing helpers
// ===========================================================================

fn parse_all_mids(body: &Value) -> std::collections::HashMap<String, f64> {
    let mids_obj = body
        .get("data")
        .and_then(|d| d.get("mids"))
        .or_else(|| body.get("mids"))
        .unwrap_or(body);

    let mut out = std::collections::HashMap::new();
    if let Some(obj) = mids_obj.as_object() {
        for (k, v) in obj {
            if let Some(price) = coerce_f64(v) {
                out.insert(k.clone(), price);
            }
        }
    }
    out
}

fn parse_perp_context(body: &Value, coin: &str) -> Option<PerpContext> {
    let universe = body.get(0)?.get("universe").and_then(Value::as_array)?;
    let ctxs = body.get(1).and_then(Value::as_array)?;
    let index = universe.iter().position(|u| u.get("name").and_then(Value::as_str) == Some(coin))?;
    let meta = universe.get(index)?;
    let ctx = ctxs.get(index)?;

    Some(PerpContext {
        index: index as u32,
        coin: coin.to_string(),
        funding_rate: first_field_f64(ctx, &["funding"]).unwrap_or(0.0),
        oracle_price: first_field_f64(ctx, &["oraclePx"]).unwrap_or(0.0),
        mark_price: first_field_f64(ctx, &["markPx"]).unwrap_or(0.0),
        size_decimals: meta.get("szDecimals").and_then(Value::as_u64).unwrap_or(0) as u32,
    })
}

fn parse_spot_context(body: &Value, symbol: &str) -> Option<SpotContext> {
    let meta = body.get(0)?;
    let universe = meta.get("universe").and_then(Value::as_array)?;
    let tokens = meta.get("tokens").and_then(Value::as_array)?;

    let pair = universe.iter().find(|p| {
        let name = p.get("name").and_then(Value::as_str).unwrap_or("");
        name == symbol || first_field_str(p, &["symbol"]) == Some(symbol)
    })?;

    let index = pair.get("index").and_then(Value::as_u64)? as u32;
    let token_indices = pair.get("tokens").and_then(Value::as_array)?;
    let base_idx = token_indices.first()?.as_u64()? as usize;
    let quote_idx = token_indices.get(1)?.as_u64()? as usize;
    let base = tokens.get(base_idx)?;
    let quote = tokens.get(quote_idx)?;

    Some(SpotContext {
        symbol: symbol.to_string(),
        raw_name: pair.get("name").and_then(Value::as_str).unwrap_or(symbol).to_string(),
        mid_lookup_key: format!("@{}", index),
        base_token: base.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
        base_decimals: base.get("szDecimals").and_then(Value::as_u64).unwrap_or(0) as u32,
        quote_token: quote.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
        quote_decimals: quote.get("szDecimals").and_then(Value::as_u64).unwrap_or(0) as u32,
        index,
    })
}

fn parse_predicted_funding(body: &Value, coin: &str) -> Option<FundingForecast> {
    let entries = body.as_array()?;
    let entry = entries.iter().find(|e| e.get(0).and_then(Value::as_str) == Some(coin))?;
    let providers = entry.get(1).and_then(Value::as_array)?;

    let chosen = providers
        .iter()
        .find(|p| p.get(0).and_then(Value::as_str) == Some("HlPerp"))
        .or_else(|| providers.iter().find(|p| parse_provider_entry(p).is_some()))?;

    let (rate, next_funding_ms, interval_ms) = parse_provider_entry(chosen)?;
    Some(FundingForecast {
        coin: coin.to_string(),
        next_funding_ms,
        rate,
        interval_ms,
    })
}

fn parse_provider_entry(entry: &Value) -> Option<(f64, u64, u64)> {
    let data = entry.get(1)?;
    let rate = first_field_f64(data, &["fundingRate"])?;
    let next_funding_ms = first_field_f64(data, &["nextFundingTime"])? as u64;
    let interval_ms = first_field_f64(data, &["fundingIntervalHours"])
        .map(|h| (h * 3_600_000.0) as u64)
        .unwrap_or(3_600_000);
    Some((rate, next_funding_ms, interval_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_all_mids_handles_flat_map() {
        let body = json!({ "BTC": "60000.5", "ETH": "3000.0" });
        let mids = parse_all_mids(&body);
        assert_eq!(mids.get("BTC"), Some(&60000.5));
    }

    #[test]
    fn parse_all_mids_handles_data_envelope() {
        let body = json!({ "data": { "mids": { "BTC": "60000.5" } } });
        let mids = parse_all_mids(&body);
        assert_eq!(mids.get("BTC"), Some(&60000.5));
    }

    #[test]
    fn parse_perp_context_locates_coin_by_name() {
        let body = json!([
            { "universe": [{ "name": "BTC", "szDecimals": 3 }] },
            [{ "funding": "0.0001", "oraclePx": "60000", "markPx": "60010" }]
        ]);
        let ctx = parse_perp_context(&body, "BTC").unwrap();
        assert_eq!(ctx.coin, "BTC");
        assert_eq!(ctx.size_decimals, 3);
        assert!((ctx.oracle_price - 60000.0).abs() < 1e-9);
    }

    #[test]
    fn parse_predicted_funding_prefers_hlperp_source() {
        let body = json!([
            [
                "BTC",
                [
                    ["OtherVenue", { "fundingRate": "0.0005", "nextFundingTime": 2_000_000, "fundingIntervalHours": 1 }],
                    ["HlPerp", { "fundingRate": "0.0001", "nextFundingTime": 1_000_000, "fundingIntervalHours": 8 }]
                ]
            ]
        ]);
        let forecast = parse_predicted_funding(&body, "BTC").unwrap();
        assert_eq!(forecast.rate, 0.0001);
        assert_eq!(forecast.interval_ms, 8 * 3_600_000);
    }
}
