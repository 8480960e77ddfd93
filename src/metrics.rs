// =============================================================================
// Metrics — Prometheus exporter + named counters/gauges (spec §5 task 6)
// =============================================================================
//
// The exchange/account/execution/strategy engines never touch the exporter
// directly; they call these thin wrappers so the metric names live in one
// place.
// =============================================================================

use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

pub fn install(bind_addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(bind_addr)
        .install()
        .context("failed to install prometheus exporter")?;
    info!(addr = %bind_addr, "metrics exporter listening");
    Ok(())
}

pub fn entry_failed() {
    metrics::counter!("hyperbasis_entry_failed_total").increment(1);
}

pub fn exit_failed() {
    metrics::counter!("hyperbasis_exit_failed_total").increment(1);
}

pub fn kill_switch_engaged() {
    metrics::counter!("hyperbasis_kill_switch_engaged_total").increment(1);
}

pub fn kill_switch_restored() {
    metrics::counter!("hyperbasis_kill_switch_restored_total").increment(1);
}

pub fn orders_placed() {
    metrics::counter!("hyperbasis_orders_placed_total").increment(1);
}

pub fn orders_cancelled() {
    metrics::counter!("hyperbasis_orders_cancelled_total").increment(1);
}

pub fn rebalances() {
    metrics::counter!("hyperbasis_rebalances_total").increment(1);
}

pub fn set_state_machine_state(state_ordinal: i64) {
    metrics::gauge!("hyperbasis_state_machine_state").set(state_ordinal as f64);
}

pub fn set_delta_usd(delta_usd: f64) {
    metrics::gauge!("hyperbasis_delta_usd").set(delta_usd);
}

pub fn set_funding_rate(rate: f64) {
    metrics::gauge!("hyperbasis_funding_rate_current").set(rate);
}

pub fn set_market_age_secs(age: f64) {
    metrics::gauge!("hyperbasis_market_age_secs").set(age);
}

pub fn set_account_age_secs(age: f64) {
    metrics::gauge!("hyperbasis_account_age_secs").set(age);
}
