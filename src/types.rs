// =============================================================================
// Shared types used across the engine
// =============================================================================

use crate::market::context::{PerpContext, SpotContext};

/// Per-tick composite computed by the orchestrator from the market and
/// account engines (spec §4.5 "Per-tick pipeline"); not persisted directly,
/// see `strategy::snapshot::StrategySnapshot` for the on-disk shape.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub perp_ctx: PerpContext,
    pub spot_ctx: SpotContext,
    pub perp_mid: f64,
    pub spot_mid: f64,
    pub price_ref: f64,
    pub spot_balance: f64,
    pub perp_position: f64,
    pub delta_usd: f64,
    pub flat_strict: bool,
    pub flat: bool,
    pub open_order_count: usize,
    pub market_age_secs: u64,
    pub account_age_secs: u64,
}

/// `price_ref = oracle > perp_mid > spot_mid` (spec §4.5): the first
/// strictly-positive candidate, oracle preferred.
pub fn choose_price_ref(oracle_price: f64, perp_mid: f64, spot_mid: f64) -> f64 {
    if oracle_price > 0.0 {
        oracle_price
    } else if perp_mid > 0.0 {
        perp_mid
    } else {
        spot_mid
    }
}

/// Assembles the per-tick `MarketSnapshot` from the market/account engines'
/// current readings (spec §4.5 "Per-tick pipeline"). Pure and synchronous so
/// it can be exercised without live engines.
#[allow(clippy::too_many_arguments)]
pub fn compute_market_snapshot(
    perp_ctx: PerpContext,
    spot_ctx: SpotContext,
    perp_mid: f64,
    spot_mid: f64,
    spot_balance: f64,
    perp_position: f64,
    open_order_count: usize,
    min_exposure_usd: f64,
    market_age_secs: u64,
    account_age_secs: u64,
) -> MarketSnapshot {
    let price_ref = choose_price_ref(perp_ctx.oracle_price, perp_mid, spot_mid);
    let delta_usd = (spot_balance + perp_position) * price_ref;
    let flat_strict = spot_balance.abs() <= 1e-6 && perp_position.abs() <= 1e-6;
    let flat =
        spot_balance.abs() * price_ref < min_exposure_usd && perp_position.abs() * price_ref < min_exposure_usd;
    MarketSnapshot {
        perp_ctx,
        spot_ctx,
        perp_mid,
        spot_mid,
        price_ref,
        spot_balance,
        perp_position,
        delta_usd,
        flat_strict,
        flat,
        open_order_count,
        market_age_secs,
        account_age_secs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_perp_ctx(oracle_price: f64) -> PerpContext {
        PerpContext {
            index: 0,
            coin: "PURR".into(),
            funding_rate: 0.0001,
            oracle_price,
            mark_price: oracle_price,
            size_decimals: 2,
        }
    }

    fn sample_spot_ctx() -> SpotContext {
        SpotContext {
            symbol: "PURR/USDC".into(),
            raw_name: "PURR".into(),
            mid_lookup_key: "@1".into(),
            base_token: "PURR".into(),
            base_decimals: 5,
            quote_token: "USDC".into(),
            quote_decimals: 8,
            index: 1,
        }
    }

    #[test]
    fn compute_market_snapshot_derives_delta_and_flat_flags() {
        let snapshot = compute_market_snapshot(
            sample_perp_ctx(10.0),
            sample_spot_ctx(),
            10.0,
            10.0,
            5.0,
            -5.0,
            0,
            10.0,
            0,
            0,
        );
        assert_eq!(snapshot.price_ref, 10.0);
        assert_eq!(snapshot.delta_usd, 0.0);
        assert!(snapshot.flat);
        assert!(!snapshot.flat_strict);
    }

    #[test]
    fn compute_market_snapshot_not_flat_above_min_exposure() {
        let snapshot = compute_market_snapshot(
            sample_perp_ctx(10.0),
            sample_spot_ctx(),
            10.0,
            10.0,
            100.0,
            -100.0,
            0,
            10.0,
            0,
            0,
        );
        assert!(!snapshot.flat);
    }

    #[test]
    fn choose_price_ref_prefers_oracle_then_perp_then_spot() {
        assert_eq!(choose_price_ref(100.0, 99.0, 98.0), 100.0);
        assert_eq!(choose_price_ref(0.0, 99.0, 98.0), 99.0);
        assert_eq!(choose_price_ref(0.0, 0.0, 98.0), 98.0);
    }

    #[test]
    fn choose_price_ref_ignores_nonpositive_candidates() {
        assert_eq!(choose_price_ref(-1.0, -2.0, 50.0), 50.0);
    }
}
