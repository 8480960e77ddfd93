// =============================================================================
// Signal evaluation — funding notional, expected carry, confirmation counters
// (spec §4.5)
// =============================================================================

/// Inputs the orchestrator gathers once per tick before evaluating signals.
#[derive(Debug, Clone, Copy)]
pub struct SignalInputs {
    pub perp_position: f64,
    pub spot_balance: f64,
    pub price_ref: f64,
    pub funding_rate: f64,
    pub notional_usd: f64,
    pub min_funding_rate: f64,
    pub carry_buffer_usd: f64,
    pub fee_bps: f64,
    pub slippage_bps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CarryEvaluation {
    pub funding_notional: f64,
    pub expected_funding_usd: f64,
    pub est_cost_usd: f64,
    pub net_expected_carry_usd: f64,
    pub funding_ok: bool,
}

/// First non-zero of `|perp_position|*price_ref`, `|spot_balance|*price_ref`,
/// `notional_usd` (property law 6).
fn funding_notional(inputs: &SignalInputs) -> f64 {
    let from_perp = inputs.perp_position.abs() * inputs.price_ref;
    if from_perp != 0.0 {
        return from_perp;
    }
    let from_spot = inputs.spot_balance.abs() * inputs.price_ref;
    if from_spot != 0.0 {
        return from_spot;
    }
    inputs.notional_usd
}

pub fn evaluate_carry(inputs: &SignalInputs) -> CarryEvaluation {
    let notional = funding_notional(inputs);
    let expected_funding_usd = notional * inputs.funding_rate;
    let est_cost_usd = notional * (inputs.fee_bps + inputs.slippage_bps) / 10_000.0 * 4.0;
    let net_expected_carry_usd = expected_funding_usd - est_cost_usd;
    let funding_ok =
        inputs.funding_rate >= inputs.min_funding_rate && net_expected_carry_usd >= inputs.carry_buffer_usd;

    CarryEvaluation {
        funding_notional: notional,
        expected_funding_usd,
        est_cost_usd,
        net_expected_carry_usd,
        funding_ok,
    }
}

/// Tracks consecutive funding-ok / funding-bad ticks. Each call to `record`
/// increments exactly one counter and zeroes the other (spec §4.5).
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfirmationCounter {
    pub ok_count: u32,
    pub bad_count: u32,
}

impl ConfirmationCounter {
    pub fn record(&mut self, funding_ok: bool) {
        if funding_ok {
            self.ok_count += 1;
            self.bad_count = 0;
        } else {
            self.bad_count += 1;
            self.ok_count = 0;
        }
    }

    pub fn entry_confirmed(&self, funding_confirmations: u32) -> bool {
        self.ok_count >= funding_confirmations
    }

    pub fn exit_confirmed(&self, funding_dip_confirmations: u32) -> bool {
        self.bad_count >= funding_dip_confirmations
    }
}

/// Funding guard (spec §4.5): defers an otherwise-confirmed exit when the
/// next funding payment is imminent and positive, to avoid forgoing it.
pub fn funding_guard_defers_exit(
    enabled: bool,
    next_funding_ms: Option<u64>,
    forecast_rate: Option<f64>,
    current_funding_rate: f64,
    now_ms: u64,
    guard_secs: u64,
) -> bool {
    if !enabled {
        return false;
    }
    let Some(next_funding_ms) = next_funding_ms else {
        return false;
    };
    let rate = forecast_rate.unwrap_or(current_funding_rate);
    if rate <= 0.0 {
        return false;
    }
    let guard_ms = guard_secs * 1000;
    now_ms < next_funding_ms && next_funding_ms < now_ms + guard_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_inputs() -> SignalInputs {
        SignalInputs {
            perp_position: 0.0,
            spot_balance: 0.0,
            price_ref: 100.0,
            funding_rate: 0.0005,
            notional_usd: 1000.0,
            min_funding_rate: 0.0001,
            carry_buffer_usd: 0.0,
            fee_bps: 2.0,
            slippage_bps: 2.0,
        }
    }

    #[test]
    fn funding_notional_prefers_perp_position_regardless_of_notional_usd() {
        let mut inputs = base_inputs();
        inputs.perp_position = -10.0;
        inputs.spot_balance = 999.0;
        inputs.notional_usd = 1.0;
        let eval = evaluate_carry(&inputs);
        assert_eq!(eval.funding_notional, 1000.0);
    }

    #[test]
    fn funding_notional_falls_back_to_spot_then_configured_notional() {
        let mut inputs = base_inputs();
        inputs.spot_balance = 5.0;
        let eval = evaluate_carry(&inputs);
        assert_eq!(eval.funding_notional, 500.0);

        let flat = base_inputs();
        let eval_flat = evaluate_carry(&flat);
        assert_eq!(eval_flat.funding_notional, 1000.0);
    }

    #[test]
    fn carry_ok_requires_both_rate_floor_and_buffer() {
        let mut inputs = base_inputs();
        inputs.carry_buffer_usd = 1_000_000.0;
        let eval = evaluate_carry(&inputs);
        assert!(!eval.funding_ok);

        inputs.carry_buffer_usd = 0.0;
        inputs.funding_rate = 0.00001;
        let eval2 = evaluate_carry(&inputs);
        assert!(!eval2.funding_ok);
    }

    #[test]
    fn confirmation_counter_resets_opposite_counter_each_tick() {
        let mut counter = ConfirmationCounter::default();
        counter.record(true);
        counter.record(true);
        assert_eq!(counter.ok_count, 2);
        assert_eq!(counter.bad_count, 0);
        counter.record(false);
        assert_eq!(counter.ok_count, 0);
        assert_eq!(counter.bad_count, 1);
    }

    #[test]
    fn entry_and_exit_confirmation_thresholds() {
        let mut counter = ConfirmationCounter::default();
        for _ in 0..3 {
            counter.record(true);
        }
        assert!(counter.entry_confirmed(3));
        assert!(!counter.exit_confirmed(3));
    }

    #[test]
    fn funding_guard_defers_when_next_funding_imminent_and_positive() {
        let now = 1_000_000u64;
        assert!(funding_guard_defers_exit(true, Some(now + 90_000), Some(0.0001), 0.0001, now, 120));
        assert!(!funding_guard_defers_exit(true, Some(now + 5 * 60_000), Some(0.0001), 0.0001, now, 120));
    }

    #[test]
    fn funding_guard_ignores_nonpositive_rate() {
        let now = 1_000_000u64;
        assert!(!funding_guard_defers_exit(true, Some(now + 90_000), Some(-0.0001), -0.0001, now, 120));
    }

    #[test]
    fn funding_guard_disabled_never_defers() {
        let now = 1_000_000u64;
        assert!(!funding_guard_defers_exit(false, Some(now + 90_000), Some(0.0001), 0.0001, now, 120));
    }
}
