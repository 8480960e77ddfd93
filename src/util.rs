// =============================================================================
// Permissive JSON parsing helpers (spec §9 design notes)
// =============================================================================
//
// Exchange payloads are weakly typed on the wire: numeric fields arrive as
// either a JSON number or a string, and the same logical field is named
// differently across endpoints. These helpers centralize both kinds of
// tolerance so individual parsers stay declarative.
// =============================================================================

use serde_json::Value;

/// Coerce a JSON value that may be a number or a numeric string into `f64`.
pub fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

/// Return the first present field among `names`, trying each in order.
pub fn first_field<'a>(obj: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| obj.get(name))
}

/// Convenience: `first_field` + `coerce_f64`.
pub fn first_field_f64(obj: &Value, names: &[&str]) -> Option<f64> {
    first_field(obj, names).and_then(coerce_f64)
}

/// Convenience: `first_field` as a string.
pub fn first_field_str<'a>(obj: &'a Value, names: &[&str]) -> Option<&'a str> {
    first_field(obj, names).and_then(Value::as_str)
}

/// Heuristic time-unit classification used throughout `user_funding`
/// parsing (spec §4.2): values ≤1e12 are seconds, ≤1e15 are milliseconds,
/// else nanoseconds. Returns the value normalized to milliseconds.
pub fn normalize_time_to_ms(raw: f64) -> u64 {
    if raw <= 1e12 {
        (raw * 1000.0) as u64
    } else if raw <= 1e15 {
        raw as u64
    } else {
        (raw / 1_000_000.0) as u64
    }
}

/// Round a non-negative quantity down to `decimals` fractional digits
/// (spec §4.5 step 1/6: spot/perp size rounding toward zero).
pub fn round_down(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).floor() / factor
}

/// Truncate `value`'s significand to `sig_figs` significant digits,
/// discarding the remainder rather than rounding it.
fn truncate_significant_figures(value: f64, sig_figs: u32) -> f64 {
    if value == 0.0 {
        return 0.0;
    }
    let magnitude = value.abs().log10().floor();
    let factor = 10f64.powf(sig_figs as f64 - 1.0 - magnitude);
    (value * factor).trunc() / factor
}

/// Derive an IOC limit price from a mid price (spec §4.5 step 2): offset by
/// `ioc_price_bps`, truncate the significand to 5 figures, then round to the
/// number of decimals the exchange allows for this asset class
/// (`max(0, (8 if spot else 6) - sz_decimals)`).
pub fn normalize_ioc_price(mid: f64, ioc_price_bps: f64, is_buy: bool, is_spot: bool, sz_decimals: u32) -> f64 {
    let offset = ioc_price_bps / 10_000.0;
    let raw = if is_buy { mid * (1.0 + offset) } else { mid * (1.0 - offset) };
    let truncated = truncate_significant_figures(raw, 5);
    let max_decimals: i64 = if is_spot { 8 } else { 6 };
    let decimals = (max_decimals - sz_decimals as i64).max(0) as u32;
    let factor = 10f64.powi(decimals as i32);
    (truncated * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerce_f64_handles_both_shapes() {
        assert_eq!(coerce_f64(&json!(1.5)), Some(1.5));
        assert_eq!(coerce_f64(&json!("1.5")), Some(1.5));
        assert_eq!(coerce_f64(&json!("not a number")), None);
        assert_eq!(coerce_f64(&json!(null)), None);
    }

    #[test]
    fn first_field_tries_each_name_in_order() {
        let obj = json!({ "symbol": "BTC" });
        assert_eq!(first_field_str(&obj, &["coin", "symbol", "asset"]), Some("BTC"));
        assert_eq!(first_field_str(&obj, &["coin", "asset"]), None);
    }

    #[test]
    fn normalize_time_to_ms_classifies_by_magnitude() {
        assert_eq!(normalize_time_to_ms(1_700_000_000.0), 1_700_000_000_000);
        assert_eq!(normalize_time_to_ms(1_700_000_000_000.0), 1_700_000_000_000);
        assert_eq!(normalize_time_to_ms(1_700_000_000_000_000_000.0), 1_700_000_000_000);
    }

    #[test]
    fn round_down_truncates_toward_zero() {
        assert_eq!(round_down(1.23456, 2), 1.23);
        assert_eq!(round_down(1.999, 0), 1.0);
    }

    #[test]
    fn normalize_ioc_price_offsets_and_truncates() {
        let buy = normalize_ioc_price(100.0, 10.0, true, true, 2);
        assert!(buy > 100.0);
        let sell = normalize_ioc_price(100.0, 10.0, false, true, 2);
        assert!(sell < 100.0);
    }

    #[test]
    fn normalize_ioc_price_respects_decimal_cap_for_perp_vs_spot() {
        let perp = normalize_ioc_price(123.456789, 5.0, true, false, 3);
        let spot = normalize_ioc_price(123.456789, 5.0, true, true, 3);
        // perp cap = max(0, 6-3) = 3 decimals; spot cap = max(0, 8-3) = 5 decimals
        let perp_str = format!("{perp:.10}");
        let spot_str = format!("{spot:.10}");
        assert!(perp_str.trim_end_matches('0').split('.').nth(1).unwrap_or("").len() <= 3);
        assert!(spot_str.trim_end_matches('0').split('.').nth(1).unwrap_or("").len() <= 5);
    }
}
