// =============================================================================
// PerpContext / SpotContext — immutable per-tick asset metadata (spec §3, §4.3)
// =============================================================================

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct PerpContext {
    pub index: u32,
    pub coin: String,
    pub funding_rate: f64,
    pub oracle_price: f64,
    pub mark_price: f64,
    pub size_decimals: u32,
}

#[derive(Debug, Clone)]
pub struct SpotContext {
    /// May be synthetic `BASE/QUOTE` when the exchange has no display pair.
    pub symbol: String,
    pub raw_name: String,
    pub mid_lookup_key: String,
    pub base_token: String,
    pub base_decimals: u32,
    pub quote_token: String,
    pub quote_decimals: u32,
    pub index: u32,
}

impl SpotContext {
    /// Exchange convention: spot asset id = 10_000 + index.
    pub fn asset_id(&self) -> u32 {
        10_000 + self.index
    }
}

#[derive(Debug, Clone)]
pub struct FundingForecast {
    pub coin: String,
    pub next_funding_ms: u64,
    pub rate: f64,
    pub interval_ms: u64,
}

impl FundingForecast {
    /// Rolls `next_funding_ms` forward by integer multiples of `interval_ms`
    /// until it is strictly in the future relative to `now_ms`.
    pub fn rolled_forward(mut self, now_ms: u64) -> Self {
        if self.interval_ms == 0 {
            return self;
        }
        while self.next_funding_ms <= now_ms {
            self.next_funding_ms += self.interval_ms;
        }
        self
    }
}

/// Rolling close-price buffer producing population-variance volatility over
/// log-return approximations.
#[derive(Debug, Clone)]
pub struct CloseBuffer {
    window: usize,
    closes: VecDeque<f64>,
}

impl CloseBuffer {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            closes: VecDeque::with_capacity(window),
        }
    }

    pub fn push(&mut self, close: f64) {
        self.closes.push_back(close);
        while self.closes.len() > self.window {
            self.closes.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.closes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
    }

    /// `sqrt(mean(r^2) - mean(r)^2)`, clamped at 0, over `(curr-prev)/prev`
    /// log-return approximations. Returns 0.0 with fewer than two samples.
    pub fn volatility(&self) -> f64 {
        if self.closes.len() < 2 {
            return 0.0;
        }
        let returns: Vec<f64> = self
            .closes
            .iter()
            .zip(self.closes.iter().skip(1))
            .filter_map(|(prev, curr)| {
                if *prev == 0.0 {
                    None
                } else {
                    Some((curr - prev) / prev)
                }
            })
            .collect();
        if returns.is_empty() {
            return 0.0;
        }
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let mean_sq = returns.iter().map(|r| r * r).sum::<f64>() / returns.len() as f64;
        (mean_sq - mean * mean).max(0.0).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_buffer_evicts_beyond_window() {
        let mut buf = CloseBuffer::new(3);
        for i in 1..=5 {
            buf.push(i as f64);
        }
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn volatility_is_zero_for_constant_prices() {
        let mut buf = CloseBuffer::new(10);
        for _ in 0..5 {
            buf.push(100.0);
        }
        assert_eq!(buf.volatility(), 0.0);
    }

    #[test]
    fn volatility_is_nonzero_for_varying_prices() {
        let mut buf = CloseBuffer::new(10);
        for p in [100.0, 105.0, 98.0, 110.0, 90.0] {
            buf.push(p);
        }
        assert!(buf.volatility() > 0.0);
    }

    #[test]
    fn funding_forecast_rolls_forward_past_elapsed_times() {
        let forecast = FundingForecast {
            coin: "BTC".into(),
            next_funding_ms: 1000,
            rate: 0.0001,
            interval_ms: 3_600_000,
        };
        let rolled = forecast.rolled_forward(5_000_000);
        assert!(rolled.next_funding_ms > 5_000_000);
    }

    #[test]
    fn spot_asset_id_is_offset_by_10000() {
        let ctx = SpotContext {
            symbol: "PURR/USDC".into(),
            raw_name: "PURR".into(),
            mid_lookup_key: "PURR/USDC".into(),
            base_token: "PURR".into(),
            base_decimals: 5,
            quote_token: "USDC".into(),
            quote_decimals: 8,
            index: 3,
        };
        assert_eq!(ctx.asset_id(), 10_003);
    }
}
