//! Asset metadata cache, mid-price map, rolling volatility, and the
//! predicted-funding forecaster (spec §4.3).

pub mod context;
pub mod engine;

pub use context::{FundingForecast, PerpContext, SpotContext};
pub use engine::MarketEngine;
