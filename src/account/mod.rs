//! Streaming reconciler for spot balances, perp positions, open orders,
//! margin summary, and per-order cumulative fills.

pub mod engine;
pub mod fill_aggregator;
pub mod state;

pub use engine::AccountEngine;
pub use fill_aggregator::FillAggregator;
pub use state::{AccountState, MarginSummary, Order, OrderStatus};
