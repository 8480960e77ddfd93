//! Idempotent order placement, retry with backoff, and wait-for-fill
//! (spec §4.4).

pub mod engine;
pub mod idempotency;

pub use engine::{ExecutionEngine, Order, WaitForFillOutcome};
pub use idempotency::IdempotencyCache;
