//! Tick-driven state machine, signal evaluation, and the orchestrator that
//! drives entry/exit/rebalance workflows (spec §4.5).

pub mod orchestrator;
pub mod signals;
pub mod snapshot;
pub mod state_machine;

pub use orchestrator::Orchestrator;
pub use snapshot::StrategySnapshot;
pub use state_machine::{Event, State, StateMachine};
