// =============================================================================
// Strategy state machine — {IDLE, ENTER, HEDGE_OK, EXIT} (spec §3)
// =============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    Idle,
    Enter,
    #[serde(rename = "HEDGE_OK")]
    HedgeOk,
    Exit,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Idle => "IDLE",
            State::Enter => "ENTER",
            State::HedgeOk => "HEDGE_OK",
            State::Exit => "EXIT",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    EnterReq,
    HedgeOk,
    ExitReq,
    Done,
}

/// Guard-only transitions; any event not named below is a no-op that
/// returns the current state unchanged.
#[derive(Debug, Clone, Copy)]
pub struct StateMachine {
    state: State,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { state: State::Idle }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: State) -> Self {
        Self { state }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Unconditionally set the state, bypassing the transition table. Used
    /// by the orchestrator's tick-start normalization (spec §4.4), not by
    /// the regular event-driven path.
    pub fn force(&mut self, state: State) -> State {
        self.state = state;
        self.state
    }

    pub fn apply(&mut self, event: Event) -> State {
        self.state = match (self.state, event) {
            (State::Idle, Event::EnterReq) => State::Enter,
            (State::Enter, Event::HedgeOk) => State::HedgeOk,
            (State::Enter, Event::ExitReq) => State::Exit,
            (State::HedgeOk, Event::ExitReq) => State::Exit,
            (State::Exit, Event::Done) => State::Idle,
            (current, _) => current,
        };
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_happy_path() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.state(), State::Idle);
        assert_eq!(sm.apply(Event::EnterReq), State::Enter);
        assert_eq!(sm.apply(Event::HedgeOk), State::HedgeOk);
        assert_eq!(sm.apply(Event::ExitReq), State::Exit);
        assert_eq!(sm.apply(Event::Done), State::Idle);
    }

    #[test]
    fn enter_can_abort_directly_to_exit() {
        let mut sm = StateMachine::new();
        sm.apply(Event::EnterReq);
        assert_eq!(sm.apply(Event::ExitReq), State::Exit);
    }

    #[test]
    fn unrecognized_event_is_a_no_op() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.apply(Event::HedgeOk), State::Idle);
        assert_eq!(sm.apply(Event::Done), State::Idle);
        assert_eq!(sm.apply(Event::ExitReq), State::Idle);
    }

    #[test]
    fn display_matches_uppercase_names() {
        assert_eq!(State::HedgeOk.to_string(), "HEDGE_OK");
        assert_eq!(State::Idle.to_string(), "IDLE");
    }

    #[test]
    fn force_bypasses_the_transition_table() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.force(State::HedgeOk), State::HedgeOk);
        assert_eq!(sm.state(), State::HedgeOk);
    }

    #[test]
    fn snapshot_roundtrip_preserves_state() {
        let json = serde_json::to_string(&State::HedgeOk).unwrap();
        let back: State = serde_json::from_str(&json).unwrap();
        assert_eq!(back, State::HedgeOk);
    }
}
