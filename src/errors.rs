// =============================================================================
// Error taxonomy — one enum per component boundary
// =============================================================================
//
// Transient I/O is retried inside the owning component and never reaches
// these types; what surfaces here is either a hard protocol/codec failure
// or a business-rule violation the orchestrator must react to. See spec
// §7 for the full taxonomy this mirrors.
// =============================================================================

use thiserror::Error;

/// Errors raised by the wire codec and signer (spec §4.1).
#[derive(Debug, Error)]
pub enum CodecError {
    /// `formatFloat` round-tripped to a value that differs from the input
    /// by more than 1e-12 — would silently lose precision on the wire.
    #[error("rounding error: {value} does not round-trip at precision {precision}")]
    Rounding { value: f64, precision: u32 },

    #[error("action contains no orders")]
    MissingOrders,

    #[error("action contains no cancels")]
    MissingCancels,

    #[error("signer error: {0}")]
    Signer(#[from] SignerError),
}

/// Errors raised by the ECDSA signer.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("signer unavailable")]
    Unavailable,
}

/// Errors raised by the account engine.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("rest request failed: {0}")]
    Rest(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("post request {id} returned an error: {message}")]
    PostError { id: u64, message: String },
}

/// Errors raised by the execution layer.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("all {attempts} attempts exhausted: {last}")]
    RetryExhausted { attempts: u32, last: String },

    #[error("rest error: {0}")]
    Rest(String),

    #[error("cancelled")]
    Cancelled,
}

/// Business-rule and workflow errors surfaced by the orchestrator. These
/// never propagate past the tick boundary (spec §7's propagation policy) —
/// they are logged, alerted, and metered, then the tick ends.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("kill-switch engaged: {0}")]
    KillSwitchEngaged(String),

    #[error("risk limit violated: {0}")]
    RiskViolation(String),

    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("account engine error: {0}")]
    Account(#[from] AccountError),

    #[error("usdc shortfall: need {needed}, have {available}")]
    UsdcShortfall { needed: f64, available: f64 },
}

/// Fatal initialisation errors. These are the only errors allowed to reach
/// `main` and exit the process (spec §6 CLI surface, exit code 1).
#[derive(Debug, Error)]
pub enum InitError {
    #[error("missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("persistence init failed: {0}")]
    Persistence(String),
}
