//! Deterministic wire encoding, EIP-712 typed-data signing, and nonce
//! management for exchange actions.

pub mod codec;
pub mod eip712;
pub mod nonce;
pub mod signer;

pub use codec::{float_to_wire, OrderWire};
pub use eip712::Agent;
pub use nonce::NonceManager;
pub use signer::{AlloySigner, HyperliquidSignature, HyperliquidSigner};
