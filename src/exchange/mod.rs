//! Transport glue: the exchange's single-POST REST endpoint and its
//! WebSocket push/subscribe/post protocol. Specified only by contract
//! (spec §6) — no business logic lives here.

pub mod rest;
pub mod ws;

pub use rest::RestClient;
pub use ws::{WsClient, WsEvent};
