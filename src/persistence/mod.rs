//! Key/value store contract and the SQLite-backed implementation used for
//! nonce, idempotency, snapshot, and operator-offset persistence.

pub mod keys;
pub mod kv;
pub mod sqlite_kv;

pub use kv::KvStore;
pub use sqlite_kv::SqliteKvStore;
