//! Counter store trait over the in-process and Redis-backed stores.

use async_trait::async_trait;

use crate::error::Result;

/// Outcome of recording one request against a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Increment {
    /// Post-increment count for the key's current window
    pub count: u64,
    /// Absolute end of the window, in milliseconds since the Unix epoch
    pub reset_at_ms: u64,
    /// The store refused to record this request because the key is at its
    /// ceiling. Only stores that enforce the ceiling themselves set this.
    pub blocked: bool,
}

/// Trait for counter store implementations.
///
/// This trait abstracts over both the in-process `MemoryStore` and the
/// Redis-backed `RedisStore` so the admission engine can work with either.
/// Every operation must be safe to call concurrently for the same key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Record one occurrence for `key`, opening a fresh window if there is
    /// none or the previous one has elapsed.
    async fn increment(&self, key: &str, window_ms: u64) -> Result<Increment>;

    /// Best-effort removal of one occurrence. Never drives a count negative
    /// and does nothing for unknown keys.
    async fn decrement(&self, key: &str) -> Result<()>;

    /// Drop all state for one key.
    async fn reset_key(&self, key: &str) -> Result<()>;

    /// Drop all state owned by this store.
    async fn reset_all(&self) -> Result<()>;
}
