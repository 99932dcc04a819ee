//! In-process fixed-window counter store.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use super::clock::{Clock, SystemClock};
use super::store::{CounterStore, Increment};
use crate::error::Result;

/// Default interval between expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Per-key window state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterRecord {
    /// Requests seen in the current window
    pub count: u64,
    /// Absolute window end, in epoch milliseconds
    pub reset_at_ms: u64,
}

impl CounterRecord {
    fn fresh(now: u64, window_ms: u64) -> Self {
        Self {
            count: 1,
            reset_at_ms: now.saturating_add(window_ms),
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        self.reset_at_ms <= now
    }
}

/// Fixed-window counter store held in process memory.
///
/// Records live in a `DashMap`, so every mutation of a key happens under
/// that key's shard lock while unrelated keys proceed in parallel. Expired
/// records are treated as absent by `increment` whether or not the sweeper
/// has removed them yet.
pub struct MemoryStore {
    records: DashMap<String, CounterRecord>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store reading the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store reading the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    /// Remove every record whose window has elapsed.
    ///
    /// Returns the number of records removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        before.saturating_sub(self.records.len())
    }

    /// Spawn a background task that sweeps on `interval` until stopped.
    ///
    /// The task holds only a weak reference, so it also ends once the
    /// store itself is dropped.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> SweepHandle {
        let store: Weak<Self> = Arc::downgrade(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let Some(store) = store.upgrade() else { break };
                        let removed = store.sweep();
                        if removed > 0 {
                            debug!(removed, remaining = store.len(), "Swept expired counters");
                        }
                    }
                }
            }
        });

        info!(interval_ms = interval.as_millis() as u64, "Counter sweeper started");

        SweepHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Current record for a key, expired or not.
    pub fn get(&self, key: &str) -> Option<CounterRecord> {
        self.records.get(key).map(|r| *r)
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, window_ms: u64) -> Result<Increment> {
        let now = self.clock.now_millis();

        let record = match self.records.entry(key.to_owned()) {
            Entry::Occupied(mut entry) if !entry.get().is_expired(now) => {
                let record = entry.get_mut();
                record.count += 1;
                *record
            }
            Entry::Occupied(mut entry) => {
                let record = CounterRecord::fresh(now, window_ms);
                entry.insert(record);
                debug!(key = %key, window_ms, "Counter window expired, starting new window");
                record
            }
            Entry::Vacant(entry) => {
                let record = CounterRecord::fresh(now, window_ms);
                entry.insert(record);
                debug!(key = %key, window_ms, "Creating new counter window");
                record
            }
        };

        trace!(key = %key, count = record.count, reset_at_ms = record.reset_at_ms, "Incremented counter");

        Ok(Increment {
            count: record.count,
            reset_at_ms: record.reset_at_ms,
            blocked: false,
        })
    }

    async fn decrement(&self, key: &str) -> Result<()> {
        if let Some(mut record) = self.records.get_mut(key) {
            record.count = record.count.saturating_sub(1);
        }
        Ok(())
    }

    async fn reset_key(&self, key: &str) -> Result<()> {
        self.records.remove(key);
        Ok(())
    }

    async fn reset_all(&self) -> Result<()> {
        self.records.clear();
        Ok(())
    }
}

/// Handle to a running sweeper task.
///
/// `stop` shuts the task down and waits for it. Dropping the handle
/// without stopping aborts the task.
pub struct SweepHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweepHandle {
    /// Signal the sweeper to exit and wait until it has.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("Counter sweeper stopped");
    }

    /// Whether the sweeper task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use tokio_test::assert_ok;

    const START: u64 = 1_700_000_000_000;

    fn store_at(start: u64) -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(start));
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_first_increment_opens_window() {
        let (_clock, store) = store_at(START);

        let result = store.increment("k", 1_000).await.unwrap();

        assert_eq!(result.count, 1);
        assert_eq!(result.reset_at_ms, START + 1_000);
    }

    #[tokio::test]
    async fn test_increments_count_in_order() {
        let (clock, store) = store_at(START);

        for expected in 1..=5 {
            clock.advance(10);
            let result = store.increment("k", 1_000).await.unwrap();
            assert_eq!(result.count, expected);
            // The window end stays pinned to the first request.
            assert_eq!(result.reset_at_ms, START + 10 + 1_000);
        }
    }

    #[tokio::test]
    async fn test_window_resets_exactly_at_boundary() {
        let (clock, store) = store_at(START);

        store.increment("k", 1_000).await.unwrap();
        store.increment("k", 1_000).await.unwrap();

        clock.set(START + 1_000);
        let result = store.increment("k", 1_000).await.unwrap();
        assert_eq!(result.count, 1);
        assert_eq!(result.reset_at_ms, START + 2_000);
    }

    #[tokio::test]
    async fn test_stale_record_is_expired_however_old() {
        let (clock, store) = store_at(START);

        for _ in 0..10 {
            store.increment("k", 500).await.unwrap();
        }
        clock.advance(86_400_000);

        let result = store.increment("k", 500).await.unwrap();
        assert_eq!(result.count, 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (_clock, store) = store_at(START);

        store.increment("a", 1_000).await.unwrap();
        store.increment("a", 1_000).await.unwrap();
        let b = store.increment("b", 1_000).await.unwrap();

        assert_eq!(b.count, 1);
        assert_eq!(store.get("a").unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_decrement_never_goes_negative() {
        let (_clock, store) = store_at(START);

        store.increment("k", 1_000).await.unwrap();
        assert_ok!(store.decrement("k").await);
        assert_ok!(store.decrement("k").await);

        assert_eq!(store.get("k").unwrap().count, 0);

        // Unknown keys are left alone.
        assert_ok!(store.decrement("missing").await);
        assert!(store.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_reset_key_is_idempotent() {
        let (_clock, store) = store_at(START);

        assert_ok!(store.reset_key("never-seen").await);

        store.increment("k", 1_000).await.unwrap();
        store.increment("k", 1_000).await.unwrap();
        assert_ok!(store.reset_key("k").await);
        assert_ok!(store.reset_key("k").await);

        let result = store.increment("k", 1_000).await.unwrap();
        assert_eq!(result.count, 1);
    }

    #[tokio::test]
    async fn test_reset_all_clears_every_key() {
        let (_clock, store) = store_at(START);

        store.increment("a", 1_000).await.unwrap();
        store.increment("b", 1_000).await.unwrap();
        assert_ok!(store.reset_all().await);

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let (clock, store) = store_at(START);

        store.increment("short", 100).await.unwrap();
        store.increment("long", 10_000).await.unwrap();
        clock.advance(100);

        assert_eq!(store.sweep(), 1);
        assert!(store.get("short").is_none());
        assert!(store.get("long").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let (_clock, store) = store_at(START);
        let store = Arc::new(store);

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment("hot", 60_000).await.unwrap().count })
            })
            .collect();

        let mut counts: Vec<u64> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        counts.sort_unstable();

        assert_eq!(counts, (1..=200).collect::<Vec<u64>>());
        assert_eq!(store.get("hot").unwrap().count, 200);
    }

    #[tokio::test]
    async fn test_sweeper_runs_and_stops() {
        let (clock, store) = store_at(START);
        let store = Arc::new(store);

        store.increment("k", 100).await.unwrap();
        clock.advance(200);

        let handle = store.start_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.is_empty());

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_sweeper_exits_when_store_dropped() {
        let (_clock, store) = store_at(START);
        let store = Arc::new(store);

        let handle = store.start_sweeper(Duration::from_millis(5));
        drop(store);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(handle.is_finished());
    }
}
