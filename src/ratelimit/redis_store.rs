//! Redis-backed sliding-window-log counter store.
//!
//! Each admitted request is one member of a sorted set scored by its
//! admission time. Trimming, counting and appending happen inside one Lua
//! script so concurrent callers in different processes can never both
//! observe the same count below the ceiling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, ErrorKind, RedisConnectionInfo};
use tracing::{debug, info, trace, warn};

use super::clock::{Clock, SystemClock};
use super::options::BackingServiceOptions;
use super::store::{CounterStore, Increment};
use crate::error::Result;

/// Trim, count and conditionally append in one server-side step.
///
/// KEYS[1] = log key, ARGV = window_ms, max, now_ms, member.
/// Entries are scored by `now_ms`; `member` must be unique per call so that
/// admissions within the same millisecond each get their own entry.
/// Returns `{blocked, count}`.
pub const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local window = tonumber(ARGV[1])
local max = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, 0, now - window)

local count = redis.call('ZCARD', key)

if count < max then
    redis.call('ZADD', key, now, member)
    redis.call('EXPIRE', key, math.ceil(window / 1000) + 1)
    return {0, count + 1}
end

return {1, count}
"#;

/// Batch size for SCAN during `reset_all`.
const SCAN_COUNT: usize = 100;

/// Load state of the sliding-window script on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptState {
    /// No handle yet, or the server forgot it
    NotLoaded,
    /// Loaded, referenced by its SHA1 digest
    Loaded(String),
}

/// Per-store cache of the script handle.
#[derive(Debug)]
pub struct ScriptCache {
    state: Mutex<ScriptState>,
}

impl ScriptCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptState::NotLoaded),
        }
    }

    /// The cached digest, if loaded.
    pub fn handle(&self) -> Option<String> {
        match &*self.state.lock() {
            ScriptState::Loaded(sha) => Some(sha.clone()),
            ScriptState::NotLoaded => None,
        }
    }

    pub fn loaded(&self, sha: String) {
        *self.state.lock() = ScriptState::Loaded(sha);
    }

    /// Forget the handle after the server reported it unknown.
    pub fn invalidate(&self) {
        *self.state.lock() = ScriptState::NotLoaded;
    }

    pub fn state(&self) -> ScriptState {
        self.state.lock().clone()
    }
}

impl Default for ScriptCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Generates sorted-set members unique across calls and processes.
///
/// Members look like `<now_ms>-<instance>-<seq>`, where `instance` is a
/// random id per store and `seq` increases per call.
#[derive(Debug)]
pub struct MemberSequence {
    instance: String,
    next: AtomicU64,
}

impl MemberSequence {
    pub fn new() -> Self {
        Self {
            instance: uuid::Uuid::new_v4().simple().to_string(),
            next: AtomicU64::new(0),
        }
    }

    /// The member for an entry admitted at `now_ms`.
    pub fn next(&self, now_ms: u64) -> String {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", now_ms, self.instance, seq)
    }
}

impl Default for MemberSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Escape glob metacharacters so `pattern` matches itself literally in
/// `SCAN MATCH`.
pub fn escape_glob(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Whether `err` means the server no longer knows the script digest.
pub fn is_missing_script(err: &redis::RedisError) -> bool {
    err.kind() == ErrorKind::NoScriptError || err.code() == Some("NOSCRIPT")
}

/// Absolute window end from the key's remaining TTL in seconds.
///
/// Non-positive TTLs (-1 no expiry, -2 missing key) fall back to a full
/// window from `now_ms`.
pub fn reset_at_from_ttl(now_ms: u64, ttl_secs: i64, window_ms: u64) -> u64 {
    if ttl_secs > 0 {
        now_ms.saturating_add(ttl_secs as u64 * 1000)
    } else {
        now_ms.saturating_add(window_ms)
    }
}

/// Sliding-window counter store shared by every process pointed at the
/// same Redis and key prefix.
///
/// Backend errors are returned to the caller as they are; deciding to
/// fail open is left to the admission engine.
pub struct RedisStore {
    conn: ConnectionManager,
    key_prefix: String,
    max: u64,
    script: ScriptCache,
    members: MemberSequence,
    clock: Arc<dyn Clock>,
}

impl RedisStore {
    /// Connect using the given options. `max` is the ceiling the script
    /// enforces per key.
    pub async fn connect(options: &BackingServiceOptions, max: u64) -> Result<Self> {
        Self::connect_with_clock(options, max, Arc::new(SystemClock)).await
    }

    pub async fn connect_with_clock(
        options: &BackingServiceOptions,
        max: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(options.host.clone(), options.port),
            redis: RedisConnectionInfo {
                db: options.db,
                password: options.password.clone(),
                ..Default::default()
            },
        };
        let client = redis::Client::open(info)?;

        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(Duration::from_millis(options.connect_timeout_ms))
            .set_response_timeout(Duration::from_millis(options.response_timeout_ms))
            .set_number_of_retries(options.max_retries)
            .set_exponent_base(2)
            .set_max_delay(options.max_retry_delay_ms);

        let conn = ConnectionManager::new_with_config(client, config).await?;

        let store = Self {
            conn,
            key_prefix: options.key_prefix.clone(),
            max,
            script: ScriptCache::new(),
            members: MemberSequence::new(),
            clock,
        };

        if options.enable_ready_check {
            store.ping().await?;
        }

        // Warm the script cache. A failure here is not fatal; increment
        // retries the load and falls back to EVAL.
        store.load_script().await;

        info!(
            host = %options.host,
            port = options.port,
            db = options.db,
            prefix = %options.key_prefix,
            "Connected to Redis counter store"
        );

        Ok(store)
    }

    /// Round-trip a PING.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// The namespaced key for `key`.
    pub fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn script_state(&self) -> ScriptState {
        self.script.state()
    }

    /// Load the script and cache its digest. Returns `None` if the server
    /// refused, in which case callers use EVAL with the full source.
    async fn load_script(&self) -> Option<String> {
        let mut conn = self.conn.clone();
        let loaded: redis::RedisResult<String> = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(SLIDING_WINDOW_SCRIPT)
            .query_async(&mut conn)
            .await;

        match loaded {
            Ok(sha) => {
                debug!(sha = %sha, "Loaded sliding window script");
                self.script.loaded(sha.clone());
                Some(sha)
            }
            Err(e) => {
                warn!(error = %e, "Failed to load sliding window script, falling back to EVAL");
                None
            }
        }
    }

    async fn eval_once(
        &self,
        key: &str,
        window_ms: u64,
        now: u64,
        member: &str,
    ) -> redis::RedisResult<(i64, i64)> {
        let mut conn = self.conn.clone();
        let sha = match self.script.handle() {
            Some(sha) => Some(sha),
            None => self.load_script().await,
        };

        let mut cmd = match sha {
            Some(sha) => {
                let mut cmd = redis::cmd("EVALSHA");
                cmd.arg(sha);
                cmd
            }
            None => {
                let mut cmd = redis::cmd("EVAL");
                cmd.arg(SLIDING_WINDOW_SCRIPT);
                cmd
            }
        };
        cmd.arg(1)
            .arg(key)
            .arg(window_ms)
            .arg(self.max)
            .arg(now)
            .arg(member);

        cmd.query_async(&mut conn).await
    }

    /// Run the script, reloading and retrying once if the server has lost it.
    async fn run_script(&self, key: &str, window_ms: u64, now: u64) -> Result<(i64, i64)> {
        let member = self.members.next(now);
        match self.eval_once(key, window_ms, now, &member).await {
            Err(e) if is_missing_script(&e) => {
                warn!(key = %key, "Sliding window script missing on server, reloading");
                self.script.invalidate();
                Ok(self.eval_once(key, window_ms, now, &member).await?)
            }
            other => Ok(other?),
        }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, window_ms: u64) -> Result<Increment> {
        let now = self.clock.now_millis();
        let key = self.key(key);

        let (blocked, count) = self.run_script(&key, window_ms, now).await?;

        let mut conn = self.conn.clone();
        let ttl: i64 = conn.ttl(&key).await?;
        let reset_at_ms = reset_at_from_ttl(now, ttl, window_ms);

        trace!(key = %key, count, blocked, ttl, "Sliding window increment");

        Ok(Increment {
            count: count.max(0) as u64,
            reset_at_ms,
            blocked: blocked != 0,
        })
    }

    /// Removes log entries stamped at exactly the current millisecond.
    /// This rarely matches an earlier admission; it is a best-effort
    /// compensation, not an inverse of `increment`.
    async fn decrement(&self, key: &str) -> Result<()> {
        let now = self.clock.now_millis();
        let mut conn = self.conn.clone();
        let _: i64 = conn.zrembyscore(self.key(key), now, now).await?;
        Ok(())
    }

    async fn reset_key(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(self.key(key)).await?;
        Ok(())
    }

    async fn reset_all(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", escape_glob(&self.key_prefix));
        let mut cursor: u64 = 0;
        let mut deleted = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                deleted += keys.len();
                let _: i64 = conn.del(keys).await?;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        info!(prefix = %self.key_prefix, deleted, "Reset all counters");
        Ok(())
    }
}
