//! Rate limiting logic and counter stores.

mod clock;
mod engine;
mod memory;
mod options;
mod redis_store;
mod request;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{
    AdmissionDecision, AdmissionEngine, Verdict, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET,
};
pub use memory::{CounterRecord, MemoryStore, SweepHandle, DEFAULT_SWEEP_INTERVAL};
pub use options::{
    BackingServiceOptions, DenyHandler, EffectivePolicy, KeyGenerator, RateLimitOptions,
    RoutePolicy, SkipPredicate, Strategy, DEFAULT_MAX, DEFAULT_MESSAGE, DEFAULT_STATUS_CODE,
    DEFAULT_WINDOW_MS,
};
pub use redis_store::{
    escape_glob, is_missing_script, reset_at_from_ttl, MemberSequence, RedisStore, ScriptCache,
    ScriptState, SLIDING_WINDOW_SCRIPT,
};
pub use request::{AddressSource, RequestMeta, UNKNOWN_ADDRESS};
pub use store::{CounterStore, Increment};
