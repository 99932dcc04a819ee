//! Admission engine: turns a request into an admit/deny verdict.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::clock::{Clock, SystemClock};
use super::memory::{MemoryStore, SweepHandle};
use super::options::{RateLimitOptions, RoutePolicy};
use super::redis_store::RedisStore;
use super::request::RequestMeta;
use super::store::CounterStore;
use crate::config::QuotaGuardConfig;
use crate::error::Result;
use crate::geo::{GeoDecision, GeoPolicy, GeoResolver};

/// Quota ceiling header.
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
/// Quota remaining header.
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
/// Window reset header, Unix seconds.
pub const HEADER_RESET: &str = "X-RateLimit-Reset";

/// Quota state for one admitted or denied request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Window end in epoch milliseconds
    pub reset_at_ms: u64,
    pub key: String,
}

impl AdmissionDecision {
    /// Build from a post-increment count. `remaining` saturates at zero.
    pub fn from_count(key: String, limit: u64, count: u64, reset_at_ms: u64) -> Self {
        Self {
            allowed: count <= limit,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at_ms,
            key,
        }
    }

    /// Window end in Unix seconds, rounded up.
    pub fn reset_epoch_secs(&self) -> u64 {
        self.reset_at_ms.div_ceil(1000)
    }

    /// The three quota headers.
    pub fn headers(&self) -> [(&'static str, String); 3] {
        [
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset_epoch_secs().to_string()),
        ]
    }
}

/// Result of admission control for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Verdict {
    /// Let the request through. `None` when no quota was evaluated: the
    /// route bypasses admission control or the store was unavailable.
    Admit { decision: Option<AdmissionDecision> },
    /// Quota exhausted.
    RateLimited {
        decision: AdmissionDecision,
        status_code: u16,
        message: String,
    },
    /// Origin country refused.
    GeoBlocked {
        ip: String,
        decision: GeoDecision,
        status_code: u16,
        message: String,
    },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Admit { .. })
    }

    pub fn decision(&self) -> Option<&AdmissionDecision> {
        match self {
            Verdict::Admit { decision } => decision.as_ref(),
            Verdict::RateLimited { decision, .. } => Some(decision),
            Verdict::GeoBlocked { .. } => None,
        }
    }

    /// Headers the pipeline should set on the response.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        self.decision()
            .map(|d| d.headers().to_vec())
            .unwrap_or_default()
    }

    /// Status and message for a terminating response, if denied.
    pub fn rejection(&self) -> Option<(u16, &str)> {
        match self {
            Verdict::Admit { .. } => None,
            Verdict::RateLimited {
                status_code,
                message,
                ..
            }
            | Verdict::GeoBlocked {
                status_code,
                message,
                ..
            } => Some((*status_code, message.as_str())),
        }
    }
}

/// Decides admission for requests against a counter store and, when
/// configured, a geo resolver.
///
/// Store failures admit the request (fail-open) so an unreachable backend
/// never turns into client-visible errors.
pub struct AdmissionEngine {
    store: Arc<dyn CounterStore>,
    options: RateLimitOptions,
    default_policy: RoutePolicy,
    geo: Arc<GeoResolver>,
    default_geo: Option<GeoPolicy>,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<SweepHandle>>,
}

impl AdmissionEngine {
    /// Create an engine over an existing store.
    pub fn new(store: Arc<dyn CounterStore>, options: RateLimitOptions) -> Self {
        Self {
            store,
            options,
            default_policy: RoutePolicy::default(),
            geo: Arc::new(GeoResolver::default()),
            default_geo: None,
            clock: Arc::new(SystemClock),
            sweeper: Mutex::new(None),
        }
    }

    /// Build the store and geo resolver described by `config`.
    ///
    /// Selects the Redis store when cluster mode or backing service options
    /// are set, otherwise an in-memory store with a running sweeper.
    pub async fn from_config(config: &QuotaGuardConfig) -> Result<Self> {
        config.validate()?;
        let options = config.rate_limit.clone();

        let mut engine = if options.uses_backing_service() {
            let backing = options.backing_service.clone().unwrap_or_default();
            let store = RedisStore::connect(&backing, options.max).await?;
            Self::new(Arc::new(store), options)
        } else {
            let store = Arc::new(MemoryStore::new());
            let sweeper = store.start_sweeper(Duration::from_millis(config.sweep_interval_ms));
            let engine = Self::new(store, options);
            *engine.sweeper.lock() = Some(sweeper);
            engine
        };

        if let Some(geo) = &config.geo {
            let resolver = Arc::new(GeoResolver::new(geo)?);
            let policy = geo.restricts().then(|| GeoPolicy::from(geo));
            engine = engine.with_geo(resolver, policy);
        }

        info!(
            strategy = ?engine.options.effective_strategy(),
            window_ms = engine.options.window_ms,
            max = engine.options.max,
            geo = engine.default_geo.is_some(),
            "Admission engine initialized"
        );

        Ok(engine)
    }

    /// Replace the geo resolver. `default_policy` applies to routes that
    /// do not carry their own.
    ///
    /// Without this the engine resolves through the static table, so a
    /// route-level `GeoPolicy` is always enforced.
    pub fn with_geo(mut self, resolver: Arc<GeoResolver>, default_policy: Option<GeoPolicy>) -> Self {
        self.geo = resolver;
        self.default_geo = default_policy;
        self
    }

    /// Process-wide route policy. Call-site policies are layered over it.
    pub fn with_default_policy(mut self, policy: RoutePolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(&self) -> &RateLimitOptions {
        &self.options
    }

    pub fn geo(&self) -> &Arc<GeoResolver> {
        &self.geo
    }

    /// Check a request under the process-wide options.
    pub async fn check(&self, request: &RequestMeta) -> Verdict {
        self.check_with(request, &RoutePolicy::default()).await
    }

    /// Check a request under a route policy layered over the defaults.
    pub async fn check_with(&self, request: &RequestMeta, policy: &RoutePolicy) -> Verdict {
        let policy = &policy.layered_over(&self.default_policy);

        if policy.skip_rate_limit {
            trace!(path = %request.path, "Route bypasses admission control");
            return Verdict::Admit { decision: None };
        }

        let effective = policy.resolve(&self.options);

        if policy.skip.as_ref().is_some_and(|skip| skip(request)) {
            let key = self.derive_key(request, policy);
            trace!(key = %key, "Skip predicate matched");
            return Verdict::Admit {
                decision: Some(AdmissionDecision {
                    allowed: true,
                    limit: effective.max,
                    remaining: effective.max,
                    reset_at_ms: self.clock.now_millis().saturating_add(effective.window_ms),
                    key,
                }),
            };
        }

        if let Some(verdict) = self.check_geo(request, policy).await {
            return verdict;
        }

        let key = self.derive_key(request, policy);

        let increment = match self.store.increment(&key, effective.window_ms).await {
            Ok(increment) => increment,
            Err(e) => {
                warn!(key = %key, error = %e, "Counter store unavailable, admitting request");
                return Verdict::Admit { decision: None };
            }
        };

        let mut decision = AdmissionDecision::from_count(
            key,
            effective.max,
            increment.count,
            increment.reset_at_ms,
        );
        decision.allowed &= !increment.blocked;

        trace!(
            key = %decision.key,
            count = increment.count,
            remaining = decision.remaining,
            allowed = decision.allowed,
            "Admission checked"
        );

        if decision.allowed {
            return Verdict::Admit {
                decision: Some(decision),
            };
        }

        debug!(
            key = %decision.key,
            count = increment.count,
            limit = effective.max,
            "Rate limit exceeded"
        );

        if let Some(handler) = &policy.handler {
            handler(request, &decision);
        }

        Verdict::RateLimited {
            decision,
            status_code: effective.status_code,
            message: effective.message,
        }
    }

    /// Geo gate. `Some` only when the request is refused.
    async fn check_geo(&self, request: &RequestMeta, policy: &RoutePolicy) -> Option<Verdict> {
        let geo_policy = policy.geo.as_ref().or(self.default_geo.as_ref())?;

        let ip = request.client_ip(&self.options.address_sources);

        let decision = match self
            .geo
            .is_country_allowed(&ip, &geo_policy.allowed_countries, &geo_policy.blocked_countries)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                warn!(ip = %ip, error = %e, "Geo check failed, continuing");
                return None;
            }
        };

        if decision.allowed {
            return None;
        }

        let country_code = decision.country_code.as_deref().unwrap_or("Unknown");
        debug!(ip = %ip, country_code = %country_code, "Request geo-blocked");

        if let Some(on_block) = &geo_policy.on_geo_block {
            on_block(&ip, country_code, request);
        }

        Some(Verdict::GeoBlocked {
            message: geo_policy.denial_message(&decision),
            status_code: geo_policy.denial_status(),
            ip,
            decision,
        })
    }

    fn derive_key(&self, request: &RequestMeta, policy: &RoutePolicy) -> String {
        match &policy.key_generator {
            Some(generate) => generate(request),
            None => request.default_key(&self.options.address_sources),
        }
    }

    /// Report the pipeline's response status for an admitted request.
    ///
    /// With skip-successful-requests in effect, responses below 400 give
    /// their slot back.
    pub async fn record_response(
        &self,
        decision: &AdmissionDecision,
        status_code: u16,
        policy: &RoutePolicy,
    ) {
        let effective = policy
            .layered_over(&self.default_policy)
            .resolve(&self.options);
        if !effective.skip_successful_requests || status_code >= 400 {
            return;
        }

        if let Err(e) = self.store.decrement(&decision.key).await {
            warn!(key = %decision.key, error = %e, "Failed to release counter slot");
        }
    }

    pub async fn reset_key(&self, key: &str) -> Result<()> {
        self.store.reset_key(key).await
    }

    pub async fn reset_all(&self) -> Result<()> {
        self.store.reset_all().await
    }

    /// Stop background work owned by the engine.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }
    }
}
