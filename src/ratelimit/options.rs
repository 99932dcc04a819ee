//! Quota options and per-route policy overlays.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::request::{AddressSource, RequestMeta};
use super::AdmissionDecision;
use crate::error::{QuotaGuardError, Result};
use crate::geo::GeoPolicy;

/// Default quota period (15 minutes).
pub const DEFAULT_WINDOW_MS: u64 = 15 * 60 * 1000;
/// Default number of admitted requests per period.
pub const DEFAULT_MAX: u64 = 100;
/// Default denial status.
pub const DEFAULT_STATUS_CODE: u16 = 429;
/// Default denial message.
pub const DEFAULT_MESSAGE: &str = "Too Many Requests";

/// Counting algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Fixed windows, counted in process memory
    FixedWindow,
    /// Sliding log, counted in the shared backing service
    SlidingWindow,
}

/// Process-wide quota options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitOptions {
    /// Quota period in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Admitted requests per key per period
    #[serde(default = "default_max")]
    pub max: u64,

    /// Denial message
    #[serde(default = "default_message")]
    pub message: String,

    /// Denial status code
    #[serde(default = "default_status_code")]
    pub status_code: u16,

    /// Give back the slot of requests that end with a non-error status
    #[serde(default)]
    pub skip_successful_requests: bool,

    /// Count in the shared backing service
    #[serde(default)]
    pub cluster_mode: bool,

    /// Backing service connection options
    #[serde(default)]
    pub backing_service: Option<BackingServiceOptions>,

    /// Expected counting algorithm
    #[serde(default)]
    pub strategy: Option<Strategy>,

    /// Client address extraction order
    #[serde(default = "default_address_sources")]
    pub address_sources: Vec<AddressSource>,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max: default_max(),
            message: default_message(),
            status_code: default_status_code(),
            skip_successful_requests: false,
            cluster_mode: false,
            backing_service: None,
            strategy: None,
            address_sources: default_address_sources(),
        }
    }
}

fn default_window_ms() -> u64 {
    DEFAULT_WINDOW_MS
}

fn default_max() -> u64 {
    DEFAULT_MAX
}

fn default_message() -> String {
    DEFAULT_MESSAGE.to_string()
}

fn default_status_code() -> u16 {
    DEFAULT_STATUS_CODE
}

fn default_address_sources() -> Vec<AddressSource> {
    AddressSource::default_chain()
}

impl RateLimitOptions {
    /// Whether these options select the shared backing service.
    pub fn uses_backing_service(&self) -> bool {
        self.cluster_mode || self.backing_service.is_some()
    }

    /// The algorithm implied by store selection.
    pub fn effective_strategy(&self) -> Strategy {
        if self.uses_backing_service() {
            Strategy::SlidingWindow
        } else {
            Strategy::FixedWindow
        }
    }

    /// Reject option combinations the stores cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.window_ms == 0 {
            return Err(QuotaGuardError::Config(
                "window_ms must be greater than zero".to_string(),
            ));
        }

        if let Some(strategy) = self.strategy {
            let selected = self.effective_strategy();
            if strategy != selected {
                return Err(QuotaGuardError::Config(format!(
                    "strategy {:?} does not match the selected store ({:?}); \
                     sliding-window requires cluster_mode or backing_service",
                    strategy, selected
                )));
            }
        }

        Ok(())
    }
}

/// Connection options for the shared backing service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackingServiceOptions {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub db: i64,

    /// Namespace applied to every key this store touches
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Issue a PING after connecting and fail if it is not answered
    #[serde(default)]
    pub enable_ready_check: bool,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Reconnect attempts before an operation fails
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Cap on the exponential reconnect delay
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
}

impl Default for BackingServiceOptions {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            password: None,
            db: 0,
            key_prefix: default_key_prefix(),
            enable_ready_check: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            max_retries: default_max_retries(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_key_prefix() -> String {
    "rate-limit:".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_response_timeout_ms() -> u64 {
    1000
}

fn default_max_retries() -> usize {
    5
}

fn default_max_retry_delay_ms() -> u64 {
    2000
}

/// Derives a rate key from a request.
pub type KeyGenerator = Arc<dyn Fn(&RequestMeta) -> String + Send + Sync>;
/// Returns true for requests that bypass counting.
pub type SkipPredicate = Arc<dyn Fn(&RequestMeta) -> bool + Send + Sync>;
/// Invoked when a request is denied for exceeding its quota.
pub type DenyHandler = Arc<dyn Fn(&RequestMeta, &AdmissionDecision) + Send + Sync>;

/// Per-route overrides layered over the process-wide options.
///
/// Every field left unset falls back to the configured default.
#[derive(Clone, Default)]
pub struct RoutePolicy {
    pub window_ms: Option<u64>,
    pub max: Option<u64>,
    pub message: Option<String>,
    pub status_code: Option<u16>,
    pub skip_successful_requests: Option<bool>,
    pub key_generator: Option<KeyGenerator>,
    pub skip: Option<SkipPredicate>,
    pub handler: Option<DenyHandler>,
    pub geo: Option<GeoPolicy>,
    /// Bypass admission control entirely for this route
    pub skip_rate_limit: bool,
}

impl RoutePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that bypasses admission control.
    pub fn skipped() -> Self {
        Self {
            skip_rate_limit: true,
            ..Self::default()
        }
    }

    pub fn window_ms(mut self, window_ms: u64) -> Self {
        self.window_ms = Some(window_ms);
        self
    }

    pub fn max(mut self, max: u64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn skip_successful_requests(mut self, skip: bool) -> Self {
        self.skip_successful_requests = Some(skip);
        self
    }

    pub fn key_generator<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestMeta) -> String + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(f));
        self
    }

    pub fn skip<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestMeta) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(f));
        self
    }

    pub fn handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestMeta, &AdmissionDecision) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(f));
        self
    }

    pub fn geo(mut self, geo: GeoPolicy) -> Self {
        self.geo = Some(geo);
        self
    }

    /// Fill every unset field from `base`. Values set here win; the
    /// bypass flag applies if either policy sets it.
    pub fn layered_over(&self, base: &RoutePolicy) -> RoutePolicy {
        RoutePolicy {
            window_ms: self.window_ms.or(base.window_ms),
            max: self.max.or(base.max),
            message: self.message.clone().or_else(|| base.message.clone()),
            status_code: self.status_code.or(base.status_code),
            skip_successful_requests: self
                .skip_successful_requests
                .or(base.skip_successful_requests),
            key_generator: self
                .key_generator
                .clone()
                .or_else(|| base.key_generator.clone()),
            skip: self.skip.clone().or_else(|| base.skip.clone()),
            handler: self.handler.clone().or_else(|| base.handler.clone()),
            geo: self.geo.clone().or_else(|| base.geo.clone()),
            skip_rate_limit: self.skip_rate_limit || base.skip_rate_limit,
        }
    }

    /// Overlay this policy on `defaults`. Call-site values win.
    pub fn resolve(&self, defaults: &RateLimitOptions) -> EffectivePolicy {
        EffectivePolicy {
            window_ms: self.window_ms.unwrap_or(defaults.window_ms),
            max: self.max.unwrap_or(defaults.max),
            message: self
                .message
                .clone()
                .unwrap_or_else(|| defaults.message.clone()),
            status_code: self.status_code.unwrap_or(defaults.status_code),
            skip_successful_requests: self
                .skip_successful_requests
                .unwrap_or(defaults.skip_successful_requests),
        }
    }
}

impl fmt::Debug for RoutePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutePolicy")
            .field("window_ms", &self.window_ms)
            .field("max", &self.max)
            .field("message", &self.message)
            .field("status_code", &self.status_code)
            .field("skip_successful_requests", &self.skip_successful_requests)
            .field("key_generator", &self.key_generator.is_some())
            .field("skip", &self.skip.is_some())
            .field("handler", &self.handler.is_some())
            .field("geo", &self.geo)
            .field("skip_rate_limit", &self.skip_rate_limit)
            .finish()
    }
}

/// Quota values after overlaying a route policy on the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectivePolicy {
    pub window_ms: u64,
    pub max: u64,
    pub message: String,
    pub status_code: u16,
    pub skip_successful_requests: bool,
}
