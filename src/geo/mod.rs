//! Geo-location lookups and country allow/block lists.

mod ip_api;
mod provider;
mod resolver;
mod static_table;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ratelimit::RequestMeta;

pub use ip_api::{is_private_ip, IpApiProvider};
pub use provider::{GeoDecision, GeoProvider, GeoResult, PRIVATE_COUNTRY_CODE};
pub use resolver::{GeoResolver, ProviderKind, ProviderSelection};
pub use static_table::{ip_to_number, IpRange, StaticGeoProvider};

/// Default status for geo denials.
pub const DEFAULT_GEO_STATUS_CODE: u16 = 403;

/// Geo settings from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoOptions {
    /// `internal`, `static`, `ip-api` or `ipapi`
    #[serde(default)]
    pub provider: Option<String>,

    /// ISO codes to admit; empty admits every country
    #[serde(default)]
    pub allowed_countries: Vec<String>,

    /// ISO codes to deny; checked before `allowed_countries`
    #[serde(default)]
    pub blocked_countries: Vec<String>,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub status_code: Option<u16>,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for GeoOptions {
    fn default() -> Self {
        Self {
            provider: None,
            allowed_countries: Vec::new(),
            blocked_countries: Vec::new(),
            message: None,
            status_code: None,
            endpoint: default_endpoint(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_endpoint() -> String {
    ip_api::DEFAULT_ENDPOINT.to_string()
}

fn default_lookup_timeout_ms() -> u64 {
    ip_api::DEFAULT_LOOKUP_TIMEOUT.as_millis() as u64
}

fn default_cache_ttl_secs() -> u64 {
    ip_api::DEFAULT_CACHE_TTL.as_secs()
}

impl GeoOptions {
    /// Whether any country list is configured.
    pub fn restricts(&self) -> bool {
        !self.allowed_countries.is_empty() || !self.blocked_countries.is_empty()
    }
}

/// Called with `(ip, country_code, request)` when a request is geo-denied.
pub type GeoBlockHandler = Arc<dyn Fn(&str, &str, &RequestMeta) + Send + Sync>;

/// Country restrictions applied to a route.
#[derive(Clone, Default)]
pub struct GeoPolicy {
    pub allowed_countries: Vec<String>,
    pub blocked_countries: Vec<String>,
    pub message: Option<String>,
    pub status_code: Option<u16>,
    pub on_geo_block: Option<GeoBlockHandler>,
}

impl GeoPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_countries = codes.into_iter().map(Into::into).collect();
        self
    }

    pub fn block<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_countries = codes.into_iter().map(Into::into).collect();
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

    pub fn on_geo_block<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str, &RequestMeta) + Send + Sync + 'static,
    {
        self.on_geo_block = Some(Arc::new(f));
        self
    }

    /// Denial message for `decision`.
    pub fn denial_message(&self, decision: &GeoDecision) -> String {
        match &self.message {
            Some(message) => message.clone(),
            None => format!(
                "Access denied for country: {}",
                decision
                    .country
                    .as_deref()
                    .or(decision.country_code.as_deref())
                    .unwrap_or("Unknown")
            ),
        }
    }

    pub fn denial_status(&self) -> u16 {
        self.status_code.unwrap_or(DEFAULT_GEO_STATUS_CODE)
    }
}

impl From<&GeoOptions> for GeoPolicy {
    fn from(options: &GeoOptions) -> Self {
        Self {
            allowed_countries: options.allowed_countries.clone(),
            blocked_countries: options.blocked_countries.clone(),
            message: options.message.clone(),
            status_code: options.status_code,
            on_geo_block: None,
        }
    }
}

impl fmt::Debug for GeoPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeoPolicy")
            .field("allowed_countries", &self.allowed_countries)
            .field("blocked_countries", &self.blocked_countries)
            .field("message", &self.message)
            .field("status_code", &self.status_code)
            .field("on_geo_block", &self.on_geo_block.is_some())
            .finish()
    }
}
