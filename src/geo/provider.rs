//! Geo provider trait and lookup result types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Country code reported for loopback and private ranges.
pub const PRIVATE_COUNTRY_CODE: &str = "XX";

/// Geographic metadata for one address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoResult {
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl GeoResult {
    /// A result carrying only a country.
    pub fn country(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            country_code: Some(code.into()),
            country: Some(name.into()),
            ..Self::default()
        }
    }
}

/// Outcome of checking an address against country lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoDecision {
    pub allowed: bool,
    pub country: Option<String>,
    pub country_code: Option<String>,
}

impl GeoDecision {
    /// Allowed because no country could be determined.
    pub fn unresolved() -> Self {
        Self {
            allowed: true,
            country: None,
            country_code: None,
        }
    }
}

/// Resolves an IP address to a country.
///
/// `Ok(None)` means the address could not be placed. Built-in providers
/// never return `Err`; custom implementations may, and callers treat it
/// the same as an unresolved address.
#[async_trait]
pub trait GeoProvider: Send + Sync {
    async fn lookup(&self, ip: &str) -> Result<Option<GeoResult>>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "custom"
    }
}
