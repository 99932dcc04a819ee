//! Configuration management for QuotaGuard.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{QuotaGuardError, Result};
use crate::geo::GeoOptions;
use crate::ratelimit::RateLimitOptions;

/// Environment variable prefix, e.g. `QUOTAGUARD__RATE_LIMIT__MAX=50`.
pub const ENV_PREFIX: &str = "QUOTAGUARD";

/// Main configuration for QuotaGuard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaGuardConfig {
    /// Quota defaults and store selection
    #[serde(default)]
    pub rate_limit: RateLimitOptions,

    /// Geo restrictions; geo checks are off when absent
    #[serde(default)]
    pub geo: Option<GeoOptions>,

    /// Expiry sweep interval for the in-memory store
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

impl QuotaGuardConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: QuotaGuardConfig = serde_yaml::from_str(yaml)
            .map_err(|e| QuotaGuardError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Layer an optional file and `QUOTAGUARD__*` environment variables.
    /// Environment values win over the file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: QuotaGuardConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| QuotaGuardError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.rate_limit.validate()?;
        if self.sweep_interval_ms == 0 {
            return Err(QuotaGuardError::Config(
                "sweep_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
