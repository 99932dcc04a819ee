//! Provider selection and country allow/block evaluation.

use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::ip_api::IpApiProvider;
use super::provider::{GeoDecision, GeoProvider, GeoResult};
use super::static_table::StaticGeoProvider;
use super::GeoOptions;
use crate::error::{QuotaGuardError, Result};

/// The known provider variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Built-in IP range table
    Static,
    /// Remote ip-api.com lookups with a local cache
    IpApi,
    /// A caller-supplied implementation
    Custom,
}

impl FromStr for ProviderKind {
    type Err = QuotaGuardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "internal" | "static" => Ok(ProviderKind::Static),
            "ip-api" | "ipapi" => Ok(ProviderKind::IpApi),
            "custom" => Ok(ProviderKind::Custom),
            _ => Err(QuotaGuardError::UnknownProvider(s.to_string())),
        }
    }
}

/// What `GeoResolver::set_provider` switches to.
#[derive(Clone)]
pub enum ProviderSelection {
    Kind(ProviderKind),
    Instance(Arc<dyn GeoProvider>),
}

impl From<ProviderKind> for ProviderSelection {
    fn from(kind: ProviderKind) -> Self {
        ProviderSelection::Kind(kind)
    }
}

struct Selected {
    kind: ProviderKind,
    provider: Arc<dyn GeoProvider>,
}

/// Settings for building the remote provider on first use.
#[derive(Debug, Clone)]
struct IpApiSettings {
    endpoint: String,
    timeout: Duration,
    cache_ttl: Duration,
}

impl From<&GeoOptions> for IpApiSettings {
    fn from(options: &GeoOptions) -> Self {
        Self {
            endpoint: options.endpoint.clone(),
            timeout: Duration::from_millis(options.lookup_timeout_ms),
            cache_ttl: Duration::from_secs(options.cache_ttl_secs),
        }
    }
}

/// Resolves addresses through the currently selected provider.
///
/// Starts on the static table. Selection can change at runtime and is
/// visible to every subsequent lookup. The remote provider and its HTTP
/// client are only built once it is first selected.
pub struct GeoResolver {
    static_provider: Arc<StaticGeoProvider>,
    ip_api_settings: IpApiSettings,
    ip_api: OnceLock<Arc<IpApiProvider>>,
    custom: RwLock<Option<Arc<dyn GeoProvider>>>,
    current: RwLock<Selected>,
}

impl GeoResolver {
    /// Build a resolver from options and select the configured provider.
    pub fn new(options: &GeoOptions) -> Result<Self> {
        let resolver = Self::with_static(StaticGeoProvider::new(), options);

        if let Some(name) = &options.provider {
            resolver.set_provider_by_name(name)?;
        }

        Ok(resolver)
    }

    fn with_static(static_provider: StaticGeoProvider, options: &GeoOptions) -> Self {
        let static_provider = Arc::new(static_provider);
        Self {
            current: RwLock::new(Selected {
                kind: ProviderKind::Static,
                provider: static_provider.clone(),
            }),
            static_provider,
            ip_api_settings: IpApiSettings::from(options),
            ip_api: OnceLock::new(),
            custom: RwLock::new(None),
        }
    }

    pub fn with_providers(static_provider: StaticGeoProvider, ip_api: IpApiProvider) -> Self {
        let resolver = Self::with_static(static_provider, &GeoOptions::default());
        let _ = resolver.ip_api.set(Arc::new(ip_api));
        resolver
    }

    fn ip_api_provider(&self) -> Result<Arc<IpApiProvider>> {
        if let Some(provider) = self.ip_api.get() {
            return Ok(provider.clone());
        }

        let settings = &self.ip_api_settings;
        let provider = Arc::new(IpApiProvider::with_settings(
            &settings.endpoint,
            settings.timeout,
            settings.cache_ttl,
        )?);
        // A concurrent caller may have won the race; keep whichever landed.
        Ok(self.ip_api.get_or_init(|| provider).clone())
    }

    /// Switch provider.
    ///
    /// Selecting `ProviderKind::Custom` requires an instance to have been
    /// supplied before.
    pub fn set_provider(&self, selection: impl Into<ProviderSelection>) -> Result<()> {
        let (kind, provider): (ProviderKind, Arc<dyn GeoProvider>) = match selection.into() {
            ProviderSelection::Kind(ProviderKind::Static) => {
                (ProviderKind::Static, self.static_provider.clone() as Arc<dyn GeoProvider>)
            }
            ProviderSelection::Kind(ProviderKind::IpApi) => {
                (ProviderKind::IpApi, self.ip_api_provider()? as Arc<dyn GeoProvider>)
            }
            ProviderSelection::Kind(ProviderKind::Custom) => {
                let custom = self.custom.read().clone().ok_or_else(|| {
                    QuotaGuardError::Config("no custom geo provider has been supplied".to_string())
                })?;
                (ProviderKind::Custom, custom)
            }
            ProviderSelection::Instance(provider) => {
                *self.custom.write() = Some(provider.clone());
                (ProviderKind::Custom, provider)
            }
        };

        info!(kind = ?kind, provider = provider.name(), "Geo provider selected");
        *self.current.write() = Selected { kind, provider };
        Ok(())
    }

    /// Switch provider by configuration name.
    pub fn set_provider_by_name(&self, name: &str) -> Result<()> {
        self.set_provider(name.parse::<ProviderKind>()?)
    }

    pub fn current_kind(&self) -> ProviderKind {
        self.current.read().kind
    }

    /// The remote provider, for cache management. `None` until it has
    /// been selected at least once.
    pub fn ip_api(&self) -> Option<&IpApiProvider> {
        self.ip_api.get().map(|p| p.as_ref())
    }

    pub async fn lookup(&self, ip: &str) -> Result<Option<GeoResult>> {
        // Clone out so the lock is not held across the await.
        let provider = self.current.read().provider.clone();
        provider.lookup(ip).await
    }

    /// Evaluate `ip` against country lists.
    ///
    /// An empty list means the list is not configured. Unresolvable
    /// addresses are allowed. The blocked list is checked first, then the
    /// allowed list. Codes compare case-insensitively.
    pub async fn is_country_allowed(
        &self,
        ip: &str,
        allowed: &[String],
        blocked: &[String],
    ) -> Result<GeoDecision> {
        let Some(result) = self.lookup(ip).await? else {
            debug!(ip = %ip, "Country unknown, allowing");
            return Ok(GeoDecision::unresolved());
        };
        let Some(code) = result.country_code.clone() else {
            debug!(ip = %ip, "Country unknown, allowing");
            return Ok(GeoDecision::unresolved());
        };

        let matches = |list: &[String]| list.iter().any(|c| c.eq_ignore_ascii_case(&code));

        let allowed = if !blocked.is_empty() && matches(blocked) {
            false
        } else if !allowed.is_empty() {
            matches(allowed)
        } else {
            true
        };

        debug!(ip = %ip, country_code = %code, allowed, "Country evaluated");

        Ok(GeoDecision {
            allowed,
            country: result.country,
            country_code: Some(code),
        })
    }
}

impl Default for GeoResolver {
    /// Static table selected, remote provider on default settings.
    fn default() -> Self {
        Self::with_static(StaticGeoProvider::new(), &GeoOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedProvider(Option<GeoResult>);

    #[async_trait]
    impl GeoProvider for FixedProvider {
        async fn lookup(&self, _ip: &str) -> Result<Option<GeoResult>> {
            Ok(self.0.clone())
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl GeoProvider for FailingProvider {
        async fn lookup(&self, _ip: &str) -> Result<Option<GeoResult>> {
            Err(QuotaGuardError::Geo("database offline".to_string()))
        }
    }

    fn resolver() -> GeoResolver {
        GeoResolver::default()
    }

    fn resolver_with(result: Option<GeoResult>) -> GeoResolver {
        let resolver = resolver();
        resolver
            .set_provider(ProviderSelection::Instance(Arc::new(FixedProvider(result))))
            .unwrap();
        resolver
    }

    fn list(codes: &[&str]) -> Vec<String> {
        codes.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_parse_provider_kind() {
        assert_eq!("internal".parse::<ProviderKind>().unwrap(), ProviderKind::Static);
        assert_eq!("ip-api".parse::<ProviderKind>().unwrap(), ProviderKind::IpApi);
        assert_eq!("IPAPI".parse::<ProviderKind>().unwrap(), ProviderKind::IpApi);
        assert!(matches!(
            "maxmind".parse::<ProviderKind>(),
            Err(QuotaGuardError::UnknownProvider(name)) if name == "maxmind"
        ));
    }

    #[test]
    fn test_defaults_to_static_provider() {
        assert_eq!(resolver().current_kind(), ProviderKind::Static);
    }

    #[test]
    fn test_ip_api_built_on_first_selection() {
        let resolver = resolver();
        assert!(resolver.ip_api().is_none());

        resolver.set_provider(ProviderKind::IpApi).unwrap();
        assert!(resolver.ip_api().is_some());
        assert_eq!(resolver.ip_api().unwrap().cached_len(), 0);
    }

    #[test]
    fn test_set_provider_by_name() {
        let resolver = resolver();

        resolver.set_provider_by_name("ip-api").unwrap();
        assert_eq!(resolver.current_kind(), ProviderKind::IpApi);

        resolver.set_provider_by_name("internal").unwrap();
        assert_eq!(resolver.current_kind(), ProviderKind::Static);

        assert!(resolver.set_provider_by_name("unknown").is_err());
        assert_eq!(resolver.current_kind(), ProviderKind::Static);
    }

    #[test]
    fn test_custom_requires_instance() {
        let resolver = resolver();
        assert!(matches!(
            resolver.set_provider(ProviderKind::Custom),
            Err(QuotaGuardError::Config(_))
        ));

        resolver
            .set_provider(ProviderSelection::Instance(Arc::new(FixedProvider(None))))
            .unwrap();
        resolver.set_provider(ProviderKind::Static).unwrap();
        // The instance is remembered once supplied.
        resolver.set_provider(ProviderKind::Custom).unwrap();
        assert_eq!(resolver.current_kind(), ProviderKind::Custom);
    }

    #[tokio::test]
    async fn test_lookup_uses_selected_provider() {
        let resolver = resolver_with(Some(GeoResult::country("US", "United States")));
        let result = resolver.lookup("1.2.3.4").await.unwrap().unwrap();
        assert_eq!(result.country_code.as_deref(), Some("US"));
    }

    #[tokio::test]
    async fn test_unknown_country_is_allowed() {
        let resolver = resolver_with(None);
        let decision = resolver
            .is_country_allowed("1.2.3.4", &list(&["US"]), &list(&["CN"]))
            .await
            .unwrap();
        assert_eq!(decision, GeoDecision::unresolved());

        let resolver = resolver_with(Some(GeoResult::default()));
        let decision = resolver
            .is_country_allowed("1.2.3.4", &list(&["US"]), &[])
            .await
            .unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_blocked_list_wins() {
        let resolver = resolver_with(Some(GeoResult::country("CN", "China")));
        let decision = resolver
            .is_country_allowed("1.2.3.4", &list(&["CN", "US"]), &list(&["CN"]))
            .await
            .unwrap();

        assert!(!decision.allowed);
        assert_eq!(decision.country_code.as_deref(), Some("CN"));
        assert_eq!(decision.country.as_deref(), Some("China"));
    }

    #[tokio::test]
    async fn test_allowed_list() {
        let resolver = resolver_with(Some(GeoResult::country("us", "United States")));

        let decision = resolver
            .is_country_allowed("1.2.3.4", &list(&["US", "CA"]), &[])
            .await
            .unwrap();
        assert!(decision.allowed);

        let decision = resolver
            .is_country_allowed("1.2.3.4", &list(&["GB"]), &[])
            .await
            .unwrap();
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn test_no_lists_allows() {
        let resolver = resolver_with(Some(GeoResult::country("RU", "Russia")));
        let decision = resolver.is_country_allowed("1.2.3.4", &[], &[]).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.country_code.as_deref(), Some("RU"));
    }

    #[tokio::test]
    async fn test_blocked_case_insensitive() {
        let resolver = resolver_with(Some(GeoResult::country("CN", "China")));
        let decision = resolver
            .is_country_allowed("1.2.3.4", &[], &list(&["cn"]))
            .await
            .unwrap();
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn test_static_provider_end_to_end() {
        let resolver = resolver();
        let decision = resolver
            .is_country_allowed("3.1.1.1", &[], &list(&["US"]))
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.country.as_deref(), Some("United States"));
    }

    #[tokio::test]
    async fn test_provider_errors_propagate() {
        let resolver = resolver();
        resolver
            .set_provider(ProviderSelection::Instance(Arc::new(FailingProvider)))
            .unwrap();
        assert!(resolver.is_country_allowed("1.2.3.4", &[], &[]).await.is_err());
    }
}
