//! Source adapter trait, registry and built-in adapters.
//!
//! Each [`LookupKind`] is served by exactly one adapter. The pipeline never
//! talks to a source directly; it resolves the adapter through
//! [`AdapterRegistry::get`].

mod email_domain;
mod location_page;
mod lookup_api;
mod profile_page;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use enrichkit_shared::{AppConfig, LookupError, LookupKind, Result};
use tracing::{debug, warn};

use crate::input::NormalizedInput;

pub use email_domain::EmailDomainAdapter;
pub use location_page::LocationPageAdapter;
pub use lookup_api::LookupApiAdapter;
pub use profile_page::ProfilePageAdapter;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Unvalidated answer from a source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResponse {
    /// Source-specific result fields.
    pub fields: serde_json::Map<String, serde_json::Value>,
    /// A URL for the secondary stage, if the source found one.
    pub discovered_url: Option<String>,
}

/// One external data source.
///
/// Implementations classify every failure into a [`LookupError`]; they never
/// retry on their own.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// The lookup kind this adapter serves.
    fn kind(&self) -> LookupKind;

    /// Human-readable adapter name for tracing.
    fn name(&self) -> &str;

    /// Perform one lookup. `timeout` bounds any network call made.
    async fn fetch(
        &self,
        input: &NormalizedInput,
        timeout: Duration,
    ) -> std::result::Result<RawResponse, LookupError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Maps each lookup kind to its adapter.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<LookupKind, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the built-in adapters that `config` has enough settings for.
    ///
    /// Email classification and profile pages are always available. The lookup
    /// API needs a base URL and its key env var; location pages need a URL
    /// template.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let client = crate::http::build_client()?;
        let sources = &config.sources;
        let mut registry = Self::new();

        registry.register(EmailDomainAdapter::new(&sources.personal_domains)?);
        registry.register(ProfilePageAdapter::new(client.clone()));

        if sources.lookup_api_url.trim().is_empty() {
            debug!("no lookup API url configured, linkedin-search disabled");
        } else {
            match enrichkit_shared::lookup_api_key(config) {
                Ok(key) => registry.register(LookupApiAdapter::new(
                    client.clone(),
                    &sources.lookup_api_url,
                    key,
                )?),
                Err(e) => warn!(error = %e, "linkedin-search disabled"),
            }
        }

        if sources.location_url_template.trim().is_empty() {
            debug!("no location url template configured, location disabled");
        } else {
            let cookie = std::env::var(&sources.location_cookie_env)
                .ok()
                .filter(|c| !c.is_empty());
            registry.register(LocationPageAdapter::new(
                client,
                &sources.location_url_template,
                cookie,
            ));
        }

        Ok(registry)
    }

    /// Add or replace the adapter for its kind.
    pub fn register(&mut self, adapter: impl SourceAdapter + 'static) {
        self.register_arc(Arc::new(adapter));
    }

    /// Add or replace a shared adapter.
    pub fn register_arc(&mut self, adapter: Arc<dyn SourceAdapter>) {
        debug!(kind = %adapter.kind(), adapter = adapter.name(), "registered adapter");
        self.adapters.insert(adapter.kind(), adapter);
    }

    /// The adapter serving `kind`, if any.
    pub fn get(&self, kind: LookupKind) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    /// Kinds with a registered adapter, in declaration order.
    pub fn kinds(&self) -> Vec<LookupKind> {
        LookupKind::ALL
            .into_iter()
            .filter(|k| self.adapters.contains_key(k))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_registers_offline_adapters() {
        let registry = AdapterRegistry::from_config(&AppConfig::default()).unwrap();
        assert_eq!(
            registry.kinds(),
            vec![LookupKind::ProfilePage, LookupKind::EmailClass]
        );
        assert_eq!(
            registry.get(LookupKind::EmailClass).unwrap().name(),
            "email-domain"
        );
        assert!(registry.get(LookupKind::Location).is_none());
    }

    #[test]
    fn location_needs_template() {
        let mut config = AppConfig::default();
        config.sources.location_url_template = "https://app.example.com/subscribers/{id}".into();
        let registry = AdapterRegistry::from_config(&config).unwrap();
        assert!(registry.get(LookupKind::Location).is_some());
    }
}
