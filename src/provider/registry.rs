//! Ordered provider registry with first-match dispatch.

use std::fmt;
use std::sync::Arc;

use tracing::debug;
use url::Url;

use super::Provider;

/// An ordered collection of providers with a guaranteed fallback.
///
/// Resolution dispatches to the **first** registered provider whose
/// [`Provider::can_resolve`] accepts the URL; the fallback provider accepts
/// anything it is offered and guarantees termination. The registry is built
/// before the pipeline starts and read-only afterwards.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
    fallback: Arc<dyn Provider>,
}

impl ProviderRegistry {
    /// Creates a registry with the given last-resort provider.
    #[must_use]
    pub fn new(fallback: Arc<dyn Provider>) -> Self {
        Self {
            providers: Vec::new(),
            fallback,
        }
    }

    /// Registers a provider. Registration order is dispatch order.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        debug!(provider = provider.name(), "registering provider");
        self.providers.push(provider);
    }

    /// Number of registered providers, excluding the fallback.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Returns true if only the fallback is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Returns the first provider (including the fallback, last) matching
    /// the predicate.
    #[must_use]
    pub fn find(&self, predicate: impl Fn(&dyn Provider) -> bool) -> Option<Arc<dyn Provider>> {
        self.iter()
            .find(|provider| predicate(provider.as_ref()))
            .cloned()
    }

    /// Looks a provider up by name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.find(|provider| provider.name() == name)
    }

    /// Returns the provider responsible for resolving the given URL: the
    /// first registered match, or the fallback.
    #[must_use]
    pub fn resolver_for(&self, url: &Url) -> Arc<dyn Provider> {
        self.providers
            .iter()
            .find(|provider| provider.can_resolve(url))
            .unwrap_or(&self.fallback)
            .clone()
    }

    /// The last-resort provider.
    #[must_use]
    pub fn fallback(&self) -> &Arc<dyn Provider> {
        &self.fallback
    }

    /// Iterates over every provider in dispatch order, fallback last.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Provider>> {
        self.providers.iter().chain(std::iter::once(&self.fallback))
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|provider| provider.name()).collect();
        f.debug_struct("ProviderRegistry")
            .field("providers", &names)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::provider::Resolution;
    use crate::request::Request;

    struct MockProvider {
        mock_name: &'static str,
        prefix: &'static str,
    }

    #[async_trait]
    impl Provider for MockProvider {
        fn name(&self) -> &'static str {
            self.mock_name
        }

        fn can_resolve(&self, url: &Url) -> bool {
            url.path().starts_with(self.prefix)
        }

        async fn resolve(&self, requests: &[std::sync::Arc<Request>]) -> Vec<Resolution> {
            requests.iter().map(|_| Resolution::Offline).collect()
        }
    }

    fn mock(name: &'static str, prefix: &'static str) -> Arc<dyn Provider> {
        Arc::new(MockProvider {
            mock_name: name,
            prefix,
        })
    }

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(mock("fallback", "/"))
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_registry_starts_with_only_the_fallback() {
        let registry = registry();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.iter().count(), 1);
    }

    #[test]
    fn test_first_registered_match_wins() {
        let mut registry = registry();
        registry.register(mock("albums", "/album"));
        registry.register(mock("albums-too", "/album"));

        let provider = registry.resolver_for(&url("https://host/album/1"));
        assert_eq!(provider.name(), "albums");
    }

    #[test]
    fn test_unmatched_url_falls_back() {
        let mut registry = registry();
        registry.register(mock("albums", "/album"));

        let provider = registry.resolver_for(&url("https://host/file.bin"));
        assert_eq!(provider.name(), "fallback");
    }

    #[test]
    fn test_by_name_includes_the_fallback() {
        let mut registry = registry();
        registry.register(mock("albums", "/album"));

        assert_eq!(registry.by_name("albums").unwrap().name(), "albums");
        assert_eq!(registry.by_name("fallback").unwrap().name(), "fallback");
        assert!(registry.by_name("nope").is_none());
    }

    #[test]
    fn test_find_by_predicate() {
        let mut registry = registry();
        registry.register(mock("albums", "/album"));

        let found = registry.find(|provider| provider.name().starts_with("alb"));
        assert_eq!(found.unwrap().name(), "albums");
    }

    #[test]
    fn test_debug_lists_provider_names() {
        let mut registry = registry();
        registry.register(mock("albums", "/album"));
        let rendered = format!("{registry:?}");
        assert!(rendered.contains("albums"));
        assert!(rendered.contains("fallback"));
    }
}
