//! The service-provider registry.
//!
//! Named providers register here; the engine's service nodes execute
//! through [`ServiceRegistry::execute`], which runs the full protection
//! path: validate → cache lookup → circuit breaker → retry → record
//! metrics → cache store.

use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::cache::ResponseCache;
use crate::error::ServiceError;
use crate::provider::{Capabilities, ServiceProvider, ServiceRequest, ServiceResponse};
use escapement_core::retry::{RetryExecutor, RetryPolicy};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Rolled-up outcome counters for one service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceStats {
    /// Calls attempted (after cache hits).
    pub calls: u64,
    /// Calls that failed after retries.
    pub failures: u64,
    /// Calls served from the cache.
    pub cache_hits: u64,
    /// Total time spent in successful calls, in milliseconds.
    pub total_duration_ms: u64,
    /// Calls currently in flight.
    pub in_flight: u32,
}

/// Registry of named service providers with shared protections.
pub struct ServiceRegistry {
    providers: RwLock<HashMap<String, Arc<dyn ServiceProvider>>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    breaker_config: BreakerConfig,
    cache: ResponseCache,
    retry: RetryExecutor,
    stats: RwLock<HashMap<String, ServiceStats>>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    /// Creates an empty registry with default breaker and retry policies.
    #[must_use]
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            breaker_config: BreakerConfig::default(),
            cache: ResponseCache::new(),
            retry: RetryExecutor::new(RetryPolicy::default()),
            stats: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a registry with the built-in providers registered.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(crate::http::HttpProvider::new()));
        registry.register(Arc::new(crate::rest::RestProvider::new()));
        registry.register(Arc::new(crate::soap::SoapProvider::new()));
        registry.register(Arc::new(crate::grpc::GrpcProvider::new()));
        registry
    }

    /// Overrides the breaker configuration for services seen later.
    #[must_use]
    pub fn with_breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetryExecutor::new(policy);
        self
    }

    /// Registers a provider under its own name, replacing any previous
    /// registration.
    pub fn register(&self, provider: Arc<dyn ServiceProvider>) {
        let name = provider.name().to_string();
        debug!(provider = %name, "service provider registered");
        self.providers
            .write()
            .expect("provider lock")
            .insert(name, provider);
    }

    /// Looks up a provider.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::ProviderNotFound`] for unknown names.
    pub fn get(&self, name: &str) -> Result<Arc<dyn ServiceProvider>, ServiceError> {
        self.providers
            .read()
            .expect("provider lock")
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::ProviderNotFound {
                name: name.to_string(),
            })
    }

    /// Lists every registered provider's capabilities.
    #[must_use]
    pub fn discover(&self) -> Vec<Capabilities> {
        let mut capabilities: Vec<Capabilities> = self
            .providers
            .read()
            .expect("provider lock")
            .values()
            .map(|p| p.capabilities())
            .collect();
        capabilities.sort_by(|a, b| a.name.cmp(&b.name));
        capabilities
    }

    /// Probes every provider's health.
    pub async fn healthcheck_all(&self) -> HashMap<String, bool> {
        let providers: Vec<Arc<dyn ServiceProvider>> = self
            .providers
            .read()
            .expect("provider lock")
            .values()
            .cloned()
            .collect();

        let mut results = HashMap::new();
        for provider in providers {
            let healthy = provider.healthcheck().await.is_ok();
            results.insert(provider.name().to_string(), healthy);
        }
        results
    }

    /// Returns the breaker state for a service, if one exists yet.
    #[must_use]
    pub fn breaker_state(&self, service: &str) -> Option<CircuitState> {
        self.breakers
            .lock()
            .expect("breaker map lock")
            .get(service)
            .map(|b| b.state())
    }

    /// Returns a copy of the per-service stats.
    #[must_use]
    pub fn stats(&self) -> HashMap<String, ServiceStats> {
        self.stats.read().expect("stats lock").clone()
    }

    fn breaker_for(&self, service: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .expect("breaker map lock")
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(service, self.breaker_config.clone()))
            })
            .clone()
    }

    fn record_outcome(&self, service: &str, duration: Option<Duration>, failed: bool) {
        let mut stats = self.stats.write().expect("stats lock");
        let entry = stats.entry(service.to_string()).or_default();
        entry.calls += 1;
        entry.in_flight = entry.in_flight.saturating_sub(1);
        if failed {
            entry.failures += 1;
        } else if let Some(duration) = duration {
            entry.total_duration_ms += u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        }
    }

    /// Executes a request through the named provider.
    ///
    /// # Errors
    ///
    /// Propagates validation failures, circuit denial, and the last
    /// provider error after retries.
    pub async fn execute(
        &self,
        provider_name: &str,
        request: &ServiceRequest,
    ) -> Result<ServiceResponse, ServiceError> {
        let provider = self.get(provider_name)?;
        provider.validate(request)?;

        let cache_key = request.cache_ttl.map(|_| ResponseCache::key_for(request));
        if let Some(key) = &cache_key
            && let Some(hit) = self.cache.get(key)
        {
            let mut stats = self.stats.write().expect("stats lock");
            stats.entry(request.service.clone()).or_default().cache_hits += 1;
            return Ok(hit);
        }

        let breaker = self.breaker_for(&request.service);
        breaker.allow()?;

        {
            let mut stats = self.stats.write().expect("stats lock");
            stats.entry(request.service.clone()).or_default().in_flight += 1;
        }

        let provider_for_retry = provider.clone();
        let owned_request = request.clone();
        let result = self
            .retry
            .run(move |_attempt| {
                let provider = provider_for_retry.clone();
                let request = owned_request.clone();
                async move { provider.execute(&request).await }
            })
            .await;

        match &result {
            Ok(response) => {
                breaker.record_success();
                self.record_outcome(&request.service, Some(response.duration), false);
                if let Some(key) = cache_key
                    && let Some(ttl) = request.cache_ttl
                {
                    self.cache.put(key, response.clone(), ttl);
                }
            }
            Err(error) => {
                breaker.record_failure();
                self.record_outcome(&request.service, None, true);
                warn!(
                    service = %request.service,
                    provider = provider_name,
                    error = %error,
                    "service call failed"
                );
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{Value as JsonValue, json};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Provider that fails a configurable number of times, counting calls.
    struct FlakyProvider {
        name: String,
        fail_first: u32,
        calls: AtomicU32,
    }

    impl FlakyProvider {
        fn new(name: &str, fail_first: u32) -> Self {
            Self {
                name: name.to_string(),
                fail_first,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ServiceProvider for FlakyProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(
            &self,
            _request: &ServiceRequest,
        ) -> Result<ServiceResponse, ServiceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                Err(ServiceError::Network {
                    message: format!("boom {call}"),
                })
            } else {
                Ok(ServiceResponse {
                    status: 200,
                    body: json!({"call": call}),
                    headers: HashMap::new(),
                    duration: Duration::from_millis(1),
                    from_cache: false,
                })
            }
        }

        fn validate(&self, _request: &ServiceRequest) -> Result<(), ServiceError> {
            Ok(())
        }

        fn schema(&self) -> JsonValue {
            json!({})
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                name: self.name.clone(),
                protocols: vec!["test".to_string()],
                supports_compensation: false,
                supports_healthcheck: true,
            }
        }
    }

    fn no_retry_registry() -> ServiceRegistry {
        ServiceRegistry::new()
            .with_retry_policy(RetryPolicy::no_retry())
            .with_breaker_config(
                BreakerConfig::default().with_reset_timeout(Duration::from_millis(30)),
            )
    }

    #[tokio::test]
    async fn breaker_short_circuits_after_sustained_failure() {
        let registry = no_retry_registry();
        let provider = Arc::new(FlakyProvider::new("flaky", u32::MAX));
        registry.register(provider.clone());

        let request = ServiceRequest::new("downstream", "https://x", "GET");

        // First three calls reach the provider and fail.
        for _ in 0..3 {
            let err = registry.execute("flaky", &request).await.unwrap_err();
            assert!(matches!(err, ServiceError::Network { .. }));
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);

        // Fourth is denied by the breaker without touching the provider.
        let err = registry.execute("flaky", &request).await.unwrap_err();
        assert!(matches!(err, ServiceError::CircuitOpen { .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            registry.breaker_state("downstream"),
            Some(CircuitState::Open)
        );

        // After the reset timeout a single probe goes through.
        tokio::time::sleep(Duration::from_millis(40)).await;
        let err = registry.execute("flaky", &request).await.unwrap_err();
        assert!(matches!(err, ServiceError::Network { .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cache_serves_repeated_calls() {
        let registry = no_retry_registry();
        let provider = Arc::new(FlakyProvider::new("steady", 0));
        registry.register(provider.clone());

        let request = ServiceRequest::new("cached", "https://x", "GET")
            .with_cache_ttl(Duration::from_secs(60));

        let first = registry.execute("steady", &request).await.unwrap();
        assert!(!first.from_cache);

        let second = registry.execute("steady", &request).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        let stats = registry.stats();
        assert_eq!(stats["cached"].cache_hits, 1);
    }

    #[tokio::test]
    async fn retry_recovers_transient_failures() {
        let registry = ServiceRegistry::new().with_retry_policy(
            RetryPolicy::fixed(Duration::from_millis(1), 3).with_jitter(false),
        );
        let provider = Arc::new(FlakyProvider::new("recovering", 2));
        registry.register(provider.clone());

        let request = ServiceRequest::new("svc", "https://x", "GET");
        let response = registry.execute("recovering", &request).await.unwrap();
        assert_eq!(response.body["call"], 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);

        // One logical call, zero failures.
        let stats = registry.stats();
        assert_eq!(stats["svc"].calls, 1);
        assert_eq!(stats["svc"].failures, 0);
    }

    #[tokio::test]
    async fn unknown_provider_is_reported() {
        let registry = ServiceRegistry::new();
        let request = ServiceRequest::new("s", "https://x", "GET");
        let err = registry.execute("nope", &request).await.unwrap_err();
        assert!(matches!(err, ServiceError::ProviderNotFound { .. }));
    }

    #[test]
    fn builtins_discoverable() {
        let registry = ServiceRegistry::with_builtins();
        let names: Vec<String> = registry.discover().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["grpc", "http", "rest", "soap"]);
    }
}
