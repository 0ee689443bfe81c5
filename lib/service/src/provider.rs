//! The service-provider seam.

use crate::error::ServiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// A request to an external service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    /// Logical service name; keys the circuit breaker and metrics.
    pub service: String,
    /// Endpoint to call.
    pub endpoint: String,
    /// Method or operation (`GET`, `POST`, `pkg.Svc/Method`, a SOAP
    /// action, …).
    pub method: String,
    /// Headers merged into the outgoing request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Query or call parameters; ordered so cache keys are stable.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Request body.
    #[serde(default)]
    pub body: Option<JsonValue>,
    /// Per-call deadline.
    #[serde(default, with = "opt_duration_millis")]
    pub timeout: Option<Duration>,
    /// Serve repeated identical calls from the response cache for this
    /// long; `None` bypasses the cache.
    #[serde(default, with = "opt_duration_millis")]
    pub cache_ttl: Option<Duration>,
}

impl ServiceRequest {
    /// Creates a request with the given coordinates.
    #[must_use]
    pub fn new(
        service: impl Into<String>,
        endpoint: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            endpoint: endpoint.into(),
            method: method.into(),
            headers: HashMap::new(),
            params: BTreeMap::new(),
            body: None,
            timeout: None,
            cache_ttl: None,
        }
    }

    /// Attaches a body.
    #[must_use]
    pub fn with_body(mut self, body: JsonValue) -> Self {
        self.body = Some(body);
        self
    }

    /// Attaches a parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Attaches a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets the per-call deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enables response caching with the given lifetime.
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }
}

/// The response from an external service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    /// Protocol status (HTTP status, gRPC code as u16, …).
    pub status: u16,
    /// Decoded body. Non-JSON payloads arrive as a string value.
    pub body: JsonValue,
    /// Response headers or trailing metadata.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// How long the call took.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// True when served from the response cache.
    #[serde(default)]
    pub from_cache: bool,
}

impl ServiceResponse {
    /// Returns true for 2xx statuses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// What a provider can do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Registered name.
    pub name: String,
    /// Protocols the provider speaks.
    pub protocols: Vec<String>,
    /// Whether [`ServiceProvider::compensate`] does anything.
    pub supports_compensation: bool,
    /// Whether [`ServiceProvider::healthcheck`] probes anything real.
    pub supports_healthcheck: bool,
}

/// A named provider the registry can invoke.
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    /// Returns the provider's registered name.
    fn name(&self) -> &str;

    /// Executes a request.
    async fn execute(&self, request: &ServiceRequest) -> Result<ServiceResponse, ServiceError>;

    /// Validates a request without executing it.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidRequest`] describing the problem.
    fn validate(&self, request: &ServiceRequest) -> Result<(), ServiceError>;

    /// Probes the provider's health.
    async fn healthcheck(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Undoes the effect of a previously executed request, where the
    /// provider knows how.
    async fn compensate(&self, request: &ServiceRequest) -> Result<(), ServiceError> {
        Err(ServiceError::NotImplemented {
            operation: format!("compensate {}", request.service),
        })
    }

    /// Describes the request shape this provider accepts.
    fn schema(&self) -> JsonValue;

    /// Describes what this provider can do.
    fn capabilities(&self) -> Capabilities;
}

/// Serde support for Duration as milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds.
mod opt_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder() {
        let request = ServiceRequest::new("billing", "https://billing/api", "POST")
            .with_param("invoice", "42")
            .with_header("x-tenant", "acme")
            .with_body(serde_json::json!({"amount": 10}))
            .with_timeout(Duration::from_secs(5));

        assert_eq!(request.service, "billing");
        assert_eq!(request.params.get("invoice").map(String::as_str), Some("42"));
        assert!(request.cache_ttl.is_none());
    }

    #[test]
    fn response_success_range() {
        let mut response = ServiceResponse {
            status: 204,
            body: JsonValue::Null,
            headers: HashMap::new(),
            duration: Duration::from_millis(3),
            from_cache: false,
        };
        assert!(response.is_success());
        response.status = 404;
        assert!(!response.is_success());
    }

    #[test]
    fn request_serde_roundtrip() {
        let request = ServiceRequest::new("s", "https://e", "GET")
            .with_cache_ttl(Duration::from_secs(30));
        let json = serde_json::to_string(&request).expect("serialize");
        let parsed: ServiceRequest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.cache_ttl, Some(Duration::from_secs(30)));
    }
}
