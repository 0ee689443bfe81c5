//! The REST service provider.
//!
//! Sugar over [`HttpProvider`]: path templates (`/invoices/{id}`) resolve
//! from request parameters, JSON accept/content headers are implied, and
//! consumed path parameters are kept out of the query string.

use crate::error::ServiceError;
use crate::http::HttpProvider;
use crate::provider::{Capabilities, ServiceProvider, ServiceRequest, ServiceResponse};
use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};

/// Provider for JSON REST APIs.
#[derive(Debug, Clone)]
pub struct RestProvider {
    inner: HttpProvider,
}

impl Default for RestProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl RestProvider {
    /// Creates the provider under its default name, `rest`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: HttpProvider::named("rest"),
        }
    }

    /// Resolves `{param}` placeholders in the endpoint, returning the
    /// resolved request with consumed parameters removed.
    fn resolve(&self, request: &ServiceRequest) -> Result<ServiceRequest, ServiceError> {
        let mut resolved = request.clone();

        while let Some(open) = resolved.endpoint.find('{') {
            let Some(close_offset) = resolved.endpoint[open..].find('}') else {
                return Err(ServiceError::InvalidRequest {
                    reason: format!("unclosed path template in '{}'", request.endpoint),
                });
            };
            let close = open + close_offset;
            let name = resolved.endpoint[open + 1..close].to_string();
            let Some(value) = resolved.params.remove(&name) else {
                return Err(ServiceError::InvalidRequest {
                    reason: format!("path parameter '{name}' has no value"),
                });
            };
            resolved
                .endpoint
                .replace_range(open..=close, value.as_str());
        }

        resolved
            .headers
            .entry("accept".to_string())
            .or_insert_with(|| "application/json".to_string());
        if resolved.body.is_some() {
            resolved
                .headers
                .entry("content-type".to_string())
                .or_insert_with(|| "application/json".to_string());
        }
        Ok(resolved)
    }
}

#[async_trait]
impl ServiceProvider for RestProvider {
    fn name(&self) -> &str {
        "rest"
    }

    async fn execute(&self, request: &ServiceRequest) -> Result<ServiceResponse, ServiceError> {
        let resolved = self.resolve(request)?;
        self.inner.send(&resolved).await
    }

    fn validate(&self, request: &ServiceRequest) -> Result<(), ServiceError> {
        let resolved = self.resolve(request)?;
        self.inner.validate(&resolved)
    }

    fn schema(&self) -> JsonValue {
        json!({
            "type": "object",
            "required": ["endpoint", "method"],
            "properties": {
                "endpoint": {
                    "type": "string",
                    "description": "URL, optionally with {param} path templates"
                },
                "method": { "type": "string" },
                "params": { "type": "object" },
                "body": {}
            }
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            name: "rest".to_string(),
            protocols: vec!["http".to_string(), "https".to_string()],
            supports_compensation: false,
            supports_healthcheck: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_template_resolution() {
        let provider = RestProvider::new();
        let request = ServiceRequest::new("s", "https://api/invoices/{id}/lines/{line}", "GET")
            .with_param("id", "42")
            .with_param("line", "7")
            .with_param("expand", "notes");

        let resolved = provider.resolve(&request).unwrap();
        assert_eq!(resolved.endpoint, "https://api/invoices/42/lines/7");
        // Path params consumed; query params kept.
        assert!(!resolved.params.contains_key("id"));
        assert_eq!(
            resolved.params.get("expand").map(String::as_str),
            Some("notes")
        );
    }

    #[test]
    fn missing_path_parameter_is_invalid() {
        let provider = RestProvider::new();
        let request = ServiceRequest::new("s", "https://api/invoices/{id}", "GET");
        assert!(matches!(
            provider.validate(&request),
            Err(ServiceError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn json_headers_implied() {
        let provider = RestProvider::new();
        let request = ServiceRequest::new("s", "https://api/x", "POST")
            .with_body(json!({"a": 1}));
        let resolved = provider.resolve(&request).unwrap();
        assert_eq!(
            resolved.headers.get("accept").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(
            resolved.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
    }
}
