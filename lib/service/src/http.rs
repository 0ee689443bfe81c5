//! The HTTP service provider.

use crate::error::ServiceError;
use crate::provider::{Capabilities, ServiceProvider, ServiceRequest, ServiceResponse};
use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

/// Provider that issues plain HTTP requests with JSON bodies.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    name: String,
    client: reqwest::Client,
}

impl Default for HttpProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpProvider {
    /// Creates the provider under its default name, `http`.
    #[must_use]
    pub fn new() -> Self {
        Self::named("http")
    }

    /// Creates the provider under a custom name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Creates the provider over an existing client.
    #[must_use]
    pub fn with_client(name: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }

    /// Maps a transport error onto the retryable error taxonomy.
    pub(crate) fn classify(error: &reqwest::Error) -> ServiceError {
        if error.is_timeout() {
            ServiceError::Timeout
        } else {
            // Connect refusals, resets, and truncated responses all look
            // alike from here: transient transport failures.
            ServiceError::Network {
                message: error.to_string(),
            }
        }
    }

    pub(crate) async fn send(
        &self,
        request: &ServiceRequest,
    ) -> Result<ServiceResponse, ServiceError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|_| {
            ServiceError::InvalidRequest {
                reason: format!("bad HTTP method '{}'", request.method),
            }
        })?;

        let mut builder = self.client.request(method, &request.endpoint);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(|e| Self::classify(&e))?;
        let status = response.status().as_u16();

        let mut headers = HashMap::new();
        for (key, value) in response.headers() {
            if let Ok(text) = value.to_str() {
                headers.insert(key.as_str().to_string(), text.to_string());
            }
        }

        // Whatever comes back is the payload: a non-2xx with a decodable
        // body is a result, not a transport failure, and is never retried.
        let text = response.text().await.map_err(|e| Self::classify(&e))?;
        let body = if text.is_empty() {
            JsonValue::Null
        } else {
            serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
        };

        let duration = started.elapsed();
        debug!(
            provider = %self.name,
            endpoint = %request.endpoint,
            status,
            duration_ms = duration.as_millis() as u64,
            "http call finished"
        );

        Ok(ServiceResponse {
            status,
            body,
            headers,
            duration,
            from_cache: false,
        })
    }
}

#[async_trait]
impl ServiceProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: &ServiceRequest) -> Result<ServiceResponse, ServiceError> {
        self.send(request).await
    }

    fn validate(&self, request: &ServiceRequest) -> Result<(), ServiceError> {
        if !request.endpoint.starts_with("http://") && !request.endpoint.starts_with("https://") {
            return Err(ServiceError::InvalidRequest {
                reason: format!("endpoint '{}' is not an HTTP URL", request.endpoint),
            });
        }
        reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|_| {
            ServiceError::InvalidRequest {
                reason: format!("bad HTTP method '{}'", request.method),
            }
        })?;
        Ok(())
    }

    fn schema(&self) -> JsonValue {
        json!({
            "type": "object",
            "required": ["endpoint", "method"],
            "properties": {
                "endpoint": { "type": "string", "format": "uri" },
                "method": { "type": "string" },
                "headers": { "type": "object" },
                "params": { "type": "object" },
                "body": {}
            }
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            name: self.name.clone(),
            protocols: vec!["http".to_string(), "https".to_string()],
            supports_compensation: false,
            supports_healthcheck: false,
        }
    }
}
