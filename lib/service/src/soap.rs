//! The SOAP service provider.
//!
//! Wraps the request body in a SOAP 1.1 envelope, posts it with the
//! `SOAPAction` header, and surfaces faults as execution errors. The raw
//! response XML comes back under a `raw` key; structured decoding belongs
//! to the caller, which knows the WSDL.

use crate::error::ServiceError;
use crate::provider::{Capabilities, ServiceProvider, ServiceRequest, ServiceResponse};
use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use std::collections::HashMap;
use std::time::Instant;

/// Provider for SOAP 1.1 endpoints.
#[derive(Debug, Clone)]
pub struct SoapProvider {
    client: reqwest::Client,
}

impl Default for SoapProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SoapProvider {
    /// Creates the provider.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Builds the SOAP envelope for a request.
    ///
    /// The operation element is named by `request.method`; body object
    /// fields and parameters become child elements.
    fn envelope(request: &ServiceRequest) -> Result<String, ServiceError> {
        let mut children = String::new();

        for (key, value) in &request.params {
            children.push_str(&format!("<{key}>{}</{key}>", escape_xml(value)));
        }
        if let Some(body) = &request.body {
            let JsonValue::Object(fields) = body else {
                return Err(ServiceError::InvalidRequest {
                    reason: "SOAP body must be a JSON object".to_string(),
                });
            };
            for (key, value) in fields {
                let text = match value {
                    JsonValue::String(s) => escape_xml(s),
                    other => escape_xml(&other.to_string()),
                };
                children.push_str(&format!("<{key}>{text}</{key}>"));
            }
        }

        Ok(format!(
            concat!(
                r#"<?xml version="1.0" encoding="utf-8"?>"#,
                r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">"#,
                "<soap:Body><{operation}>{children}</{operation}></soap:Body>",
                "</soap:Envelope>"
            ),
            operation = request.method,
            children = children
        ))
    }
}

fn escape_xml(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[async_trait]
impl ServiceProvider for SoapProvider {
    fn name(&self) -> &str {
        "soap"
    }

    async fn execute(&self, request: &ServiceRequest) -> Result<ServiceResponse, ServiceError> {
        let envelope = Self::envelope(request)?;

        let mut builder = self
            .client
            .post(&request.endpoint)
            .header("content-type", "text/xml; charset=utf-8")
            .header("soapaction", request.method.as_str());
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let started = Instant::now();
        let response = builder
            .body(envelope)
            .send()
            .await
            .map_err(|e| crate::http::HttpProvider::classify(&e))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| crate::http::HttpProvider::classify(&e))?;

        if text.contains(":Fault>") || text.contains("<Fault>") {
            return Err(ServiceError::Execution {
                message: format!("SOAP fault from {}", request.endpoint),
            });
        }

        Ok(ServiceResponse {
            status,
            body: json!({ "raw": text }),
            headers: HashMap::new(),
            duration: started.elapsed(),
            from_cache: false,
        })
    }

    fn validate(&self, request: &ServiceRequest) -> Result<(), ServiceError> {
        if !request.endpoint.starts_with("http://") && !request.endpoint.starts_with("https://") {
            return Err(ServiceError::InvalidRequest {
                reason: format!("endpoint '{}' is not an HTTP URL", request.endpoint),
            });
        }
        if request.method.is_empty() {
            return Err(ServiceError::InvalidRequest {
                reason: "SOAP request names no operation".to_string(),
            });
        }
        Self::envelope(request).map(|_| ())
    }

    fn schema(&self) -> JsonValue {
        json!({
            "type": "object",
            "required": ["endpoint", "method"],
            "properties": {
                "endpoint": { "type": "string", "format": "uri" },
                "method": { "type": "string", "description": "SOAP operation / action" },
                "params": { "type": "object" },
                "body": { "type": "object" }
            }
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            name: "soap".to_string(),
            protocols: vec!["soap-1.1".to_string()],
            supports_compensation: false,
            supports_healthcheck: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wraps_operation_and_fields() {
        let request = ServiceRequest::new("s", "https://api/ws", "GetBalance")
            .with_param("account", "42")
            .with_body(json!({"currency": "EUR"}));

        let envelope = SoapProvider::envelope(&request).unwrap();
        assert!(envelope.contains("<GetBalance>"));
        assert!(envelope.contains("<account>42</account>"));
        assert!(envelope.contains("<currency>EUR</currency>"));
        assert!(envelope.contains("soap:Envelope"));
    }

    #[test]
    fn envelope_escapes_markup() {
        let request =
            ServiceRequest::new("s", "https://api/ws", "Echo").with_param("text", "a<b&c");
        let envelope = SoapProvider::envelope(&request).unwrap();
        assert!(envelope.contains("a&lt;b&amp;c"));
    }

    #[test]
    fn non_object_body_is_invalid() {
        let request =
            ServiceRequest::new("s", "https://api/ws", "Echo").with_body(json!([1, 2, 3]));
        let provider = SoapProvider::new();
        assert!(matches!(
            provider.validate(&request),
            Err(ServiceError::InvalidRequest { .. })
        ));
    }
}
