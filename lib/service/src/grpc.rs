//! The gRPC service provider.
//!
//! Issues dynamic unary calls over a tonic channel with a JSON codec:
//! node configuration supplies the full method path
//! (`package.Service/Method`) and a JSON payload, and the peer is expected
//! to speak JSON-encoded messages (gateway or reflection-style services).
//! Channels are cached per endpoint and connect lazily.

use crate::error::ServiceError;
use crate::provider::{Capabilities, ServiceProvider, ServiceRequest, ServiceResponse};
use async_trait::async_trait;
use bytes::{Buf, BufMut};
use http::uri::PathAndQuery;
use serde_json::{Value as JsonValue, json};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status};

/// Codec moving `serde_json::Value` messages over the wire.
#[derive(Debug, Default, Clone)]
struct JsonCodec;

#[derive(Debug)]
struct JsonEncoder;

#[derive(Debug)]
struct JsonDecoder;

impl Encoder for JsonEncoder {
    type Item = JsonValue;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        let bytes = serde_json::to_vec(&item).map_err(|e| Status::internal(e.to_string()))?;
        dst.put_slice(&bytes);
        Ok(())
    }
}

impl Decoder for JsonDecoder {
    type Item = JsonValue;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        if !src.has_remaining() {
            return Ok(None);
        }
        let bytes = src.copy_to_bytes(src.remaining());
        let value = serde_json::from_slice(&bytes).map_err(|e| Status::internal(e.to_string()))?;
        Ok(Some(value))
    }
}

impl Codec for JsonCodec {
    type Encode = JsonValue;
    type Decode = JsonValue;
    type Encoder = JsonEncoder;
    type Decoder = JsonDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        JsonEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        JsonDecoder
    }
}

/// Provider for unary gRPC calls.
#[derive(Debug, Default)]
pub struct GrpcProvider {
    channels: Mutex<HashMap<String, Channel>>,
}

impl GrpcProvider {
    /// Creates the provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn channel_for(&self, endpoint: &str) -> Result<Channel, ServiceError> {
        let mut channels = self.channels.lock().expect("channel cache lock");
        if let Some(channel) = channels.get(endpoint) {
            return Ok(channel.clone());
        }
        let channel = Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| ServiceError::InvalidRequest {
                reason: format!("bad gRPC endpoint '{endpoint}': {e}"),
            })?
            .connect_lazy();
        channels.insert(endpoint.to_string(), channel.clone());
        Ok(channel)
    }

    fn classify(status: &Status) -> ServiceError {
        match status.code() {
            Code::DeadlineExceeded => ServiceError::Timeout,
            Code::Unavailable => ServiceError::Network {
                message: status.message().to_string(),
            },
            _ => ServiceError::Execution {
                message: format!("{}: {}", status.code(), status.message()),
            },
        }
    }
}

#[async_trait]
impl ServiceProvider for GrpcProvider {
    fn name(&self) -> &str {
        "grpc"
    }

    async fn execute(&self, request: &ServiceRequest) -> Result<ServiceResponse, ServiceError> {
        self.validate(request)?;

        let channel = self.channel_for(&request.endpoint)?;
        let mut grpc = Grpc::new(channel);
        grpc.ready().await.map_err(|e| ServiceError::Network {
            message: e.to_string(),
        })?;

        let path = PathAndQuery::from_maybe_shared(format!(
            "/{}",
            request.method.trim_start_matches('/')
        ))
        .map_err(|e| ServiceError::InvalidRequest {
            reason: format!("bad method path '{}': {e}", request.method),
        })?;

        let payload = request.body.clone().unwrap_or(JsonValue::Null);
        let mut outgoing = Request::new(payload);
        if let Some(timeout) = request.timeout {
            outgoing.set_timeout(timeout);
        }

        let started = Instant::now();
        let response = grpc
            .unary(outgoing, path, JsonCodec)
            .await
            .map_err(|status| Self::classify(&status))?;

        Ok(ServiceResponse {
            status: 200,
            body: response.into_inner(),
            headers: HashMap::new(),
            duration: started.elapsed(),
            from_cache: false,
        })
    }

    fn validate(&self, request: &ServiceRequest) -> Result<(), ServiceError> {
        if !request.endpoint.starts_with("http://") && !request.endpoint.starts_with("https://") {
            return Err(ServiceError::InvalidRequest {
                reason: format!("endpoint '{}' is not a gRPC URL", request.endpoint),
            });
        }
        let method = request.method.trim_start_matches('/');
        let mut parts = method.splitn(2, '/');
        let service = parts.next().unwrap_or_default();
        let rpc = parts.next().unwrap_or_default();
        if service.is_empty() || rpc.is_empty() {
            return Err(ServiceError::InvalidRequest {
                reason: format!(
                    "method '{}' is not of the form package.Service/Method",
                    request.method
                ),
            });
        }
        Ok(())
    }

    fn schema(&self) -> JsonValue {
        json!({
            "type": "object",
            "required": ["endpoint", "method"],
            "properties": {
                "endpoint": { "type": "string", "format": "uri" },
                "method": {
                    "type": "string",
                    "description": "Full method path: package.Service/Method"
                },
                "body": { "description": "JSON-encoded request message" }
            }
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            name: "grpc".to_string(),
            protocols: vec!["grpc".to_string()],
            supports_compensation: false,
            supports_healthcheck: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_service_and_method() {
        let provider = GrpcProvider::new();

        let ok = ServiceRequest::new("s", "http://grpc:50051", "billing.Invoices/Get");
        assert!(provider.validate(&ok).is_ok());

        let missing_method = ServiceRequest::new("s", "http://grpc:50051", "billing.Invoices");
        assert!(provider.validate(&missing_method).is_err());

        let bad_endpoint = ServiceRequest::new("s", "grpc:50051", "billing.Invoices/Get");
        assert!(provider.validate(&bad_endpoint).is_err());
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            GrpcProvider::classify(&Status::deadline_exceeded("late")),
            ServiceError::Timeout
        );
        assert!(matches!(
            GrpcProvider::classify(&Status::unavailable("down")),
            ServiceError::Network { .. }
        ));
        assert!(matches!(
            GrpcProvider::classify(&Status::invalid_argument("bad")),
            ServiceError::Execution { .. }
        ));
    }

    #[tokio::test]
    async fn channel_cache_reuses_endpoints() {
        let provider = GrpcProvider::new();
        provider.channel_for("http://grpc:50051").unwrap();
        provider.channel_for("http://grpc:50051").unwrap();
        assert_eq!(provider.channels.lock().unwrap().len(), 1);
    }
}
