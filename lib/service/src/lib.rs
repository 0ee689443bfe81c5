//! Service providers for escapement's service-call nodes.
//!
//! This crate hosts the registry of named providers the engine invokes
//! for service nodes, together with the machinery that keeps those calls
//! safe and cheap:
//!
//! - **Provider seam**: execute/validate/healthcheck/compensate plus
//!   schema and capability descriptors
//! - **Circuit breaker**: per-service, with an explicit half-open probe
//! - **Response cache**: TTL-bounded, keyed by method + endpoint + query
//! - **Built-in providers**: HTTP, REST, SOAP, and gRPC

pub mod breaker;
pub mod cache;
pub mod error;
pub mod grpc;
pub mod http;
pub mod provider;
pub mod registry;
pub mod rest;
pub mod soap;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use cache::ResponseCache;
pub use error::ServiceError;
pub use grpc::GrpcProvider;
pub use http::HttpProvider;
pub use provider::{Capabilities, ServiceProvider, ServiceRequest, ServiceResponse};
pub use registry::{ServiceRegistry, ServiceStats};
pub use rest::RestProvider;
pub use soap::SoapProvider;
