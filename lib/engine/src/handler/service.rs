//! Service handler: bridges service nodes to the provider registry.
//!
//! The registry owns retrying, the circuit breaker, and the response
//! cache; this handler shapes the request from node configuration and
//! process variables, and turns the outcome into node-level effects and
//! events.

use crate::context::EngineContext;
use crate::error::EngineError;
use crate::handler::{HandlerCore, HandlerResult, NodeHandler, render_template};
use async_trait::async_trait;
use chrono::Utc;
use escapement_core::{Coded, ErrorCode};
use escapement_flow::{EngineEvent, NodeInstance, NodeKind, ProcessInstance, Variables};
use escapement_service::ServiceRequest;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Invokes external services for service nodes.
pub struct ServiceHandler {
    core: HandlerCore,
}

impl ServiceHandler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: HandlerCore::new("service"),
        }
    }

    fn build_request(
        config: &escapement_flow::ServiceConfig,
        node_key: &str,
        variables: &Variables,
    ) -> Result<ServiceRequest, EngineError> {
        let render = |input: &str| {
            render_template(input, variables).map_err(|missing| EngineError::ValidationFailed {
                reason: format!("service '{node_key}' references unknown variable '{missing}'"),
            })
        };

        let mut request = ServiceRequest::new(
            format!("{}:{}", config.provider, config.endpoint),
            render(&config.endpoint)?,
            config.method.clone(),
        );
        for (key, value) in &config.headers {
            request.headers.insert(key.clone(), render(value)?);
        }
        for (key, value) in &config.params {
            request.params.insert(key.clone(), render(value)?);
        }
        request.body = config.body.clone();
        if let Some(timeout_ms) = config.timeout_ms {
            request.timeout = Some(Duration::from_millis(timeout_ms));
        }
        if config.cache_enabled && config.cache_ttl_ms > 0 {
            request.cache_ttl = Some(Duration::from_millis(config.cache_ttl_ms));
        }
        Ok(request)
    }
}

impl Default for ServiceHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeHandler for ServiceHandler {
    fn kind(&self) -> &'static str {
        "service"
    }

    fn core(&self) -> &HandlerCore {
        &self.core
    }

    async fn execute(
        &self,
        ctx: &Arc<EngineContext>,
        process: &ProcessInstance,
        node: &NodeInstance,
    ) -> Result<HandlerResult, EngineError> {
        let NodeKind::Service(config) = node.kind() else {
            return Err(EngineError::System {
                message: format!("service handler given a {} node", node.kind().name()),
            });
        };

        let request = Self::build_request(config, node.node_key(), &process.variables)?;
        let provider = config.provider.clone();

        let outcome = ctx.services.execute(&provider, &request).await;

        match outcome {
            Ok(response) => {
                ctx.publish(EngineEvent::ServiceMetrics {
                    provider: provider.clone(),
                    duration_ms: u64::try_from(response.duration.as_millis()).unwrap_or(u64::MAX),
                    success: true,
                    at: Utc::now(),
                })
                .await;
                debug!(
                    node_key = node.node_key(),
                    provider = %provider,
                    status = response.status,
                    from_cache = response.from_cache,
                    "service call finished"
                );

                let mut variables = Variables::new();
                variables.insert(
                    format!("{}_result", node.node_key()),
                    response.body.clone(),
                );
                variables.insert(
                    format!("{}_status", node.node_key()),
                    JsonValue::from(response.status),
                );

                self.core.record(node.node_key(), true);
                Ok(HandlerResult::completed().with_variables(variables))
            }
            Err(error) => {
                let event = match error.code() {
                    ErrorCode::Timeout => EngineEvent::ServiceTimeout {
                        process_id: process.id,
                        node_key: node.node_key().to_string(),
                        provider: provider.clone(),
                        at: Utc::now(),
                    },
                    _ => EngineEvent::ServiceError {
                        process_id: process.id,
                        node_key: node.node_key().to_string(),
                        provider: provider.clone(),
                        error: error.to_string(),
                        at: Utc::now(),
                    },
                };
                ctx.publish(event).await;
                ctx.publish(EngineEvent::ServiceMetrics {
                    provider,
                    duration_ms: 0,
                    success: false,
                    at: Utc::now(),
                })
                .await;

                self.core.record(node.node_key(), false);
                Err(EngineError::from(error))
            }
        }
    }

    async fn cancel(
        &self,
        ctx: &Arc<EngineContext>,
        process: &ProcessInstance,
        node: &NodeInstance,
    ) -> Result<(), EngineError> {
        let NodeKind::Service(config) = node.kind() else {
            return Ok(());
        };
        ctx.publish(EngineEvent::ServiceCancelled {
            process_id: process.id,
            node_key: node.node_key().to_string(),
            provider: config.provider.clone(),
            at: Utc::now(),
        })
        .await;
        Ok(())
    }

    async fn rollback(
        &self,
        ctx: &Arc<EngineContext>,
        process: &ProcessInstance,
        node: &NodeInstance,
    ) -> Result<(), EngineError> {
        let NodeKind::Service(config) = node.kind() else {
            return Ok(());
        };
        // Best-effort compensation where the provider supports it.
        let request = Self::build_request(config, node.node_key(), &process.variables)?;
        if let Ok(provider) = ctx.services.get(&config.provider)
            && provider.capabilities().supports_compensation
        {
            provider.compensate(&request).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use escapement_flow::ServiceConfig;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};

    fn config() -> ServiceConfig {
        ServiceConfig {
            provider: "http".to_string(),
            endpoint: "https://api/$tenant/orders".to_string(),
            method: "POST".to_string(),
            headers: HashMap::from([("x-actor".to_string(), "$actor".to_string())]),
            params: BTreeMap::from([("limit".to_string(), "10".to_string())]),
            body: Some(json!({"kind": "sync"})),
            cache_enabled: true,
            cache_ttl_ms: 5_000,
            retry: None,
            timeout_ms: Some(2_000),
        }
    }

    #[test]
    fn request_interpolates_variables() {
        let mut variables = Variables::new();
        variables.insert("tenant".to_string(), json!("acme"));
        variables.insert("actor".to_string(), json!("u1"));

        let request = ServiceHandler::build_request(&config(), "call", &variables).unwrap();
        assert_eq!(request.endpoint, "https://api/acme/orders");
        assert_eq!(request.headers.get("x-actor").map(String::as_str), Some("u1"));
        assert_eq!(request.timeout, Some(Duration::from_secs(2)));
        assert_eq!(request.cache_ttl, Some(Duration::from_secs(5)));
    }

    #[test]
    fn missing_variable_is_validation_failure() {
        let variables = Variables::new();
        let err = ServiceHandler::build_request(&config(), "call", &variables).unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailed { .. }));
    }
}
