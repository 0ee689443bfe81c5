//! Notification handler: templated messages over pluggable channels.
//!
//! Delivery backends live outside the core; the default provider logs
//! through tracing. Each channel enforces a body-length ceiling and a
//! rolling one-minute rate window.

use crate::context::EngineContext;
use crate::error::EngineError;
use crate::handler::{HandlerCore, HandlerResult, NodeHandler, render_template};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use escapement_flow::{NodeInstance, NodeKind, NotificationChannel, ProcessInstance};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::info;

/// Sends one rendered notification.
#[async_trait]
pub trait NotificationProvider: Send + Sync {
    /// The channel this provider serves.
    fn channel(&self) -> NotificationChannel;

    /// Delivers the body to the recipients.
    async fn send(&self, recipients: &[String], body: &str) -> Result<(), EngineError>;
}

/// Default provider: logs the delivery.
pub struct TracingNotificationProvider {
    channel: NotificationChannel,
}

impl TracingNotificationProvider {
    #[must_use]
    pub fn new(channel: NotificationChannel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl NotificationProvider for TracingNotificationProvider {
    fn channel(&self) -> NotificationChannel {
        self.channel
    }

    async fn send(&self, recipients: &[String], body: &str) -> Result<(), EngineError> {
        info!(
            channel = self.channel.as_str(),
            recipients = recipients.len(),
            bytes = body.len(),
            "notification delivered"
        );
        Ok(())
    }
}

fn max_body_len(channel: NotificationChannel) -> usize {
    match channel {
        NotificationChannel::Email => 100_000,
        NotificationChannel::Sms => 500,
        NotificationChannel::Push => 1_000,
        NotificationChannel::Webhook => 1_000_000,
    }
}

fn rate_window() -> ChronoDuration {
    ChronoDuration::seconds(60)
}

/// Per-key rolling window counter.
struct RateWindow {
    max_per_window: u32,
    state: Mutex<HashMap<String, (DateTime<Utc>, u32)>>,
}

impl RateWindow {
    fn new(max_per_window: u32) -> Self {
        Self {
            max_per_window,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn check_and_increment(&self, key: &str) -> bool {
        let now = Utc::now();
        let mut state = self.state.lock().expect("rate window lock");
        let entry = state.entry(key.to_string()).or_insert((now, 0));
        if now - entry.0 >= rate_window() {
            *entry = (now, 0);
        }
        if entry.1 >= self.max_per_window {
            return false;
        }
        entry.1 += 1;
        true
    }
}

/// Default per-channel sends per minute.
const DEFAULT_RATE: u32 = 60;

/// Renders and sends notifications.
pub struct NotificationHandler {
    core: HandlerCore,
    providers: RwLock<HashMap<NotificationChannel, Arc<dyn NotificationProvider>>>,
    limiter: RateWindow,
}

impl NotificationHandler {
    #[must_use]
    pub fn new() -> Self {
        let mut providers: HashMap<NotificationChannel, Arc<dyn NotificationProvider>> =
            HashMap::new();
        for channel in [
            NotificationChannel::Email,
            NotificationChannel::Sms,
            NotificationChannel::Push,
            NotificationChannel::Webhook,
        ] {
            providers.insert(channel, Arc::new(TracingNotificationProvider::new(channel)));
        }
        Self {
            core: HandlerCore::new("notification"),
            providers: RwLock::new(providers),
            limiter: RateWindow::new(DEFAULT_RATE),
        }
    }

    /// Replaces the provider for a channel.
    pub fn set_provider(&self, provider: Arc<dyn NotificationProvider>) {
        self.providers
            .write()
            .expect("provider lock")
            .insert(provider.channel(), provider);
    }
}

impl Default for NotificationHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeHandler for NotificationHandler {
    fn kind(&self) -> &'static str {
        "notification"
    }

    fn core(&self) -> &HandlerCore {
        &self.core
    }

    async fn execute(
        &self,
        _ctx: &Arc<EngineContext>,
        process: &ProcessInstance,
        node: &NodeInstance,
    ) -> Result<HandlerResult, EngineError> {
        let NodeKind::Notification(config) = node.kind() else {
            return Err(EngineError::System {
                message: format!("notification handler given a {} node", node.kind().name()),
            });
        };

        if config.recipients.is_empty() {
            self.core.record(node.node_key(), false);
            return Err(EngineError::ValidationFailed {
                reason: format!("notification '{}' has no recipients", node.node_key()),
            });
        }

        // Node-level variables override process variables.
        let mut variables = process.variables.clone();
        for (name, value) in &config.variables {
            variables.insert(name.clone(), JsonValue::String(value.clone()));
        }

        let body = render_template(&config.template, &variables).map_err(|missing| {
            self.core.record(node.node_key(), false);
            EngineError::ValidationFailed {
                reason: format!(
                    "notification '{}' references unknown variable '{missing}'",
                    node.node_key()
                ),
            }
        })?;

        let limit = max_body_len(config.channel);
        if body.len() > limit {
            self.core.record(node.node_key(), false);
            return Err(EngineError::ValidationFailed {
                reason: format!(
                    "notification body of {} bytes exceeds the {} limit of {limit}",
                    body.len(),
                    config.channel.as_str()
                ),
            });
        }

        if !self.limiter.check_and_increment(config.channel.as_str()) {
            self.core.record(node.node_key(), false);
            return Err(EngineError::RateLimited {
                channel: config.channel.as_str().to_string(),
            });
        }

        let provider = self
            .providers
            .read()
            .expect("provider lock")
            .get(&config.channel)
            .cloned()
            .ok_or_else(|| EngineError::NotSupported {
                operation: format!("notification channel {}", config.channel.as_str()),
            })?;

        provider.send(&config.recipients, &body).await?;
        self.core.record(node.node_key(), true);
        Ok(HandlerResult::completed())
    }
}
