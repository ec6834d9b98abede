//! Notification delivery.
//!
//! A [`DeliveryTarget`] sends one content item to one endpoint. The webhook
//! target applies a configurable payload format, optional token-bucket rate
//! limiting, and honours `429 retry_after` backpressure from the endpoint.
//! Targets never touch the delivery ledger; that bookkeeping belongs to the
//! fan-out engine.

pub mod format;
pub mod ratelimit;
pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

use herald_common::config::TargetConfig;
use herald_common::error::AppError;
use herald_common::types::ContentItem;

/// Successful delivery of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    /// Outbound calls made, including rate-limited ones.
    pub attempts: u32,
    /// Time spent sleeping on `retry_after` backoff.
    pub waited: Duration,
}

/// Failure to deliver one item to one target.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("failed to encode payload for item {item_id}: {source}")]
    Encode {
        item_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("request to {target} failed for item {item_id}: {source}")]
    Request {
        target: String,
        item_id: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{target} rejected item {item_id}: status={status} body={body}")]
    Rejected {
        target: String,
        item_id: String,
        status: u16,
        body: String,
    },

    #[error("{target} still rate limiting item {item_id} after {attempts} attempts and {waited:?} of backoff")]
    RetryExhausted {
        target: String,
        item_id: String,
        attempts: u32,
        waited: Duration,
    },
}

/// An endpoint that receives content items.
#[async_trait]
pub trait DeliveryTarget: Send + Sync {
    /// Send one item, waiting out rate limits as needed.
    async fn deliver(&self, item: &ContentItem) -> Result<Delivered, DeliveryError>;

    /// Stable identity used as the ledger namespace for this target.
    fn kind(&self) -> &str;

    fn group(&self) -> &str;

    /// Ledger TTL for items delivered here, overriding source and global defaults.
    fn ttl_override(&self) -> Option<Duration> {
        None
    }
}

/// Ledger identity for a configured target.
///
/// Uses the `name` option when present, otherwise the target type plus a short
/// digest of its destination so that two webhooks never share entries.
pub fn target_kind(config: &TargetConfig) -> String {
    if let Some(name) = config.option_str("name").filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    let digest = hex::encode(Sha256::digest(config.value.as_bytes()));
    format!("{}:{}", config.kind, &digest[..12])
}

/// Constructor for a configured target kind.
pub type TargetFactory =
    fn(&TargetConfig, &str, &reqwest::Client) -> Result<Arc<dyn DeliveryTarget>, AppError>;

/// Maps configuration `type` strings to delivery target constructors.
pub struct TargetRegistry {
    factories: HashMap<String, TargetFactory>,
    client: reqwest::Client,
}

impl TargetRegistry {
    /// Registry with the built-in `webhook` target.
    pub fn new() -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("herald/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::config(format!("failed to build webhook HTTP client: {e}")))?;

        let mut registry = Self {
            factories: HashMap::new(),
            client,
        };
        registry.register("webhook", webhook::WebhookTarget::factory);
        Ok(registry)
    }

    /// Add or replace the constructor for `kind`.
    pub fn register(&mut self, kind: impl Into<String>, factory: TargetFactory) {
        self.factories.insert(kind.into(), factory);
    }

    /// Build a target for `config` belonging to `group`.
    pub fn create(
        &self,
        config: &TargetConfig,
        group: &str,
    ) -> Result<Arc<dyn DeliveryTarget>, AppError> {
        let factory = self.factories.get(&config.kind).ok_or_else(|| {
            AppError::config(format!(
                "unknown target type '{}' in group {}",
                config.kind, group
            ))
        })?;

        let target = factory(config, group, &self.client)?;
        tracing::debug!(kind = %target.kind(), group, "Delivery target created");
        Ok(target)
    }
}
