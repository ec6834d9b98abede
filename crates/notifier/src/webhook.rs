//! HTTP webhook delivery target.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use herald_common::config::TargetConfig;
use herald_common::error::AppError;
use herald_common::types::ContentItem;

use crate::format::PayloadFormat;
use crate::ratelimit::TokenBucket;
use crate::{Delivered, DeliveryError, DeliveryTarget, target_kind};

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_MAX_RETRY_WAIT_SECS: u64 = 60;

/// Longest response body kept in a [`DeliveryError::Rejected`].
const MAX_ERROR_BODY: usize = 512;

/// Rate-limit response body. Only `retry_after` is required.
#[derive(Debug, Deserialize)]
struct RateLimited {
    retry_after: f64,
}

/// POSTs each item as JSON to a single URL.
pub struct WebhookTarget {
    kind: String,
    group: String,
    url: String,
    format: PayloadFormat,
    limiter: Option<TokenBucket>,
    client: reqwest::Client,
    timeout: Duration,
    ttl: Option<Duration>,
    max_attempts: u32,
    max_wait: Duration,
}

impl WebhookTarget {
    /// Build from a `type = "webhook"` target entry.
    ///
    /// Understood options: `format`, `requests_per_second`, `ttl_secs`, `name`,
    /// `max_attempts`, `max_retry_wait_secs`, `timeout_secs`.
    pub fn new(
        config: &TargetConfig,
        group: &str,
        client: reqwest::Client,
    ) -> Result<Self, AppError> {
        let url = reqwest::Url::parse(&config.value).map_err(|e| {
            AppError::config(format!("invalid webhook URL in group {}: {}", group, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::config(format!(
                "webhook URL must be http or https in group {}",
                group
            )));
        }

        let format = PayloadFormat::from_option(config.option_str("format"))?;

        let limiter = if config.options.contains_key("requests_per_second") {
            let rate = config.option_f64("requests_per_second").ok_or_else(|| {
                AppError::config(format!(
                    "requests_per_second must be a number in group {}",
                    group
                ))
            })?;
            Some(TokenBucket::new(rate)?)
        } else {
            None
        };

        let max_attempts = config
            .option_u64("max_attempts")
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            return Err(AppError::config(format!(
                "max_attempts must be at least 1 in group {}",
                group
            )));
        }

        Ok(Self {
            kind: target_kind(config),
            group: group.to_string(),
            url: config.value.clone(),
            format,
            limiter,
            client,
            timeout: Duration::from_secs(
                config
                    .option_u64("timeout_secs")
                    .filter(|s| *s > 0)
                    .unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
            ttl: config
                .option_u64("ttl_secs")
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
            max_attempts,
            max_wait: Duration::from_secs(
                config
                    .option_u64("max_retry_wait_secs")
                    .unwrap_or(DEFAULT_MAX_RETRY_WAIT_SECS),
            ),
        })
    }

    /// [`TargetFactory`](crate::TargetFactory) entry for the registry.
    pub fn factory(
        config: &TargetConfig,
        group: &str,
        client: &reqwest::Client,
    ) -> Result<Arc<dyn DeliveryTarget>, AppError> {
        Ok(Arc::new(Self::new(config, group, client.clone())?))
    }

    /// Backoff requested by a 429 body, if it carries a usable `retry_after`.
    fn retry_after(body: &str) -> Option<Duration> {
        let parsed: RateLimited = serde_json::from_str(body).ok()?;
        Duration::try_from_secs_f64(parsed.retry_after).ok()
    }

    fn truncate(mut body: String) -> String {
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
            body.push_str("...");
        }
        body
    }
}

#[async_trait]
impl DeliveryTarget for WebhookTarget {
    async fn deliver(&self, item: &ContentItem) -> Result<Delivered, DeliveryError> {
        let payload = self
            .format
            .render(item)
            .map_err(|source| DeliveryError::Encode {
                item_id: item.id.clone(),
                source,
            })?;

        let mut attempts = 0u32;
        let mut waited = Duration::ZERO;

        loop {
            if let Some(limiter) = &self.limiter {
                limiter.admit().await;
            }

            attempts += 1;
            let response = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(payload.clone())
                .send()
                .await
                .map_err(|source| DeliveryError::Request {
                    target: self.kind.clone(),
                    item_id: item.id.clone(),
                    source: source.without_url(),
                })?;

            let status = response.status();
            if status.is_success() {
                tracing::info!(
                    target_kind = %self.kind,
                    item_id = %item.id,
                    attempts,
                    "Sent webhook"
                );
                return Ok(Delivered { attempts, waited });
            }

            let body = response.text().await.unwrap_or_default();

            if status == StatusCode::TOO_MANY_REQUESTS
                && let Some(delay) = Self::retry_after(&body)
            {
                if attempts >= self.max_attempts || waited + delay > self.max_wait {
                    tracing::warn!(
                        target_kind = %self.kind,
                        item_id = %item.id,
                        attempts,
                        waited_ms = waited.as_millis() as u64,
                        "Rate limit retries exhausted"
                    );
                    return Err(DeliveryError::RetryExhausted {
                        target: self.kind.clone(),
                        item_id: item.id.clone(),
                        attempts,
                        waited,
                    });
                }

                tracing::debug!(
                    target_kind = %self.kind,
                    item_id = %item.id,
                    retry_after_ms = delay.as_millis() as u64,
                    attempts,
                    "Rate limit hit, waiting before retry"
                );
                tokio::time::sleep(delay).await;
                waited += delay;
                continue;
            }

            return Err(DeliveryError::Rejected {
                target: self.kind.clone(),
                item_id: item.id.clone(),
                status: status.as_u16(),
                body: Self::truncate(body),
            });
        }
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn group(&self) -> &str {
        &self.group
    }

    fn ttl_override(&self) -> Option<Duration> {
        self.ttl
    }
}
