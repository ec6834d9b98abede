//! Builds the running pipeline from configuration.
//!
//! Every failure here is fatal at startup: an unreachable ledger, an unknown
//! source or target type, or invalid target options.

use std::sync::Arc;

use anyhow::Context;

use herald_common::config::{AppConfig, LedgerBackend, LedgerConfig};
use herald_common::redis_pool::create_redis_pool;
use herald_engine::{FanoutEngine, Ledger, MemoryLedger, RedisLedger, SourceScheduler};
use herald_notifier::{DeliveryTarget, TargetRegistry};
use herald_sources::{Source, SourceRegistry};

/// Open the configured ledger backend.
pub async fn connect_ledger(config: &LedgerConfig) -> anyhow::Result<Arc<dyn Ledger>> {
    match config.backend {
        LedgerBackend::Redis => {
            let conn = create_redis_pool(&config.connection_url())
                .await
                .context("failed to connect to the delivery ledger")?;
            tracing::info!(
                ttl_secs = config.ttl_secs,
                address = %config.address,
                db = config.db,
                "Using Redis delivery ledger"
            );
            Ok(Arc::new(RedisLedger::new(conn, config.default_ttl())))
        }
        LedgerBackend::Memory => {
            tracing::warn!(
                ttl_secs = config.ttl_secs,
                "Using in-memory delivery ledger; delivered items will be resent after a restart"
            );
            Ok(Arc::new(MemoryLedger::new(config.default_ttl())))
        }
    }
}

/// Create every configured source and target and wire them into a scheduler.
pub fn build_scheduler(
    config: &AppConfig,
    ledger: Arc<dyn Ledger>,
    sources: &SourceRegistry,
    targets: &TargetRegistry,
) -> anyhow::Result<SourceScheduler> {
    let mut all_sources: Vec<Arc<dyn Source>> = Vec::new();
    let mut all_targets: Vec<Arc<dyn DeliveryTarget>> = Vec::new();

    for group in &config.groups {
        for source in &group.sources {
            all_sources.push(sources.create(source, &group.name)?);
        }
        for target in &group.targets {
            all_targets.push(targets.create(target, &group.name)?);
        }
        tracing::info!(
            group = %group.name,
            sources = group.sources.len(),
            targets = group.targets.len(),
            "Group configured"
        );
    }

    let fanout = FanoutEngine::new(
        ledger.clone(),
        config.fanout.max_concurrency,
        config.redis.claim_lease(),
    );
    let scheduler = SourceScheduler::new(fanout, all_sources, all_targets);

    Ok(match config.redis.sweep_interval() {
        Some(interval) => scheduler.with_sweeper(ledger, interval),
        None => scheduler,
    })
}
