//! Fan-out engine.
//!
//! For every fetched item:
//! 1. Selects the targets configured in the item's group
//! 2. Claims each (item, target) pair in the ledger, skipping pairs already present
//! 3. Delivers the claimed pairs concurrently, bounded by a per-call semaphore
//! 4. Records successes with their TTL and releases failed claims
//!
//! One failing pair never stops its siblings. All failures from a call are
//! returned together once every pair has finished.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;

use herald_common::types::{ContentItem, FanoutSummary};
use herald_notifier::{DeliveryError, DeliveryTarget};

use crate::ledger::{Ledger, LedgerError};

/// Failure of a single (item, target) pair.
#[derive(Debug, Error)]
pub enum PairError {
    #[error("ledger {op} failed for item {item_id} on {target}: {source}")]
    Ledger {
        op: &'static str,
        item_id: String,
        target: String,
        #[source]
        source: LedgerError,
    },

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("delivery task did not complete: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Every pair failure from one fan-out call.
#[derive(Debug, Error)]
#[error("encountered {} errors during fan-out: {}", .failures.len(), join_causes(.failures))]
pub struct FanoutError {
    pub failures: Vec<PairError>,
    /// Counts for the pairs that did succeed.
    pub summary: FanoutSummary,
}

fn join_causes(failures: &[PairError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairOutcome {
    Delivered,
    Skipped,
}

/// Distributes items to the delivery targets of their group.
#[derive(Clone)]
pub struct FanoutEngine {
    ledger: Arc<dyn Ledger>,
    /// Per-call cap on in-flight pairs; 0 means unbounded.
    max_concurrency: usize,
    claim_lease: Duration,
}

impl FanoutEngine {
    /// `max_concurrency` caps in-flight pairs per call; 0 disables the cap.
    ///
    /// Each call gets its own permits, so a source stuck on slow targets never
    /// holds back another source's fan-out.
    pub fn new(ledger: Arc<dyn Ledger>, max_concurrency: usize, claim_lease: Duration) -> Self {
        Self {
            ledger,
            max_concurrency,
            claim_lease,
        }
    }

    /// Deliver `items` using each target's TTL override or the ledger default.
    pub async fn process(
        &self,
        items: &[ContentItem],
        targets: &[Arc<dyn DeliveryTarget>],
    ) -> Result<FanoutSummary, FanoutError> {
        self.process_with_ttl(items, targets, None).await
    }

    /// Deliver `items`, falling back to `source_ttl` for targets without an override.
    pub async fn process_with_ttl(
        &self,
        items: &[ContentItem],
        targets: &[Arc<dyn DeliveryTarget>],
        source_ttl: Option<Duration>,
    ) -> Result<FanoutSummary, FanoutError> {
        let permits = (self.max_concurrency > 0)
            .then(|| Arc::new(Semaphore::new(self.max_concurrency)));
        let mut tasks = JoinSet::new();

        for item in items {
            let item = Arc::new(item.clone());

            for target in targets.iter().filter(|t| t.group() == item.group) {
                let span = tracing::info_span!(
                    "delivery",
                    item_id = %item.id,
                    target_kind = %target.kind(),
                    group = %item.group,
                );
                let ledger = self.ledger.clone();
                let permits = permits.clone();
                let target = target.clone();
                let item = item.clone();
                let lease = self.claim_lease;
                let ttl = target.ttl_override().or(source_ttl);

                tasks.spawn(
                    async move {
                        // acquire only fails on a closed semaphore
                        let _permit = match permits {
                            Some(permits) => permits.acquire_owned().await.ok(),
                            None => None,
                        };
                        deliver_pair(ledger.as_ref(), target.as_ref(), &item, lease, ttl).await
                    }
                    .instrument(span),
                );
            }
        }

        let mut summary = FanoutSummary::default();
        let mut failures = Vec::new();

        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(PairError::from).and_then(|r| r) {
                Ok(PairOutcome::Delivered) => summary.delivered += 1,
                Ok(PairOutcome::Skipped) => summary.skipped += 1,
                Err(e) => failures.push(e),
            }
        }

        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(FanoutError { failures, summary })
        }
    }
}

async fn deliver_pair(
    ledger: &dyn Ledger,
    target: &dyn DeliveryTarget,
    item: &ContentItem,
    lease: Duration,
    ttl: Option<Duration>,
) -> Result<PairOutcome, PairError> {
    let ledger_err = |op: &'static str, source: LedgerError| PairError::Ledger {
        op,
        item_id: item.id.clone(),
        target: target.kind().to_string(),
        source,
    };

    let claimed = ledger
        .claim(&item.id, target.kind(), lease)
        .await
        .map_err(|e| ledger_err("claim", e))?;
    if !claimed {
        tracing::debug!("Already delivered or in flight, skipping");
        return Ok(PairOutcome::Skipped);
    }

    match target.deliver(item).await {
        Ok(delivered) => {
            ledger
                .record(&item.id, target.kind(), ttl)
                .await
                .map_err(|e| ledger_err("record", e))?;
            tracing::info!(
                attempts = delivered.attempts,
                waited_ms = delivered.waited.as_millis() as u64,
                "Item delivered"
            );
            Ok(PairOutcome::Delivered)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Delivery failed, releasing claim");
            if let Err(release_err) = ledger.release(&item.id, target.kind()).await {
                tracing::error!(
                    error = %release_err,
                    "Failed to release claim; pair is blocked until the lease expires"
                );
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use herald_notifier::Delivered;

    use crate::ledger::MemoryLedger;

    const DAY: Duration = Duration::from_secs(86_400);
    const LEASE: Duration = Duration::from_secs(300);

    /// Target that records delivered item ids and fails for selected ones.
    struct StubTarget {
        kind: String,
        group: String,
        ttl: Option<Duration>,
        fail_for: Vec<String>,
        delay: Duration,
        delivered: Mutex<Vec<String>>,
    }

    impl StubTarget {
        fn new(kind: &str, group: &str) -> Self {
            Self {
                kind: kind.to_string(),
                group: group.to_string(),
                ttl: None,
                fail_for: Vec::new(),
                delay: Duration::ZERO,
                delivered: Mutex::new(Vec::new()),
            }
        }

        fn failing_for(mut self, item_id: &str) -> Self {
            self.fail_for.push(item_id.to_string());
            self
        }

        fn slowed_by(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn with_ttl(mut self, ttl: Duration) -> Self {
            self.ttl = Some(ttl);
            self
        }

        fn delivered(&self) -> Vec<String> {
            let mut ids = self.delivered.lock().unwrap().clone();
            ids.sort();
            ids
        }
    }

    #[async_trait]
    impl DeliveryTarget for StubTarget {
        async fn deliver(&self, item: &ContentItem) -> Result<Delivered, DeliveryError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_for.contains(&item.id) {
                return Err(DeliveryError::Rejected {
                    target: self.kind.clone(),
                    item_id: item.id.clone(),
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            self.delivered.lock().unwrap().push(item.id.clone());
            Ok(Delivered {
                attempts: 1,
                waited: Duration::ZERO,
            })
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

    fn item(id: &str, group: &str) -> ContentItem {
        ContentItem {
            id: id.to_string(),
            title: format!("Title {id}"),
            body: String::new(),
            link: format!("https://example.com/{id}"),
            published_at: Utc::now(),
            source: "https://example.com/feed.xml".to_string(),
            group: group.to_string(),
        }
    }

    fn engine(ledger: Arc<MemoryLedger>) -> FanoutEngine {
        FanoutEngine::new(ledger, 4, LEASE)
    }

    #[tokio::test]
    async fn test_delivers_then_skips_on_repeat() {
        let ledger = Arc::new(MemoryLedger::new(DAY));
        let engine = engine(ledger.clone());
        let chat = Arc::new(StubTarget::new("chat1", "news"));
        let targets: Vec<Arc<dyn DeliveryTarget>> = vec![chat.clone()];
        let items = vec![item("a", "news"), item("b", "news")];

        let first = engine.process(&items, &targets).await.unwrap();
        assert_eq!(first, FanoutSummary { delivered: 2, skipped: 0 });

        let second = engine.process(&items, &targets).await.unwrap();
        assert_eq!(second, FanoutSummary { delivered: 0, skipped: 2 });

        assert_eq!(chat.delivered(), vec!["a", "b"]);
        assert!(ledger.has_delivered("a", "chat1").await.unwrap());
    }

    #[tokio::test]
    async fn test_items_only_reach_their_group() {
        let engine = engine(Arc::new(MemoryLedger::new(DAY)));
        let news = Arc::new(StubTarget::new("news-chat", "news"));
        let alerts = Arc::new(StubTarget::new("alerts-chat", "alerts"));
        let targets: Vec<Arc<dyn DeliveryTarget>> = vec![news.clone(), alerts.clone()];

        let summary = engine.process(&[item("a", "news")], &targets).await.unwrap();

        assert_eq!(summary.delivered, 1);
        assert_eq!(news.delivered(), vec!["a"]);
        assert!(alerts.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_block_siblings_and_releases_claim() {
        let ledger = Arc::new(MemoryLedger::new(DAY));
        let engine = engine(ledger.clone());
        let flaky = Arc::new(StubTarget::new("flaky", "news").failing_for("b"));
        let steady = Arc::new(StubTarget::new("steady", "news"));
        let targets: Vec<Arc<dyn DeliveryTarget>> = vec![flaky.clone(), steady.clone()];
        let items = vec![item("a", "news"), item("b", "news")];

        let err = engine.process(&items, &targets).await.unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.summary.delivered, 3);
        assert!(err.to_string().starts_with("encountered 1 errors during fan-out"));
        assert!(matches!(
            err.failures[0],
            PairError::Delivery(DeliveryError::Rejected { status: 500, .. })
        ));

        assert_eq!(flaky.delivered(), vec!["a"]);
        assert_eq!(steady.delivered(), vec!["a", "b"]);

        // the failed pair is claimable again on the next poll
        assert!(!ledger.has_delivered("b", "flaky").await.unwrap());
        assert!(ledger.claim("b", "flaky", LEASE).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_precedence() {
        let ledger = Arc::new(MemoryLedger::new(DAY));
        let engine = engine(ledger.clone());
        let pinned = Arc::new(StubTarget::new("pinned", "news").with_ttl(Duration::from_secs(10)));
        let plain = Arc::new(StubTarget::new("plain", "news"));
        let targets: Vec<Arc<dyn DeliveryTarget>> = vec![pinned, plain];

        engine
            .process_with_ttl(&[item("a", "news")], &targets, Some(Duration::from_secs(100)))
            .await
            .unwrap();
        engine.process(&[item("b", "news")], &targets).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        // target override wins over the source TTL
        assert!(!ledger.has_delivered("a", "pinned").await.unwrap());
        assert!(ledger.has_delivered("a", "plain").await.unwrap());

        tokio::time::advance(Duration::from_secs(90)).await;
        // source TTL wins over the ledger default
        assert!(!ledger.has_delivered("a", "plain").await.unwrap());
        assert!(ledger.has_delivered("b", "plain").await.unwrap());
    }

    #[tokio::test]
    async fn test_unbounded_concurrency() {
        let engine = FanoutEngine::new(Arc::new(MemoryLedger::new(DAY)), 0, LEASE);
        let chat = Arc::new(StubTarget::new("chat1", "news"));
        let targets: Vec<Arc<dyn DeliveryTarget>> = vec![chat.clone()];
        let items: Vec<_> = (0..50).map(|i| item(&format!("i{i}"), "news")).collect();

        let summary = engine.process(&items, &targets).await.unwrap();
        assert_eq!(summary.delivered, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_does_not_hold_back_another() {
        let engine = FanoutEngine::new(Arc::new(MemoryLedger::new(DAY)), 1, LEASE);
        let stuck = Arc::new(StubTarget::new("stuck", "a").slowed_by(Duration::from_secs(600)));
        let quick = Arc::new(StubTarget::new("quick", "b"));
        let targets: Vec<Arc<dyn DeliveryTarget>> = vec![stuck, quick.clone()];

        let slow_call = {
            let engine = engine.clone();
            let targets = targets.clone();
            tokio::spawn(async move { engine.process(&[item("x", "a")], &targets).await })
        };
        // let the slow call take its only permit first
        tokio::time::sleep(Duration::from_millis(1)).await;

        let start = tokio::time::Instant::now();
        let summary = engine.process(&[item("y", "b")], &targets).await.unwrap();
        assert_eq!(summary.delivered, 1);
        assert!(start.elapsed() < Duration::from_secs(1), "took {:?}", start.elapsed());
        assert_eq!(quick.delivered(), vec!["y"]);
        assert!(!slow_call.is_finished());

        let summary = slow_call.await.unwrap().unwrap();
        assert_eq!(summary.delivered, 1);
    }
}
