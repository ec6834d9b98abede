//! Source scheduler — one polling task per configured source.
//!
//! Each task waits one interval, fetches, hands the batch to the fan-out engine
//! and repeats. A slow fan-out pushes the next tick back instead of bursting.
//! All tasks watch a shared shutdown flag and exit at the next safe point.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

use herald_notifier::DeliveryTarget;
use herald_sources::Source;

use crate::fanout::FanoutEngine;
use crate::ledger::Ledger;

/// Drives periodic polling of every source.
pub struct SourceScheduler {
    fanout: FanoutEngine,
    sources: Vec<Arc<dyn Source>>,
    targets: Arc<[Arc<dyn DeliveryTarget>]>,
    sweeper: Option<(Arc<dyn Ledger>, Duration)>,
    handles: Vec<JoinHandle<()>>,
}

impl SourceScheduler {
    pub fn new(
        fanout: FanoutEngine,
        sources: Vec<Arc<dyn Source>>,
        targets: Vec<Arc<dyn DeliveryTarget>>,
    ) -> Self {
        Self {
            fanout,
            sources,
            targets: targets.into(),
            sweeper: None,
            handles: Vec::new(),
        }
    }

    /// Also run `ledger.sweep_expired()` every `interval`.
    pub fn with_sweeper(mut self, ledger: Arc<dyn Ledger>, interval: Duration) -> Self {
        self.sweeper = Some((ledger, interval));
        self
    }

    /// Number of tasks started and not yet joined.
    pub fn running(&self) -> usize {
        self.handles.len()
    }

    /// Spawn the polling tasks and return immediately.
    ///
    /// Tasks exit once `shutdown` becomes `true` or its sender is dropped.
    pub fn start(&mut self, shutdown: watch::Receiver<bool>) {
        for source in &self.sources {
            let span = tracing::info_span!(
                "source",
                kind = %source.kind(),
                url = %source.url(),
                group = %source.group(),
            );
            let task = poll_source(
                source.clone(),
                self.fanout.clone(),
                self.targets.clone(),
                shutdown.clone(),
            );
            self.handles.push(tokio::spawn(task.instrument(span)));
        }

        if let Some((ledger, interval)) = &self.sweeper {
            let task = sweep_ledger(ledger.clone(), *interval, shutdown.clone());
            self.handles
                .push(tokio::spawn(task.instrument(tracing::info_span!("sweeper"))));
        }

        tracing::info!(
            sources = self.sources.len(),
            targets = self.targets.len(),
            sweeper = self.sweeper.is_some(),
            "Scheduler started"
        );
    }

    /// Wait for every task to exit. Call after raising the shutdown signal.
    pub async fn stop(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Scheduler task ended abnormally");
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

/// Wait for the next tick, or `false` once shutdown is signalled.
async fn next_tick(ticker: &mut tokio::time::Interval, shutdown: &mut watch::Receiver<bool>) -> bool {
    loop {
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
            _ = ticker.tick() => return !*shutdown.borrow(),
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn poll_source(
    source: Arc<dyn Source>,
    fanout: FanoutEngine,
    targets: Arc<[Arc<dyn DeliveryTarget>]>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = source.interval();
    if period.is_zero() {
        tracing::error!("Source interval is zero, not polling");
        return;
    }

    tracing::info!(interval_secs = period.as_secs_f64(), "Source polling started");
    let mut ticker = ticker(period);

    while next_tick(&mut ticker, &mut shutdown).await {
        poll_once(source.as_ref(), &fanout, &targets).await;
    }

    tracing::info!("Source polling stopped");
}

async fn poll_once(source: &dyn Source, fanout: &FanoutEngine, targets: &[Arc<dyn DeliveryTarget>]) {
    let items = match source.fetch().await {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!(error = %e, "Fetch failed");
            return;
        }
    };

    if items.is_empty() {
        tracing::debug!("No new items");
        source.commit();
        return;
    }

    match fanout.process_with_ttl(&items, targets, source.ttl()).await {
        Ok(summary) => {
            tracing::info!(
                items = items.len(),
                delivered = summary.delivered,
                skipped = summary.skipped,
                "Batch distributed"
            );
            source.commit();
        }
        Err(e) => {
            // watermark stays put so failed pairs are offered again next poll
            tracing::error!(
                items = items.len(),
                failures = e.failures.len(),
                delivered = e.summary.delivered,
                error = %e,
                "Batch distributed with errors"
            );
        }
    }
}

async fn sweep_ledger(ledger: Arc<dyn Ledger>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    if period.is_zero() {
        return;
    }
    let mut ticker = ticker(period);

    while next_tick(&mut ticker, &mut shutdown).await {
        match ledger.sweep_expired().await {
            Ok(0) => tracing::debug!("Ledger sweep found nothing to remove"),
            Ok(removed) => tracing::info!(removed, "Ledger sweep completed"),
            Err(e) => tracing::warn!(error = %e, "Ledger sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use herald_common::types::ContentItem;
    use herald_notifier::{Delivered, DeliveryError};
    use herald_sources::FetchError;

    use crate::ledger::MemoryLedger;

    const DAY: Duration = Duration::from_secs(86_400);

    /// Source that counts fetches and replays a scripted sequence of results.
    struct ScriptedSource {
        interval: Duration,
        fetches: AtomicUsize,
        commits: AtomicUsize,
        fail_first: usize,
        items: Vec<ContentItem>,
        fetch_delay: Duration,
    }

    impl ScriptedSource {
        fn new(interval_secs: u64) -> Self {
            Self {
                interval: Duration::from_secs(interval_secs),
                fetches: AtomicUsize::new(0),
                commits: AtomicUsize::new(0),
                fail_first: 0,
                items: Vec::new(),
                fetch_delay: Duration::ZERO,
            }
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }

        fn commits(&self) -> usize {
            self.commits.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Source for ScriptedSource {
        async fn fetch(&self) -> Result<Vec<ContentItem>, FetchError> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            if !self.fetch_delay.is_zero() {
                tokio::time::sleep(self.fetch_delay).await;
            }
            if n < self.fail_first {
                return Err(FetchError::Status {
                    url: self.url().to_string(),
                    status: 503,
                });
            }
            Ok(self.items.clone())
        }

        fn commit(&self) {
            self.commits.fetch_add(1, Ordering::SeqCst);
        }

        fn kind(&self) -> &str {
            "rss"
        }

        fn url(&self) -> &str {
            "https://example.com/feed.xml"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        fn group(&self) -> &str {
            "news"
        }
    }

    struct FailingTarget {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl DeliveryTarget for FailingTarget {
        async fn deliver(&self, item: &ContentItem) -> Result<Delivered, DeliveryError> {
            *self.calls.lock().unwrap() += 1;
            Err(DeliveryError::Rejected {
                target: "down".to_string(),
                item_id: item.id.clone(),
                status: 502,
                body: String::new(),
            })
        }

        fn kind(&self) -> &str {
            "down"
        }

        fn group(&self) -> &str {
            "news"
        }
    }

    fn item(id: &str) -> ContentItem {
        ContentItem {
            id: id.to_string(),
            title: id.to_string(),
            body: String::new(),
            link: String::new(),
            published_at: Utc::now(),
            source: "https://example.com/feed.xml".to_string(),
            group: "news".to_string(),
        }
    }

    fn fanout() -> FanoutEngine {
        FanoutEngine::new(Arc::new(MemoryLedger::new(DAY)), 4, Duration::from_secs(300))
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_intervals_and_prompt_cancel() {
        let fast = Arc::new(ScriptedSource::new(1));
        let slow = Arc::new(ScriptedSource::new(5));
        let mut scheduler = SourceScheduler::new(fanout(), vec![fast.clone(), slow.clone()], vec![]);

        let (tx, rx) = watch::channel(false);
        scheduler.start(rx);
        assert_eq!(scheduler.running(), 2);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        tx.send(true).unwrap();

        let before_stop = Instant::now();
        scheduler.stop().await;
        assert!(before_stop.elapsed() < Duration::from_secs(1));
        assert_eq!(scheduler.running(), 0);

        assert_eq!(fast.fetches(), 2);
        assert_eq!(slow.fetches(), 0);

        // nothing fires after stop
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fast.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_errors_do_not_end_the_loop() {
        let source = Arc::new(ScriptedSource {
            fail_first: 2,
            ..ScriptedSource::new(1)
        });
        let mut scheduler = SourceScheduler::new(fanout(), vec![source.clone()], vec![]);

        let (tx, rx) = watch::channel(false);
        scheduler.start(rx);
        tokio::time::sleep(Duration::from_millis(3500)).await;
        tx.send(true).unwrap();
        scheduler.stop().await;

        assert_eq!(source.fetches(), 3);
        // only the successful (empty) fetch commits
        assert_eq!(source.commits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fanout_keeps_watermark() {
        let source = Arc::new(ScriptedSource {
            items: vec![item("a")],
            ..ScriptedSource::new(1)
        });
        let target = Arc::new(FailingTarget {
            calls: Mutex::new(0),
        });
        let mut scheduler =
            SourceScheduler::new(fanout(), vec![source.clone()], vec![target.clone()]);

        let (tx, rx) = watch::channel(false);
        scheduler.start(rx);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        tx.send(true).unwrap();
        scheduler.stop().await;

        assert_eq!(source.commits(), 0);
        // released claims let the next poll retry
        assert_eq!(*target.calls.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_poll() {
        let source = Arc::new(ScriptedSource {
            fetch_delay: Duration::from_secs(3),
            ..ScriptedSource::new(1)
        });
        let mut scheduler = SourceScheduler::new(fanout(), vec![source.clone()], vec![]);

        let (tx, rx) = watch::channel(false);
        scheduler.start(rx);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(source.fetches(), 1);
        assert_eq!(source.commits(), 0);

        tx.send(true).unwrap();
        scheduler.stop().await;

        // the in-flight fetch finished and committed before the task exited
        assert_eq!(source.commits(), 1);
        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sender_stops_tasks() {
        let source = Arc::new(ScriptedSource::new(1));
        let mut scheduler = SourceScheduler::new(fanout(), vec![source.clone()], vec![]);

        let (tx, rx) = watch::channel(false);
        scheduler.start(rx);
        drop(tx);
        scheduler.stop().await;

        assert_eq!(source.fetches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_on_its_interval() {
        let ledger = Arc::new(MemoryLedger::new(DAY));
        ledger
            .record("old", "chat1", Some(Duration::from_secs(5)))
            .await
            .unwrap();

        let mut scheduler = SourceScheduler::new(fanout(), vec![], vec![])
            .with_sweeper(ledger.clone(), Duration::from_secs(10));

        let (tx, rx) = watch::channel(false);
        scheduler.start(rx);
        assert_eq!(scheduler.running(), 1);

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(ledger.len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ledger.len(), 0);

        tx.send(true).unwrap();
        scheduler.stop().await;
    }
}
