//! Idempotency ledger — remembers which (item, target) pairs were delivered.
//!
//! Each pair maps to one key, `herald:delivered:{target_kind}:{item_id}`, that
//! moves through two states:
//! - claimed: written with `SET NX PX <lease>` before delivery starts
//! - delivered: overwritten with the full TTL once delivery succeeds
//!
//! A failed delivery deletes the claim so the next poll can retry. Entries
//! expire on their own; [`Ledger::sweep_expired`] is only housekeeping.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::time::Instant;

/// Namespace shared by every ledger key.
pub const KEY_PREFIX: &str = "herald:delivered";

const CLAIMED: &str = "pending";
const DELIVERED: &str = "1";

/// Keys fetched per `SCAN` page during a sweep.
const SCAN_BATCH: usize = 200;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger store error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Ledger key for one (item, target) pair.
pub fn ledger_key(item_id: &str, target_kind: &str) -> String {
    format!("{}:{}:{}", KEY_PREFIX, target_kind, item_id)
}

/// Persistent record of delivered pairs.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Whether delivery of the pair has been confirmed. In-flight claims do not count.
    async fn has_delivered(&self, item_id: &str, target_kind: &str) -> Result<bool, LedgerError>;

    /// Mark the pair delivered for `ttl`, or the ledger default when `None`.
    async fn record(
        &self,
        item_id: &str,
        target_kind: &str,
        ttl: Option<Duration>,
    ) -> Result<(), LedgerError>;

    /// Reserve the pair for `lease`. Returns `false` when an entry already exists.
    async fn claim(
        &self,
        item_id: &str,
        target_kind: &str,
        lease: Duration,
    ) -> Result<bool, LedgerError>;

    /// Drop the pair's entry so that it can be claimed again.
    async fn release(&self, item_id: &str, target_kind: &str) -> Result<(), LedgerError>;

    /// Remove entries without a live expiry. Returns how many were removed.
    async fn sweep_expired(&self) -> Result<usize, LedgerError>;
}

/// Expiry in milliseconds for `PX`; Redis rejects zero.
fn px(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Redis-backed ledger.
#[derive(Clone)]
pub struct RedisLedger {
    conn: ConnectionManager,
    default_ttl: Duration,
}

impl RedisLedger {
    pub fn new(conn: ConnectionManager, default_ttl: Duration) -> Self {
        Self { conn, default_ttl }
    }
}

#[async_trait]
impl Ledger for RedisLedger {
    async fn has_delivered(&self, item_id: &str, target_kind: &str) -> Result<bool, LedgerError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(ledger_key(item_id, target_kind))
            .query_async(&mut conn)
            .await?;
        Ok(value.as_deref() == Some(DELIVERED))
    }

    async fn record(
        &self,
        item_id: &str,
        target_kind: &str,
        ttl: Option<Duration>,
    ) -> Result<(), LedgerError> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(ledger_key(item_id, target_kind))
            .arg(DELIVERED)
            .arg("PX")
            .arg(px(ttl))
            .query_async(&mut conn)
            .await?;

        tracing::debug!(item_id, target_kind, ttl_secs = ttl.as_secs(), "Delivery recorded");
        Ok(())
    }

    async fn claim(
        &self,
        item_id: &str,
        target_kind: &str,
        lease: Duration,
    ) -> Result<bool, LedgerError> {
        let mut conn = self.conn.clone();

        // Some("OK") when the key was created, None when it already existed
        let result: Option<String> = redis::cmd("SET")
            .arg(ledger_key(item_id, target_kind))
            .arg(CLAIMED)
            .arg("NX")
            .arg("PX")
            .arg(px(lease))
            .query_async(&mut conn)
            .await?;

        Ok(result.is_some())
    }

    async fn release(&self, item_id: &str, target_kind: &str) -> Result<(), LedgerError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(ledger_key(item_id, target_kind))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<usize, LedgerError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}:*", KEY_PREFIX);
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            for key in keys {
                // -1: no expiry set, -2: already gone
                let ttl: i64 = redis::cmd("TTL").arg(&key).query_async(&mut conn).await?;
                if ttl == -1 {
                    let n: usize = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
                    removed += n;
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(removed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Claimed,
    Delivered,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: EntryState,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process ledger. Entries are lost on restart.
#[derive(Debug)]
pub struct MemoryLedger {
    entries: Mutex<HashMap<String, Entry>>,
    default_ttl: Duration,
}

impl MemoryLedger {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn has_delivered(&self, item_id: &str, target_kind: &str) -> Result<bool, LedgerError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        Ok(entries
            .get(&ledger_key(item_id, target_kind))
            .is_some_and(|e| e.state == EntryState::Delivered && e.is_live(now)))
    }

    async fn record(
        &self,
        item_id: &str,
        target_kind: &str,
        ttl: Option<Duration>,
    ) -> Result<(), LedgerError> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            ledger_key(item_id, target_kind),
            Entry {
                state: EntryState::Delivered,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn claim(
        &self,
        item_id: &str,
        target_kind: &str,
        lease: Duration,
    ) -> Result<bool, LedgerError> {
        let key = ledger_key(item_id, target_kind);
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if entries.get(&key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key,
            Entry {
                state: EntryState::Claimed,
                expires_at: now + lease,
            },
        );
        Ok(true)
    }

    async fn release(&self, item_id: &str, target_kind: &str) -> Result<(), LedgerError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(&ledger_key(item_id, target_kind));
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<usize, LedgerError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok(before - entries.len())
    }
}
