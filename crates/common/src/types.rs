use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry fetched from a content source, ready for fan-out.
///
/// Items are built fresh on every poll and dropped once fan-out completes.
/// Dedup identity is `(id, target kind)`, so `id` must be stable across polls
/// of the same feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Stable identifier, unique within its source (RSS `guid`, Atom `id`).
    pub id: String,
    pub title: String,
    /// Plain-text body, markup already stripped.
    #[serde(rename = "description")]
    pub body: String,
    pub link: String,
    pub published_at: DateTime<Utc>,
    /// URL of the feed this item came from.
    pub source: String,
    /// Group that owns the source; only targets in this group receive the item.
    pub group: String,
}

/// Counts reported by one fan-out call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanoutSummary {
    /// Pairs delivered and recorded in this call.
    pub delivered: usize,
    /// Pairs skipped because the ledger already held them.
    pub skipped: usize,
}

impl std::fmt::Display for FanoutSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "delivered={} skipped={}", self.delivered, self.skipped)
    }
}
