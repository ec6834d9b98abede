//! RSS 2.0 / Atom 1.0 feed source.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::de::from_str;
use serde::Deserialize;

use herald_common::config::SourceConfig;
use herald_common::error::AppError;
use herald_common::types::ContentItem;

use crate::html::{scrub_entities_for_xml, strip_html};
use crate::{FetchError, Source};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    title: Option<String>,
    link: Option<String>,
    description: Option<String>,
    guid: Option<Text>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    id: Option<String>,
    title: Option<Text>,
    summary: Option<Text>,
    #[serde(rename = "link", default)]
    links: Vec<AtomLink>,
    published: Option<String>,
    updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

/// Element text that may carry attributes (`<guid isPermaLink="false">`, `<title type="html">`).
#[derive(Debug, Deserialize)]
struct Text {
    #[serde(rename = "$text", default)]
    value: String,
}

/// Format-neutral view of one feed entry before validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedEntry {
    pub id: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub link: Option<String>,
    pub published: Option<DateTime<Utc>>,
}

/// Parse an RSS 2.0 or Atom 1.0 document into entries.
pub fn parse_feed(body: &str) -> Result<Vec<FeedEntry>, String> {
    let xml = scrub_entities_for_xml(body);

    if is_atom(&xml) {
        let feed: AtomFeed = from_str(&xml).map_err(|e| format!("atom: {e}"))?;
        return Ok(feed.entries.into_iter().map(FeedEntry::from).collect());
    }

    let rss: Rss = from_str(&xml).map_err(|e| format!("rss: {e}"))?;
    Ok(rss.channel.items.into_iter().map(FeedEntry::from).collect())
}

fn is_atom(xml: &str) -> bool {
    xml.contains("<feed") && !xml.contains("<rss")
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl From<RssItem> for FeedEntry {
    fn from(item: RssItem) -> Self {
        Self {
            id: non_empty(item.guid.map(|g| g.value)),
            title: non_empty(item.title),
            body: item.description,
            link: non_empty(item.link),
            published: item.pub_date.as_deref().and_then(parse_date),
        }
    }
}

impl From<AtomEntry> for FeedEntry {
    fn from(entry: AtomEntry) -> Self {
        let link = entry
            .links
            .iter()
            .find(|l| l.rel.as_deref().is_none_or(|r| r == "alternate"))
            .or_else(|| entry.links.first())
            .and_then(|l| l.href.clone());

        Self {
            id: non_empty(entry.id),
            title: non_empty(entry.title.map(|t| t.value)),
            body: entry.summary.map(|s| s.value),
            link: non_empty(link),
            published: entry
                .published
                .or(entry.updated)
                .as_deref()
                .and_then(parse_date),
        }
    }
}

#[derive(Debug, Default)]
struct Watermark {
    committed: Option<DateTime<Utc>>,
    pending: Option<DateTime<Utc>>,
}

/// Polls one RSS or Atom feed over HTTP.
pub struct RssSource {
    config: SourceConfig,
    group: String,
    client: reqwest::Client,
    watermark: Mutex<Watermark>,
}

impl RssSource {
    pub fn new(config: SourceConfig, group: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            config,
            group: group.into(),
            client,
            watermark: Mutex::new(Watermark::default()),
        }
    }

    /// Registry constructor.
    pub fn factory(
        config: &SourceConfig,
        group: &str,
        client: &reqwest::Client,
    ) -> Result<Arc<dyn Source>, AppError> {
        if !config.url.starts_with("http://") && !config.url.starts_with("https://") {
            return Err(AppError::config(format!(
                "source URL must be http(s) in group {}: {}",
                group, config.url
            )));
        }
        Ok(Arc::new(Self::new(config.clone(), group, client.clone())))
    }

    fn committed_watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .committed
    }

    /// Validate and convert entries, dropping anything published before `since`.
    ///
    /// Entries without a publish date are stamped with `fetched_at`.
    pub fn to_items(
        &self,
        entries: Vec<FeedEntry>,
        since: Option<DateTime<Utc>>,
        fetched_at: DateTime<Utc>,
    ) -> Vec<ContentItem> {
        let mut items = Vec::with_capacity(entries.len());

        for entry in entries {
            if let (Some(since), Some(published)) = (since, entry.published)
                && published < since
            {
                continue;
            }

            let Some(id) = entry.id else {
                tracing::warn!(
                    url = %self.config.url,
                    title = entry.title.as_deref().unwrap_or_default(),
                    "Skipping item with empty id"
                );
                continue;
            };

            let title = entry.title.as_deref().map(strip_html).unwrap_or_default();
            if title.is_empty() {
                tracing::warn!(url = %self.config.url, id = %id, "Skipping item with empty title");
                continue;
            }

            items.push(ContentItem {
                id,
                title,
                body: entry.body.as_deref().map(strip_html).unwrap_or_default(),
                link: entry.link.unwrap_or_default(),
                published_at: entry.published.unwrap_or(fetched_at),
                source: self.config.url.clone(),
                group: self.group.clone(),
            });
        }

        items
    }
}

#[async_trait]
impl Source for RssSource {
    async fn fetch(&self) -> Result<Vec<ContentItem>, FetchError> {
        let started = Utc::now();
        let url = &self.config.url;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Http {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.clone(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(|source| FetchError::Http {
            url: url.clone(),
            source,
        })?;

        let entries = parse_feed(&body).map_err(|message| FetchError::Parse {
            url: url.clone(),
            message,
        })?;
        let total = entries.len();

        let items = self.to_items(entries, self.committed_watermark(), started);

        self.watermark
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending = Some(started);

        tracing::info!(url = %url, entries = total, items = items.len(), "Fetched feed");
        Ok(items)
    }

    fn commit(&self) {
        let mut watermark = self.watermark.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = watermark.pending.take() {
            watermark.committed = Some(pending);
        }
    }

    fn kind(&self) -> &str {
        &self.config.kind
    }

    fn url(&self) -> &str {
        &self.config.url
    }

    fn interval(&self) -> Duration {
        self.config.interval()
    }

    fn group(&self) -> &str {
        &self.group
    }

    fn ttl(&self) -> Option<Duration> {
        self.config.ttl()
    }
}
