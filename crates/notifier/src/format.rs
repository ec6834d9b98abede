//! Wire payload formats for webhook delivery.

use chrono::SecondsFormat;
use serde::Serialize;

use herald_common::error::AppError;
use herald_common::types::ContentItem;

/// Footer label when the item's source URL has no usable host.
pub const UNKNOWN_SOURCE: &str = "Unknown Source";

/// Embed accent colour (blue).
const DISCORD_EMBED_COLOR: u32 = 3_447_003;

/// Payload shape selected by the target's `format` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFormat {
    /// The item itself, serialized as JSON.
    #[default]
    Generic,
    /// Discord webhook embed.
    Discord,
    /// Microsoft Teams adaptive card.
    Teams,
}

impl PayloadFormat {
    /// Parse the `format` option; absent means generic.
    pub fn from_option(value: Option<&str>) -> Result<Self, AppError> {
        match value.map(str::to_ascii_lowercase).as_deref() {
            None | Some("") | Some("generic") | Some("json") => Ok(Self::Generic),
            Some("discord") => Ok(Self::Discord),
            Some("teams") => Ok(Self::Teams),
            Some(other) => Err(AppError::config(format!(
                "unknown payload format '{other}' (expected generic, discord or teams)"
            ))),
        }
    }

    /// Encode `item` as a JSON request body.
    pub fn render(&self, item: &ContentItem) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Generic => serde_json::to_vec(item),
            Self::Discord => serde_json::to_vec(&DiscordWebhook::from_item(item)),
            Self::Teams => serde_json::to_vec(&TeamsWebhook::from_item(item)),
        }
    }
}

impl std::fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadFormat::Generic => write!(f, "generic"),
            PayloadFormat::Discord => write!(f, "discord"),
            PayloadFormat::Teams => write!(f, "teams"),
        }
    }
}

/// Host of the item's source feed with a leading `www.` removed.
pub fn source_domain(item: &ContentItem) -> String {
    reqwest::Url::parse(&item.source)
        .ok()
        .and_then(|url| {
            url.host_str()
                .map(|host| host.strip_prefix("www.").unwrap_or(host).to_string())
        })
        .unwrap_or_else(|| UNKNOWN_SOURCE.to_string())
}

#[derive(Debug, Serialize)]
struct DiscordWebhook {
    embeds: Vec<DiscordEmbed>,
}

#[derive(Debug, Serialize)]
struct DiscordEmbed {
    title: String,
    description: String,
    url: String,
    color: u32,
    timestamp: String,
    footer: DiscordFooter,
}

#[derive(Debug, Serialize)]
struct DiscordFooter {
    text: String,
}

impl DiscordWebhook {
    fn from_item(item: &ContentItem) -> Self {
        Self {
            embeds: vec![DiscordEmbed {
                title: item.title.clone(),
                description: item.body.clone(),
                url: item.link.clone(),
                color: DISCORD_EMBED_COLOR,
                timestamp: item.published_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                footer: DiscordFooter {
                    text: format!("Source: {}", source_domain(item)),
                },
            }],
        }
    }
}

#[derive(Debug, Serialize)]
struct TeamsWebhook {
    #[serde(rename = "type")]
    kind: &'static str,
    attachments: Vec<TeamsAttachment>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TeamsAttachment {
    content_type: &'static str,
    content_url: Option<String>,
    content: TeamsCard,
}

#[derive(Debug, Serialize)]
struct TeamsCard {
    #[serde(rename = "$schema")]
    schema: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    version: &'static str,
    body: Vec<TeamsBlock>,
}

#[derive(Debug, Default, Serialize)]
struct TeamsBlock {
    #[serde(rename = "type")]
    kind: &'static str,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    weight: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    color: Option<&'static str>,
}

impl TeamsBlock {
    fn text(text: String) -> Self {
        Self {
            kind: "TextBlock",
            text,
            ..Self::default()
        }
    }
}

impl TeamsWebhook {
    fn from_item(item: &ContentItem) -> Self {
        Self {
            kind: "message",
            attachments: vec![TeamsAttachment {
                content_type: "application/vnd.microsoft.card.adaptive",
                content_url: None,
                content: TeamsCard {
                    schema: "http://adaptivecards.io/schemas/adaptive-card.json",
                    kind: "AdaptiveCard",
                    version: "1.2",
                    body: vec![
                        TeamsBlock {
                            size: Some("Large"),
                            weight: Some("Bolder"),
                            ..TeamsBlock::text(item.title.clone())
                        },
                        TeamsBlock::text(item.body.clone()),
                        TeamsBlock {
                            color: Some("Accent"),
                            ..TeamsBlock::text(format!("[Read more]({})", item.link))
                        },
                        TeamsBlock {
                            size: Some("Small"),
                            ..TeamsBlock::text(format!("Source: {}", source_domain(item)))
                        },
                    ],
                },
            }],
        }
    }
}
