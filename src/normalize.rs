//! Normalization
//!
//! Maps raw platform payloads onto the canonical `SocialEvent` schema.
//! Each platform registers a `NormalizationRule` in a static table; the
//! rule extracts platform fields, then a shared pipeline applies text
//! cleanup, hashtag/mention extraction, media URL validation, engagement
//! rate computation and invariant checks.
//!
//! Normalization is pure apart from the generated event id and the
//! `normalized_at` timestamp: the same raw record always yields the same
//! content, author and engagement fields.

use chrono::Utc;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::debug;
use url::Url;

use crate::error::{IngestionError, Result};
use crate::schemas::{
    Author, Content, Context, DataLineage, Engagement, EventMetadata, EventType, Platform,
    RawPlatformData, RecordType, SocialEvent, CURRENT_SCHEMA_VERSION, MAX_HASHTAGS,
    MAX_MEDIA_URLS, MAX_MENTIONS, MAX_TEXT_LENGTH,
};

/// Per-platform field mapping, one variant per supported platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationRule {
    TikTok,
    Meta,
    YouTube,
    Reddit,
    Rss,
}

static RULES: Lazy<HashMap<Platform, NormalizationRule>> = Lazy::new(|| {
    HashMap::from([
        (Platform::Tiktok, NormalizationRule::TikTok),
        (Platform::Meta, NormalizationRule::Meta),
        (Platform::Youtube, NormalizationRule::YouTube),
        (Platform::Reddit, NormalizationRule::Reddit),
        (Platform::Rss, NormalizationRule::Rss),
    ])
});

/// Platform fields pulled out by a rule before the shared pipeline runs
#[derive(Debug, Default)]
struct Extracted {
    text: String,
    likes: u64,
    comments: u64,
    shares: u64,
    views: u64,
    media_urls: Vec<String>,
    author: Author,
    parent_post_id: Option<String>,
    thread_id: Option<String>,
    is_reply: bool,
    language: Option<String>,
    extra_hashtags: Vec<String>,
}

fn str_field(value: &serde_json::Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// Reads a count that may arrive as a JSON number or a numeric string
/// (the YouTube statistics block uses strings)
fn count_field(value: &serde_json::Value, key: &str) -> u64 {
    match value.get(key) {
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Strips Reddit fullname prefixes ("t1_", "t3_") from parent references
fn strip_thing_prefix(id: &str) -> String {
    id.strip_prefix("t1_")
        .or_else(|| id.strip_prefix("t3_"))
        .unwrap_or(id)
        .to_string()
}

impl NormalizationRule {
    fn extract(&self, raw: &RawPlatformData) -> Result<Extracted> {
        let p = &raw.payload;
        let mut out = Extracted::default();

        match self {
            NormalizationRule::TikTok => {
                out.text = str_field(p, "title")
                    .or_else(|| str_field(p, "video_description"))
                    .unwrap_or_default();
                out.likes = count_field(p, "like_count");
                out.comments = count_field(p, "comment_count");
                out.shares = count_field(p, "share_count");
                out.views = count_field(p, "view_count").max(count_field(p, "video_views"));
                if let Some(cover) = str_field(p, "cover_image_url") {
                    out.media_urls.push(cover);
                }
            }
            NormalizationRule::Meta => {
                out.text = str_field(p, "message").unwrap_or_default();
                out.likes = p
                    .pointer("/likes/summary/total_count")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                out.comments = p
                    .pointer("/comments/summary/total_count")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                out.shares = p
                    .pointer("/shares/count")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                if let Some(picture) = str_field(p, "full_picture") {
                    out.media_urls.push(picture);
                }
                if let Some(from) = p.get("from") {
                    out.author.id = str_field(from, "id").unwrap_or_default();
                    out.author.display_name = str_field(from, "name").unwrap_or_default();
                    out.author.username = out.author.display_name.clone();
                }
            }
            NormalizationRule::YouTube => {
                let snippet = p.get("snippet").cloned().unwrap_or_default();
                let title = str_field(&snippet, "title").unwrap_or_default();
                let description = str_field(&snippet, "description").unwrap_or_default();
                out.text = if description.is_empty() {
                    title
                } else {
                    format!("{}\n\n{}", title, description)
                };
                if let Some(stats) = p.get("statistics") {
                    out.likes = count_field(stats, "likeCount");
                    out.comments = count_field(stats, "commentCount");
                    out.views = count_field(stats, "viewCount");
                }
                out.author.id = str_field(&snippet, "channelId").unwrap_or_default();
                out.author.display_name = str_field(&snippet, "channelTitle").unwrap_or_default();
                out.author.username = out.author.display_name.clone();
                if let Some(thumb) = snippet
                    .pointer("/thumbnails/high/url")
                    .and_then(|v| v.as_str())
                {
                    out.media_urls.push(thumb.to_string());
                }
                out.language = str_field(&snippet, "defaultAudioLanguage");
            }
            NormalizationRule::Reddit => {
                let title = str_field(p, "title").unwrap_or_default();
                let body = str_field(p, "selftext")
                    .filter(|s| !s.is_empty())
                    .or_else(|| str_field(p, "body"))
                    .unwrap_or_default();
                out.text = if title.is_empty() {
                    body
                } else if body.is_empty() {
                    title
                } else {
                    format!("{}\n\n{}", title, body)
                };
                out.likes = count_field(p, "ups");
                out.comments = count_field(p, "num_comments");
                out.author.username = str_field(p, "author").unwrap_or_default();
                out.author.id = str_field(p, "author_fullname").unwrap_or_default();
                out.author.display_name = out.author.username.clone();
                out.parent_post_id = str_field(p, "parent_id").map(|id| strip_thing_prefix(&id));
                out.thread_id = str_field(p, "link_id").map(|id| strip_thing_prefix(&id));
                out.is_reply = raw.record_type == RecordType::Comment;
                if let Some(link) = str_field(p, "url_overridden_by_dest") {
                    out.media_urls.push(link);
                }
            }
            NormalizationRule::Rss => {
                let title = str_field(p, "title").unwrap_or_default();
                let body = str_field(p, "content")
                    .filter(|s| !s.is_empty())
                    .or_else(|| str_field(p, "summary"))
                    .unwrap_or_default();
                out.text = if body.is_empty() {
                    title
                } else {
                    format!("{}\n\n{}", title, body)
                };
                out.author.username = str_field(p, "author").unwrap_or_default();
                out.author.display_name = out.author.username.clone();
                if let Some(categories) = p.get("categories").and_then(|v| v.as_array()) {
                    out.extra_hashtags = categories
                        .iter()
                        .filter_map(|c| c.as_str())
                        .map(|c| format!("#{}", c))
                        .collect();
                }
            }
        }

        if out.text.is_empty() {
            return Err(IngestionError::NormalizationError {
                platform: raw.platform.to_string(),
                external_id: raw.external_id.clone(),
                message: "No text content in payload".to_string(),
            });
        }

        Ok(out)
    }
}

/// Collapses runs of whitespace (including newlines) into single spaces
fn normalize_text(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(MAX_TEXT_LENGTH).collect()
}

/// Extracts `#tag` tokens, keeping the `#` prefix, first occurrence wins
fn extract_hashtags(text: &str) -> Vec<String> {
    extract_tagged(text, '#')
        .into_iter()
        .map(|tag| format!("#{}", tag))
        .collect()
}

/// Extracts `@user` tokens without the `@` prefix
fn extract_mentions(text: &str) -> Vec<String> {
    extract_tagged(text, '@')
}

fn extract_tagged(text: &str, marker: char) -> Vec<String> {
    let mut found = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c != marker {
            continue;
        }
        let mut token = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_alphanumeric() || next == '_' {
                token.push(next);
                chars.next();
            } else {
                break;
            }
        }
        if !token.is_empty() && !found.contains(&token) {
            found.push(token);
        }
    }

    found
}

/// Keeps only parseable http(s) URLs, first occurrence wins
fn validate_media_urls(urls: Vec<String>) -> Vec<String> {
    let mut valid = Vec::new();
    for raw in urls {
        match Url::parse(&raw) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {
                if !valid.contains(&raw) {
                    valid.push(raw);
                }
            }
            _ => {}
        }
    }
    valid.truncate(MAX_MEDIA_URLS);
    valid
}

/// Interactions over views, clamped to [0, 1]. Zero views counts as one
/// so engagement on view-less platforms still registers.
fn engagement_rate(likes: u64, comments: u64, shares: u64, views: u64) -> f64 {
    let interactions = (likes + comments + shares) as f64;
    let rate = interactions / views.max(1) as f64;
    rate.min(1.0)
}

fn payload_hash(payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn event_type_for(record_type: RecordType) -> EventType {
    match record_type {
        RecordType::Post => EventType::Post,
        RecordType::Comment => EventType::Comment,
        RecordType::Mention => EventType::Mention,
        RecordType::Message => EventType::Message,
        RecordType::Share => EventType::Share,
        RecordType::Reaction => EventType::Reaction,
    }
}

/// Normalizes one raw record into a canonical event.
///
/// Fails with `NormalizationError` for unmapped platforms or payloads
/// without text content, and `ValidationError` if the produced event
/// violates schema invariants.
pub fn normalize(raw: &RawPlatformData) -> Result<SocialEvent> {
    let rule = RULES
        .get(&raw.platform)
        .ok_or_else(|| IngestionError::NormalizationError {
            platform: raw.platform.to_string(),
            external_id: raw.external_id.clone(),
            message: "No normalization rule registered".to_string(),
        })?;

    let original_data_hash = payload_hash(&raw.payload);
    let extracted = rule.extract(raw)?;
    let mut transformations = vec!["field_mapping".to_string()];

    let text = normalize_text(&extracted.text);
    transformations.push("text_normalization".to_string());

    let mut hashtags = extract_hashtags(&text);
    for tag in extracted.extra_hashtags {
        if !hashtags.contains(&tag) {
            hashtags.push(tag);
        }
    }
    hashtags.truncate(MAX_HASHTAGS);
    transformations.push("hashtag_extraction".to_string());

    let mut mentions = extract_mentions(&text);
    mentions.truncate(MAX_MENTIONS);
    transformations.push("mention_extraction".to_string());

    let media_urls = validate_media_urls(extracted.media_urls);
    transformations.push("media_url_validation".to_string());

    let rate = engagement_rate(
        extracted.likes,
        extracted.comments,
        extracted.shares,
        extracted.views,
    );
    transformations.push("engagement_rate_computation".to_string());

    let now = Utc::now();
    let event = SocialEvent {
        id: uuid::Uuid::new_v4().to_string(),
        platform: raw.platform,
        platform_id: raw.external_id.clone(),
        timestamp: raw.timestamp,
        event_type: event_type_for(raw.record_type),
        content: Content {
            text,
            media_urls,
            hashtags,
            mentions,
            language: extracted.language,
        },
        author: extracted.author,
        engagement: Engagement {
            likes: extracted.likes,
            shares: extracted.shares,
            comments: extracted.comments,
            views: extracted.views,
            engagement_rate: rate,
        },
        context: Context {
            parent_post_id: extracted.parent_post_id,
            thread_id: extracted.thread_id,
            is_reply: extracted.is_reply,
        },
        location: None,
        metadata: EventMetadata {
            source: raw.platform.to_string(),
            processing_timestamp: now,
            version: CURRENT_SCHEMA_VERSION.to_string(),
            data_lineage: DataLineage {
                source_id: raw.external_id.clone(),
                source_platform: raw.platform,
                ingested_at: raw.metadata.ingested_at,
                normalized_at: now,
                transformations_applied: transformations,
                original_data_hash,
            },
        },
    };

    event.validate_invariants()?;

    debug!(
        platform = %event.platform,
        platform_id = %event.platform_id,
        event_type = ?event.event_type,
        "Normalized record"
    );

    Ok(event)
}

/// Batch outcome: one entry per input, either normalized or failed
pub struct NormalizationBatch {
    pub events: Vec<SocialEvent>,
    pub failures: Vec<(RawPlatformData, IngestionError)>,
}

/// Normalizes a batch, partitioning successes from per-record failures.
/// A failed record never aborts the batch.
pub fn normalize_batch(records: Vec<RawPlatformData>) -> NormalizationBatch {
    let mut events = Vec::with_capacity(records.len());
    let mut failures = Vec::new();

    for raw in records {
        match normalize(&raw) {
            Ok(event) => events.push(event),
            Err(e) => failures.push((raw, e)),
        }
    }

    NormalizationBatch { events, failures }
}
