//! Canonical SocialEvent schema
//!
//! Platform-agnostic representation of a social media post, comment or
//! mention. Invariants: (platform, platform_id) identifies the originating
//! record, engagement_rate is always within [0, 1].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{IngestionError, Result};

/// Hard caps applied during normalization
pub const MAX_TEXT_LENGTH: usize = 5000;
pub const MAX_MEDIA_URLS: usize = 10;
pub const MAX_HASHTAGS: usize = 20;
pub const MAX_MENTIONS: usize = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Tiktok,
    Meta,
    Youtube,
    Reddit,
    Rss,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Tiktok => "tiktok",
            Platform::Meta => "meta",
            Platform::Youtube => "youtube",
            Platform::Reddit => "reddit",
            Platform::Rss => "rss",
        }
    }

    pub const ALL: [Platform; 5] = [
        Platform::Tiktok,
        Platform::Meta,
        Platform::Youtube,
        Platform::Reddit,
        Platform::Rss,
    ];
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = IngestionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tiktok" => Ok(Platform::Tiktok),
            "meta" | "instagram" | "facebook" => Ok(Platform::Meta),
            "youtube" => Ok(Platform::Youtube),
            "reddit" => Ok(Platform::Reddit),
            "rss" => Ok(Platform::Rss),
            other => Err(IngestionError::PlatformNotConfigured(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Post,
    Comment,
    Mention,
    Message,
    Share,
    Reaction,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Post => "POST",
            EventType::Comment => "COMMENT",
            EventType::Mention => "MENTION",
            EventType::Message => "MESSAGE",
            EventType::Share => "SHARE",
            EventType::Reaction => "REACTION",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[validate(length(max = 5000))]
    pub text: String,
    #[validate(length(max = 10))]
    pub media_urls: Vec<String>,
    #[validate(length(max = 20))]
    pub hashtags: Vec<String>,
    #[validate(length(max = 20))]
    pub mentions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub follower_count: u64,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(rename_all = "camelCase")]
pub struct Engagement {
    pub likes: u64,
    pub shares: u64,
    pub comments: u64,
    pub views: u64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub engagement_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_post_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub is_reply: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

/// Provenance record attached to every normalized event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataLineage {
    pub source_id: String,
    pub source_platform: Platform,
    pub ingested_at: DateTime<Utc>,
    pub normalized_at: DateTime<Utc>,
    pub transformations_applied: Vec<String>,
    /// SHA-256 over the raw payload, before any transformation
    pub original_data_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub source: String,
    pub processing_timestamp: DateTime<Utc>,
    pub version: String,
    pub data_lineage: DataLineage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialEvent {
    /// Globally unique pipeline id
    pub id: String,
    pub platform: Platform,
    /// Platform-assigned record id
    pub platform_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub content: Content,
    pub author: Author,
    pub engagement: Engagement,
    pub context: Context,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub metadata: EventMetadata,
}

impl SocialEvent {
    /// Rejects events missing identity fields or violating the rate invariant.
    pub fn validate_invariants(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(IngestionError::ValidationError("missing id".to_string()));
        }
        if self.platform_id.is_empty() {
            return Err(IngestionError::ValidationError(
                "missing platformId".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.engagement.engagement_rate) {
            return Err(IngestionError::ValidationError(format!(
                "engagementRate {} outside [0,1]",
                self.engagement.engagement_rate
            )));
        }
        self.content
            .validate()
            .map_err(|e| IngestionError::ValidationError(e.to_string()))?;
        self.engagement
            .validate()
            .map_err(|e| IngestionError::ValidationError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_event() -> SocialEvent {
        let now = Utc::now();
        SocialEvent {
            id: uuid::Uuid::new_v4().to_string(),
            platform: Platform::Tiktok,
            platform_id: "video123".to_string(),
            timestamp: now,
            event_type: EventType::Post,
            content: Content {
                text: "Amazing dance video! #dance #viral".to_string(),
                media_urls: vec![],
                hashtags: vec!["#dance".to_string(), "#viral".to_string()],
                mentions: vec![],
                language: Some("en".to_string()),
            },
            author: Author {
                id: "u1".to_string(),
                username: "dancer".to_string(),
                display_name: "Dancer".to_string(),
                follower_count: 1000,
                verified: false,
                profile_url: None,
            },
            engagement: Engagement {
                likes: 100,
                shares: 0,
                comments: 0,
                views: 1000,
                engagement_rate: 0.1,
            },
            context: Context::default(),
            location: None,
            metadata: EventMetadata {
                source: "tiktok".to_string(),
                processing_timestamp: now,
                version: crate::schemas::CURRENT_SCHEMA_VERSION.to_string(),
                data_lineage: DataLineage {
                    source_id: "video123".to_string(),
                    source_platform: Platform::Tiktok,
                    ingested_at: now,
                    normalized_at: now,
                    transformations_applied: vec!["text_normalization".to_string()],
                    original_data_hash: "0".repeat(64),
                },
            },
        }
    }

    #[test]
    fn test_valid_event_passes() {
        let event = sample_event();
        assert!(event.validate_invariants().is_ok());
    }

    #[test]
    fn test_rate_invariant_enforced() {
        let mut event = sample_event();
        event.engagement.engagement_rate = 1.5;
        assert!(matches!(
            event.validate_invariants(),
            Err(IngestionError::ValidationError(_))
        ));
    }

    #[test]
    fn test_missing_platform_id_rejected() {
        let mut event = sample_event();
        event.platform_id.clear();
        assert!(event.validate_invariants().is_err());
    }

    #[test]
    fn test_serialization_shape() {
        let event = sample_event();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["platform"], "tiktok");
        assert_eq!(json["eventType"], "POST");
        assert_eq!(json["engagement"]["engagementRate"], 0.1);
        assert!(json["metadata"]["dataLineage"]["originalDataHash"].is_string());
    }

    #[test]
    fn test_platform_parsing() {
        assert_eq!("Instagram".parse::<Platform>().unwrap(), Platform::Meta);
        assert_eq!("reddit".parse::<Platform>().unwrap(), Platform::Reddit);
        assert!("myspace".parse::<Platform>().is_err());
    }
}
