//! Canonical schemas shared across the pipeline
//!
//! All wire formats are JSON; every normalized event carries `CURRENT_SCHEMA_VERSION`.

pub mod event;
pub mod raw;

/// Current schema version (semver)
pub const CURRENT_SCHEMA_VERSION: &str = "1.0.0";

pub use event::{
    Author, Content, Context, DataLineage, Engagement, EventMetadata, EventType, Platform,
    SocialEvent, MAX_HASHTAGS, MAX_MEDIA_URLS, MAX_MENTIONS, MAX_TEXT_LENGTH,
};
pub use raw::{RawPlatformData, RecordType};
