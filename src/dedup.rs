//! Deduplication
//!
//! Flags events whose content fingerprint was already seen. The
//! fingerprint is a SHA-256 over a configurable subset of content fields
//! (text, media URLs and hashtags by default) plus the platform, so the
//! same story posted twice under different external ids still collides.
//!
//! The cache is an explicit bounded store: a fingerprint map plus an
//! insertion-order queue, evicting the oldest entry once full. An
//! optional Redis backend mirrors fingerprints with a TTL for
//! multi-instance deployments; a memory miss consults the mirror before
//! declaring an event unique, so a restarted instance keeps catching
//! duplicates. Redis failures degrade to memory-only operation and
//! never fail the pipeline.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use crate::error::{IngestionError, Result};
use crate::schemas::{Platform, SocialEvent};

/// Confidence reported for a fingerprint match inside the platform's
/// dedup window
pub const WINDOWED_MATCH_CONFIDENCE: f64 = 0.95;
/// Confidence reported for a fingerprint match on a platform with no
/// window rule (any-age matches count)
pub const UNWINDOWED_MATCH_CONFIDENCE: f64 = 0.9;

/// Content fields folded into the fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintField {
    Text,
    MediaUrls,
    Hashtags,
    AuthorId,
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Maximum fingerprints held in memory
    pub cache_size: usize,
    /// Default dedup window; a match older than this is not flagged
    pub default_window_secs: u64,
    /// Platform overrides: `Some(secs)` replaces the default window,
    /// `None` disables windowing so any-age matches are flagged
    pub platform_windows: HashMap<Platform, Option<u64>>,
    /// Fields folded into the fingerprint
    pub fields: Vec<FingerprintField>,
    /// TTL applied to mirrored Redis entries
    pub redis_ttl_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            cache_size: 100_000,
            default_window_secs: 60,
            platform_windows: HashMap::new(),
            fields: vec![
                FingerprintField::Text,
                FingerprintField::MediaUrls,
                FingerprintField::Hashtags,
            ],
            redis_ttl_secs: 86_400,
        }
    }
}

/// Outcome of a dedup check
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupOutcome {
    pub is_duplicate: bool,
    /// Pipeline id of the submitted event
    pub unique_id: String,
    /// Pipeline id of the first event with this fingerprint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<String>,
    /// Match confidence; 0 for non-duplicates
    pub confidence: f64,
}

struct CacheEntry {
    unique_id: String,
    first_seen: DateTime<Utc>,
}

#[derive(Default)]
struct Cache {
    entries: HashMap<String, CacheEntry>,
    insertion_order: VecDeque<String>,
}

/// Parses a mirrored Redis value of the form `{unique_id}|{epoch_secs}`
fn parse_mirror_entry(raw: &str) -> Option<(String, DateTime<Utc>)> {
    let (unique_id, secs) = raw.split_once('|')?;
    let secs: i64 = secs.parse().ok()?;
    let first_seen = Utc.timestamp_opt(secs, 0).single()?;
    Some((unique_id.to_string(), first_seen))
}

/// Computes an event's content fingerprint under the given field set
pub fn fingerprint(event: &SocialEvent, fields: &[FingerprintField]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.platform.as_str().as_bytes());

    for field in fields {
        hasher.update([0u8]);
        match field {
            FingerprintField::Text => hasher.update(event.content.text.as_bytes()),
            FingerprintField::MediaUrls => {
                for url in &event.content.media_urls {
                    hasher.update(url.as_bytes());
                    hasher.update([1u8]);
                }
            }
            FingerprintField::Hashtags => {
                for tag in &event.content.hashtags {
                    hasher.update(tag.as_bytes());
                    hasher.update([1u8]);
                }
            }
            FingerprintField::AuthorId => hasher.update(event.author.id.as_bytes()),
        }
    }

    hex::encode(hasher.finalize())
}

pub struct DedupEngine {
    config: DedupConfig,
    cache: Mutex<Cache>,
    redis: Option<redis::aio::ConnectionManager>,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            cache: Mutex::new(Cache::default()),
            redis: None,
        }
    }

    pub fn with_redis(config: DedupConfig, redis: redis::aio::ConnectionManager) -> Self {
        Self {
            config,
            cache: Mutex::new(Cache::default()),
            redis: Some(redis),
        }
    }

    fn window_for(&self, platform: Platform) -> Option<u64> {
        match self.config.platform_windows.get(&platform) {
            Some(override_window) => *override_window,
            None => Some(self.config.default_window_secs),
        }
    }

    /// Checks an event against the cache and records its fingerprint.
    ///
    /// Idempotent for an unchanged event: the second submission inside
    /// the window reports `duplicate_of` equal to the first submission's
    /// id. A first sighting (or a stale match outside the window) stores
    /// the event as the new canonical occurrence.
    pub async fn check(&self, event: &SocialEvent) -> DedupOutcome {
        let print = fingerprint(event, &self.config.fields);
        let window = self.window_for(event.platform);
        let now = Utc::now();

        let matched = {
            let cache = self.cache.lock();
            cache.entries.get(&print).map(|entry| {
                let age_ok = window.map_or(true, |secs| {
                    now - entry.first_seen <= ChronoDuration::seconds(secs as i64)
                });
                (entry.unique_id.clone(), age_ok)
            })
        };

        if let Some((original_id, within_window)) = matched {
            if within_window {
                debug!(
                    platform = %event.platform,
                    event_id = %event.id,
                    duplicate_of = %original_id,
                    "Duplicate event"
                );
                return DedupOutcome {
                    is_duplicate: true,
                    unique_id: event.id.clone(),
                    duplicate_of: Some(original_id),
                    confidence: if window.is_some() {
                        WINDOWED_MATCH_CONFIDENCE
                    } else {
                        UNWINDOWED_MATCH_CONFIDENCE
                    },
                };
            }
        }

        // Memory miss: a restarted instance may still find the print in
        // the Redis mirror
        if let Some(ref redis) = self.redis {
            match self.fetch_mirror(&print, redis.clone()).await {
                Ok(Some(raw)) => {
                    if let Some(outcome) = self.recover_from_mirror(event, &print, &raw, now) {
                        return outcome;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Dedup lookup in Redis failed"),
            }
        }

        self.insert(print.clone(), event.id.clone(), now);

        if let Some(ref redis) = self.redis {
            if let Err(e) = self
                .mirror_to_redis(&print, &event.id, now, redis.clone())
                .await
            {
                warn!(error = %e, "Dedup mirror to Redis failed");
            }
        }

        DedupOutcome {
            is_duplicate: false,
            unique_id: event.id.clone(),
            duplicate_of: None,
            confidence: 0.0,
        }
    }

    fn insert(&self, print: String, unique_id: String, now: DateTime<Utc>) {
        let mut cache = self.cache.lock();

        // Re-sighting outside the window replaces the stale entry without
        // growing the queue
        if let Some(entry) = cache.entries.get_mut(&print) {
            entry.unique_id = unique_id;
            entry.first_seen = now;
            return;
        }

        while cache.entries.len() >= self.config.cache_size {
            match cache.insertion_order.pop_front() {
                Some(oldest) => {
                    cache.entries.remove(&oldest);
                }
                None => break,
            }
        }

        cache.insertion_order.push_back(print.clone());
        cache.entries.insert(
            print,
            CacheEntry {
                unique_id,
                first_seen: now,
            },
        );
    }

    /// Applies the window to a mirrored entry found after a memory miss.
    /// A within-window hit warms the cache with the original occurrence
    /// and flags the event; a stale hit returns None so the caller
    /// records the event as the new canonical occurrence.
    fn recover_from_mirror(
        &self,
        event: &SocialEvent,
        print: &str,
        raw: &str,
        now: DateTime<Utc>,
    ) -> Option<DedupOutcome> {
        let (original_id, first_seen) = parse_mirror_entry(raw)?;
        let window = self.window_for(event.platform);
        let within_window = window.map_or(true, |secs| {
            now - first_seen <= ChronoDuration::seconds(secs as i64)
        });
        if !within_window {
            return None;
        }

        self.insert(print.to_string(), original_id.clone(), first_seen);
        debug!(
            platform = %event.platform,
            event_id = %event.id,
            duplicate_of = %original_id,
            "Duplicate event recovered from Redis mirror"
        );
        Some(DedupOutcome {
            is_duplicate: true,
            unique_id: event.id.clone(),
            duplicate_of: Some(original_id),
            confidence: if window.is_some() {
                WINDOWED_MATCH_CONFIDENCE
            } else {
                UNWINDOWED_MATCH_CONFIDENCE
            },
        })
    }

    async fn fetch_mirror(
        &self,
        print: &str,
        mut redis: redis::aio::ConnectionManager,
    ) -> Result<Option<String>> {
        let key = format!("dedup:{}", print);
        redis::cmd("GET")
            .arg(&key)
            .query_async::<Option<String>>(&mut redis)
            .await
            .map_err(|e| IngestionError::DedupPersistenceError(e.to_string()))
    }

    async fn mirror_to_redis(
        &self,
        print: &str,
        unique_id: &str,
        first_seen: DateTime<Utc>,
        mut redis: redis::aio::ConnectionManager,
    ) -> Result<()> {
        let key = format!("dedup:{}", print);
        let value = format!("{}|{}", unique_id, first_seen.timestamp());
        redis::cmd("SET")
            .arg(&key)
            .arg(value)
            .arg("EX")
            .arg(self.config.redis_ttl_secs)
            .query_async::<()>(&mut redis)
            .await
            .map_err(|e| IngestionError::DedupPersistenceError(e.to_string()))?;
        Ok(())
    }

    /// Drops entries older than the retention horizon
    pub fn prune(&self, retention_secs: u64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::seconds(retention_secs as i64);
        let mut cache = self.cache.lock();

        let Cache {
            entries,
            insertion_order,
        } = &mut *cache;

        let before = entries.len();
        entries.retain(|_, entry| entry.first_seen >= cutoff);
        insertion_order.retain(|print| entries.contains_key(print));

        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.cache.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().entries.is_empty()
    }
}
