//! Short-lived verdict cache keyed by crop content, lighting and time.
//!
//! Disabled by default: a replayed "real" verdict is a spoofing risk, so
//! live verdicts are only cached when they clear a high confidence floor,
//! and failures are never cached at all.

use crate::types::{Status, Verdict};
use image::{imageops, RgbImage};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// --- Named constants ---
const HISTOGRAM_BINS: usize = 16;
pub const DEFAULT_CONFIDENCE_FLOOR: f32 = 0.98;

struct CacheEntry {
    stored_at: Instant,
    verdict: Verdict,
}

pub struct VerdictCache {
    duration: Option<Duration>,
    confidence_floor: f32,
    entries: HashMap<String, CacheEntry>,
}

impl VerdictCache {
    /// `duration_secs <= 0` disables the cache.
    pub fn new(duration_secs: f32, confidence_floor: f32) -> Self {
        Self {
            duration: to_duration(duration_secs),
            confidence_floor,
            entries: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.duration.is_some()
    }

    pub fn duration_secs(&self) -> f32 {
        self.duration.map(|d| d.as_secs_f32()).unwrap_or(0.0)
    }

    pub fn confidence_floor(&self) -> f32 {
        self.confidence_floor
    }

    /// Change the retention window. Disabling drops every entry.
    pub fn set_duration(&mut self, duration_secs: f32) {
        self.duration = to_duration(duration_secs);
        if self.duration.is_none() {
            self.entries.clear();
        }
        tracing::info!(duration_secs, "verdict cache duration updated");
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cache key for a crop pair, or `None` while the cache is disabled.
    pub fn key(&self, crop_v2: &RgbImage, crop_v1se: &RgbImage) -> Option<String> {
        self.duration?;
        let bucket = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Some(cache_key(crop_v2, crop_v1se, bucket))
    }

    pub fn get(&mut self, key: &str) -> Option<Verdict> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&mut self, key: &str, now: Instant) -> Option<Verdict> {
        let duration = self.duration?;
        let entry = self.entries.get(key)?;

        if now.saturating_duration_since(entry.stored_at) > duration {
            self.entries.remove(key);
            return None;
        }
        if !is_cacheable(&entry.verdict, self.confidence_floor) {
            self.entries.remove(key);
            return None;
        }

        let mut verdict = entry.verdict.clone();
        verdict.cached = true;
        Some(verdict)
    }

    /// Store a verdict. Returns whether it was accepted.
    pub fn put(&mut self, key: &str, verdict: &Verdict) -> bool {
        self.put_at(key, verdict, Instant::now())
    }

    pub fn put_at(&mut self, key: &str, verdict: &Verdict, now: Instant) -> bool {
        let Some(duration) = self.duration else {
            return false;
        };
        if !is_cacheable(verdict, self.confidence_floor) {
            return false;
        }

        self.entries
            .retain(|_, e| now.saturating_duration_since(e.stored_at) <= duration);
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                stored_at: now,
                verdict: verdict.sanitized(),
            },
        );
        true
    }
}

fn to_duration(secs: f32) -> Option<Duration> {
    if secs > 0.0 {
        Duration::try_from_secs_f32(secs).ok()
    } else {
        None
    }
}

/// Failures are never cached; live verdicts only above the confidence floor.
pub fn is_cacheable(verdict: &Verdict, confidence_floor: f32) -> bool {
    if verdict.status.is_failure() || verdict.error.is_some() {
        return false;
    }
    !(verdict.status == Status::Real && verdict.confidence < confidence_floor)
}

/// SHA-256 over both crops, the texture crop's brightness histogram and a
/// one-second time bucket, as lowercase hex.
pub fn cache_key(crop_v2: &RgbImage, crop_v1se: &RgbImage, time_bucket: u64) -> String {
    let mut hasher = Sha256::new();
    for crop in [crop_v2, crop_v1se] {
        hasher.update(crop.width().to_le_bytes());
        hasher.update(crop.height().to_le_bytes());
        hasher.update(crop.as_raw());
    }
    for count in brightness_histogram(crop_v2) {
        hasher.update(count.to_le_bytes());
    }
    hasher.update(time_bucket.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

fn brightness_histogram(crop: &RgbImage) -> [u32; HISTOGRAM_BINS] {
    let gray = imageops::grayscale(crop);
    let mut hist = [0u32; HISTOGRAM_BINS];
    let width = 256 / HISTOGRAM_BINS;
    for &v in gray.as_raw() {
        hist[v as usize / width] += 1;
    }
    hist
}
