//! Per-track temporal consistency analysis.
//!
//! Live faces produce scores and textures that jitter slightly from frame
//! to frame. Printed photos and paused screen replays are static: the
//! texture barely changes and the score barely moves. The analyzer keeps a
//! short history per tracked face and classifies the pattern.

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use imageproc::gradients::sobel_gradients;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

// --- Named constants ---
const MIN_SAMPLES_FOR_ANALYSIS: usize = 3;
const MIN_SAMPLES_FOR_STABILITY: usize = 2;
const MAJORITY_FRACTION: f32 = 0.8;
const UNCERTAIN_CONFIDENCE: f32 = 0.5;
const STATIC_BASE_CONFIDENCE: f32 = 0.9;
const TEXTURE_THUMBNAIL: u32 = 32;
const HISTOGRAM_BINS: usize = 16;
/// Largest Sobel gradient magnitude on 8-bit input (4 * 255 * sqrt 2).
const MAX_GRADIENT: f32 = 1442.4978;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct TemporalConfig {
    /// Samples kept per track.
    pub history_size: usize,
    /// Real-score variance below which a track counts as steady.
    pub score_variance_threshold: f32,
    /// Texture correlation above which consecutive frames count as identical.
    pub correlation_threshold: f32,
    /// Mean texture change below which a track shows no micro-movement.
    pub micro_movement_threshold: f32,
    /// Tracks and samples not refreshed within this window are dropped.
    pub history_timeout_secs: f32,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            history_size: 5,
            score_variance_threshold: 0.03,
            correlation_threshold: 0.97,
            micro_movement_threshold: 0.001,
            history_timeout_secs: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TemporalVerdict {
    Real,
    Spoof,
    Uncertain,
}

/// Statistics behind a temporal verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemporalDiagnostics {
    pub samples: usize,
    pub current_real_score: f32,
    pub current_fake_score: f32,
    pub score_variance: f32,
    pub mean_real_score: f32,
    pub mean_fake_score: f32,
    /// Fraction of samples where fake > real.
    pub fake_fraction: f32,
    /// Fraction of samples where real > fake.
    pub real_fraction: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub texture_correlation: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub texture_change: Option<f32>,
    pub decision_reason: String,
}

struct Sample {
    real: f32,
    fake: f32,
    texture: Option<Vec<f32>>,
    at: Instant,
}

struct TrackHistory {
    samples: VecDeque<Sample>,
    last_seen: Instant,
}

pub struct TemporalConsistencyAnalyzer {
    config: TemporalConfig,
    tracks: HashMap<i64, TrackHistory>,
}

impl TemporalConsistencyAnalyzer {
    pub fn new(config: TemporalConfig) -> Self {
        Self {
            config,
            tracks: HashMap::new(),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::try_from_secs_f32(self.config.history_timeout_secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Record one frame's ensemble scores for a track.
    pub fn update_history(&mut self, track_id: i64, real: f32, fake: f32, texture: Option<Vec<f32>>) {
        self.update_history_at(track_id, real, fake, texture, Instant::now());
    }

    pub fn update_history_at(
        &mut self,
        track_id: i64,
        real: f32,
        fake: f32,
        texture: Option<Vec<f32>>,
        now: Instant,
    ) {
        let timeout = self.timeout();
        let capacity = self.config.history_size.max(1);
        let before = self.tracks.len();
        self.tracks
            .retain(|_, t| now.saturating_duration_since(t.last_seen) <= timeout);
        let purged = before - self.tracks.len();
        if purged > 0 {
            tracing::debug!(purged, remaining = self.tracks.len(), "purged stale tracks");
        }

        let history = self.tracks.entry(track_id).or_insert_with(|| TrackHistory {
            samples: VecDeque::with_capacity(capacity),
            last_seen: now,
        });
        history
            .samples
            .retain(|s| now.saturating_duration_since(s.at) <= timeout);
        history.samples.push_back(Sample {
            real,
            fake,
            texture,
            at: now,
        });
        while history.samples.len() > capacity {
            history.samples.pop_front();
        }
        history.last_seen = now;
    }

    /// Classify the recorded pattern for a track.
    pub fn analyze(
        &self,
        track_id: i64,
        real: f32,
        fake: f32,
    ) -> (TemporalVerdict, f32, TemporalDiagnostics) {
        let samples: Vec<&Sample> = self
            .tracks
            .get(&track_id)
            .map(|t| t.samples.iter().collect())
            .unwrap_or_default();

        let n = samples.len();
        let mut diag = TemporalDiagnostics {
            samples: n,
            current_real_score: real,
            current_fake_score: fake,
            score_variance: 0.0,
            mean_real_score: real,
            mean_fake_score: fake,
            fake_fraction: 0.0,
            real_fraction: 0.0,
            texture_correlation: None,
            texture_change: None,
            decision_reason: String::new(),
        };

        if n < MIN_SAMPLES_FOR_ANALYSIS {
            diag.decision_reason = format!("insufficient history ({n} samples)");
            return (TemporalVerdict::Uncertain, UNCERTAIN_CONFIDENCE, diag);
        }

        let reals: Vec<f32> = samples.iter().map(|s| s.real).collect();
        let fakes: Vec<f32> = samples.iter().map(|s| s.fake).collect();
        let (mean_real, variance) = mean_and_variance(&reals);
        let mean_fake = fakes.iter().sum::<f32>() / n as f32;
        let fake_fraction = samples.iter().filter(|s| s.fake > s.real).count() as f32 / n as f32;
        let real_fraction = samples.iter().filter(|s| s.real > s.fake).count() as f32 / n as f32;

        let textures: Vec<&[f32]> = samples.iter().filter_map(|s| s.texture.as_deref()).collect();
        let (correlation, change) = texture_dynamics(&textures);

        diag.score_variance = variance;
        diag.mean_real_score = mean_real;
        diag.mean_fake_score = mean_fake;
        diag.fake_fraction = fake_fraction;
        diag.real_fraction = real_fraction;
        diag.texture_correlation = correlation;
        diag.texture_change = change;

        let cfg = &self.config;
        let static_pattern = matches!(
            (correlation, change),
            (Some(c), Some(d)) if c > cfg.correlation_threshold && d < cfg.micro_movement_threshold
        ) && variance < cfg.score_variance_threshold;

        if static_pattern {
            diag.decision_reason = "static texture with no micro-movement".into();
            let confidence = (STATIC_BASE_CONFIDENCE + 0.1 * fake_fraction).min(1.0);
            return (TemporalVerdict::Spoof, confidence, diag);
        }

        if fake_fraction >= MAJORITY_FRACTION {
            diag.decision_reason = "consistent spoof scores across frames".into();
            return (TemporalVerdict::Spoof, mean_fake, diag);
        }

        if real_fraction >= MAJORITY_FRACTION && variance < cfg.score_variance_threshold {
            diag.decision_reason = "stable live scores across frames".into();
            return (TemporalVerdict::Real, mean_real, diag);
        }

        diag.decision_reason = "mixed or unstable scores".into();
        (TemporalVerdict::Uncertain, UNCERTAIN_CONFIDENCE, diag)
    }

    /// `1 - 2·stddev` of the track's real scores, clamped to `[0, 1]`.
    pub fn get_stability(&self, track_id: i64) -> Option<f32> {
        let track = self.tracks.get(&track_id)?;
        if track.samples.len() < MIN_SAMPLES_FOR_STABILITY {
            return None;
        }
        let reals: Vec<f32> = track.samples.iter().map(|s| s.real).collect();
        let (_, variance) = mean_and_variance(&reals);
        Some((1.0 - 2.0 * variance.sqrt()).clamp(0.0, 1.0))
    }

    pub fn reset(&mut self) {
        self.tracks.clear();
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }
}

impl Default for TemporalConsistencyAnalyzer {
    fn default() -> Self {
        Self::new(TemporalConfig::default())
    }
}

/// Texture descriptor of a crop: a normalised 16-bin histogram of Sobel
/// gradient magnitudes on a 32×32 grayscale thumbnail followed by a
/// normalised 16-bin intensity histogram.
pub fn extract_texture_features(crop: &RgbImage) -> Vec<f32> {
    let gray = imageops::grayscale(crop);
    let thumb: GrayImage =
        imageops::resize(&gray, TEXTURE_THUMBNAIL, TEXTURE_THUMBNAIL, FilterType::Triangle);
    let magnitudes = sobel_gradients(&thumb);

    let mut gradient = [0.0f32; HISTOGRAM_BINS];
    let mut intensity = [0.0f32; HISTOGRAM_BINS];
    for (&v, &magnitude) in thumb.as_raw().iter().zip(magnitudes.as_raw()) {
        gradient[bin(magnitude as f32 / MAX_GRADIENT)] += 1.0;
        intensity[bin(v as f32 / 256.0)] += 1.0;
    }

    let total = thumb.as_raw().len() as f32;
    gradient
        .iter()
        .chain(intensity.iter())
        .map(|c| c / total)
        .collect()
}

fn bin(fraction: f32) -> usize {
    ((fraction * HISTOGRAM_BINS as f32) as usize).min(HISTOGRAM_BINS - 1)
}

fn mean_and_variance(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    (mean, variance)
}

/// Mean Pearson correlation and mean absolute change between consecutive
/// texture descriptors. `None` with fewer than two descriptors.
fn texture_dynamics(textures: &[&[f32]]) -> (Option<f32>, Option<f32>) {
    if textures.len() < 2 {
        return (None, None);
    }

    let pairs = textures.windows(2);
    let count = (textures.len() - 1) as f32;
    let mut corr_sum = 0.0;
    let mut change_sum = 0.0;
    for pair in pairs {
        corr_sum += pearson(pair[0], pair[1]);
        let len = pair[0].len().min(pair[1].len()).max(1) as f32;
        change_sum += pair[0]
            .iter()
            .zip(pair[1])
            .map(|(a, b)| (a - b).abs())
            .sum::<f32>()
            / len;
    }

    (Some(corr_sum / count), Some(change_sum / count))
}

fn pearson(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let (a, b) = (&a[..n], &b[..n]);
    let (mean_a, var_a) = mean_and_variance(a);
    let (mean_b, var_b) = mean_and_variance(b);

    let denom = (var_a * var_b).sqrt();
    if denom <= f32::EPSILON {
        let identical = a.iter().zip(b).all(|(x, y)| (x - y).abs() <= f32::EPSILON);
        return if identical { 1.0 } else { 0.0 };
    }

    let cov = a
        .iter()
        .zip(b)
        .map(|(x, y)| (x - mean_a) * (y - mean_b))
        .sum::<f32>()
        / n as f32;
    cov / denom
}
