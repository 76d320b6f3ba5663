//! Crop quality assessment: resolution, sharpness and exposure.
//!
//! The score only tightens or loosens the adaptive threshold. A failed
//! assessment never rejects a face on its own.

use image::{imageops, GrayImage, RgbImage};
use imageproc::filter::filter3x3;
use serde::{Deserialize, Serialize};

// --- Named constants ---
const OVEREXPOSED_LEVEL: u8 = 250;
const UNDEREXPOSED_LEVEL: u8 = 5;
const K_LAPLACIAN: [f32; 9] = [0.0, 1.0, 0.0, 1.0, -4.0, 1.0, 0.0, 1.0, 0.0];

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Minimum crop side in pixels.
    pub min_resolution: u32,
    /// Minimum variance of the Laplacian.
    pub blur_threshold: f32,
    pub brightness_min: f32,
    pub brightness_max: f32,
    /// Maximum fraction of near-white pixels.
    pub overexposure_ratio: f32,
    /// Maximum fraction of near-black pixels.
    pub underexposure_ratio: f32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_resolution: 80,
            blur_threshold: 100.0,
            brightness_min: 40.0,
            brightness_max: 220.0,
            overexposure_ratio: 0.30,
            underexposure_ratio: 0.30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssue {
    LowResolution,
    Blurry,
    TooDark,
    TooBright,
    Overexposed,
    Underexposed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityAssessment {
    pub passed: bool,
    /// Overall quality in `[0, 1]`.
    pub score: f32,
    pub blur_variance: f32,
    pub brightness: f32,
    pub issues: Vec<QualityIssue>,
}

/// Assesses a face crop before it is scored.
pub trait QualityGate: Send {
    fn assess(&self, crop: &RgbImage) -> QualityAssessment;
}

/// Default gate built from simple image statistics.
#[derive(Debug, Clone, Default)]
pub struct CropQualityGate {
    config: QualityConfig,
}

impl CropQualityGate {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }
}

impl QualityGate for CropQualityGate {
    fn assess(&self, crop: &RgbImage) -> QualityAssessment {
        let cfg = &self.config;
        let gray = imageops::grayscale(crop);
        let mut issues = Vec::new();

        let min_side = crop.width().min(crop.height());
        if min_side < cfg.min_resolution {
            issues.push(QualityIssue::LowResolution);
        }
        let resolution_score = if cfg.min_resolution == 0 {
            1.0
        } else {
            (min_side as f32 / cfg.min_resolution as f32).min(1.0)
        };

        let blur_variance = laplacian_variance(&gray);
        if blur_variance < cfg.blur_threshold {
            issues.push(QualityIssue::Blurry);
        }
        let blur_score = if cfg.blur_threshold <= 0.0 {
            1.0
        } else {
            (blur_variance / cfg.blur_threshold).min(1.0)
        };

        let stats = exposure_stats(&gray);
        if stats.mean < cfg.brightness_min {
            issues.push(QualityIssue::TooDark);
        } else if stats.mean > cfg.brightness_max {
            issues.push(QualityIssue::TooBright);
        }
        let mid = (cfg.brightness_min + cfg.brightness_max) / 2.0;
        let half_range = ((cfg.brightness_max - cfg.brightness_min) / 2.0).max(1.0);
        let brightness_score = (1.0 - (stats.mean - mid).abs() / half_range).clamp(0.0, 1.0);

        if stats.over_fraction > cfg.overexposure_ratio {
            issues.push(QualityIssue::Overexposed);
        }
        if stats.under_fraction > cfg.underexposure_ratio {
            issues.push(QualityIssue::Underexposed);
        }
        let exposure_score = (1.0 - stats.over_fraction.max(stats.under_fraction)).clamp(0.0, 1.0);

        let score = (resolution_score + blur_score + brightness_score + exposure_score) / 4.0;

        QualityAssessment {
            passed: issues.is_empty(),
            score,
            blur_variance,
            brightness: stats.mean,
            issues,
        }
    }
}

/// Variance of the 4-neighbour Laplacian over interior pixels.
pub fn laplacian_variance(gray: &GrayImage) -> f32 {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }

    let lap: Vec<f32> = filter3x3(gray, &K_LAPLACIAN).into_raw();
    let (w, h) = (w as usize, h as usize);
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for row in lap.chunks_exact(w).skip(1).take(h - 2) {
        for &v in &row[1..w - 1] {
            sum += v as f64;
            sum_sq += (v as f64) * (v as f64);
        }
    }

    let n = ((w - 2) * (h - 2)) as f64;
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0) as f32
}

struct ExposureStats {
    mean: f32,
    over_fraction: f32,
    under_fraction: f32,
}

fn exposure_stats(gray: &GrayImage) -> ExposureStats {
    let total = gray.as_raw().len();
    if total == 0 {
        return ExposureStats {
            mean: 0.0,
            over_fraction: 0.0,
            under_fraction: 1.0,
        };
    }

    let mut sum = 0u64;
    let mut over = 0usize;
    let mut under = 0usize;
    for &v in gray.as_raw() {
        sum += v as u64;
        if v >= OVEREXPOSED_LEVEL {
            over += 1;
        }
        if v <= UNDEREXPOSED_LEVEL {
            under += 1;
        }
    }

    ExposureStats {
        mean: sum as f32 / total as f32,
        over_fraction: over as f32 / total as f32,
        under_fraction: under as f32 / total as f32,
    }
}
