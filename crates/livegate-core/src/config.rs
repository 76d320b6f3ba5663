use crate::ensemble::TemporalOverride;
use crate::quality::QualityConfig;
use crate::scale::ScaleSeparation;
use crate::temporal::TemporalConfig;
use crate::threshold::ThresholdClamp;
use serde::Deserialize;
use thiserror::Error;

// --- Named constants ---
/// Default file name of the MiniFASNetV2 texture model.
pub const MODEL_V2_FILE: &str = "2.7_80x80_MiniFASNetV2.onnx";
/// Default file name of the MiniFASNetV1SE shape model.
pub const MODEL_V1SE_FILE: &str = "4_0_0_80x80_MiniFASNetV1SE.onnx";
const DEFAULT_MODEL_DIR: &str = "models";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be {expected}, got {value}")]
    OutOfRange {
        field: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("ensemble weights must be finite, non-negative and not both zero (v2 = {v2}, v1se = {v1se})")]
    InvalidWeights { v2: f32, v1se: f32 },
    #[error("threshold clamp is inverted: min {min} > max {max}")]
    InvertedClamp { min: f32, max: f32 },
}

/// Detector settings. Every field has a working default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// MiniFASNetV2 (texture, 2.7× crop).
    pub model_v2_path: String,
    /// MiniFASNetV1SE (shape, 4.0× crop).
    pub model_v1se_path: String,
    pub input_size: u32,
    pub threshold: f32,
    pub v2_weight: f32,
    pub v1se_weight: f32,
    pub max_batch_size: usize,
    /// Seconds; 0 disables the cache.
    pub cache_duration_secs: f32,
    pub cache_confidence_floor: f32,
    pub enable_quality_gate: bool,
    pub enable_temporal_analysis: bool,
    pub enable_adaptive_threshold: bool,
    /// Faces smaller than this on either side are rejected as `too_small`.
    pub min_face_size: f32,
    pub texture_scale: f64,
    pub shape_scale: f64,
    pub scale_separation: ScaleSeparation,
    pub temporal_override: TemporalOverride,
    pub threshold_clamp: ThresholdClamp,
    pub temporal: TemporalConfig,
    pub quality: QualityConfig,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_v2_path: format!("{DEFAULT_MODEL_DIR}/{MODEL_V2_FILE}"),
            model_v1se_path: format!("{DEFAULT_MODEL_DIR}/{MODEL_V1SE_FILE}"),
            input_size: crate::predictor::MINIFASNET_INPUT_SIZE,
            threshold: 0.65,
            v2_weight: crate::ensemble::DEFAULT_V2_WEIGHT,
            v1se_weight: crate::ensemble::DEFAULT_V1SE_WEIGHT,
            max_batch_size: 8,
            cache_duration_secs: 0.0,
            cache_confidence_floor: crate::cache::DEFAULT_CONFIDENCE_FLOOR,
            enable_quality_gate: true,
            enable_temporal_analysis: true,
            enable_adaptive_threshold: true,
            min_face_size: 24.0,
            texture_scale: 2.7,
            shape_scale: 4.0,
            scale_separation: ScaleSeparation::default(),
            temporal_override: TemporalOverride::default(),
            threshold_clamp: ThresholdClamp::default(),
            temporal: TemporalConfig::default(),
            quality: QualityConfig::default(),
            intra_threads: 2,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        unit("threshold", self.threshold)?;
        unit("cache_confidence_floor", self.cache_confidence_floor)?;
        unit("temporal_override.min_confidence", self.temporal_override.min_confidence)?;
        unit("threshold_clamp.min", self.threshold_clamp.min)?;
        unit("threshold_clamp.max", self.threshold_clamp.max)?;

        let (v2, v1se) = (self.v2_weight, self.v1se_weight);
        if !v2.is_finite() || !v1se.is_finite() || v2 < 0.0 || v1se < 0.0 || v2 + v1se <= 0.0 {
            return Err(ConfigError::InvalidWeights { v2, v1se });
        }

        if self.threshold_clamp.min > self.threshold_clamp.max {
            return Err(ConfigError::InvertedClamp {
                min: self.threshold_clamp.min,
                max: self.threshold_clamp.max,
            });
        }

        positive("max_batch_size", self.max_batch_size as f64)?;
        positive("input_size", self.input_size as f64)?;
        positive("intra_threads", self.intra_threads as f64)?;
        positive("texture_scale", self.texture_scale)?;
        positive("shape_scale", self.shape_scale)?;
        positive("temporal.history_size", self.temporal.history_size as f64)?;

        if !self.cache_duration_secs.is_finite() || self.cache_duration_secs < 0.0 {
            return Err(out_of_range("cache_duration_secs", "finite and >= 0", self.cache_duration_secs));
        }
        if !self.min_face_size.is_finite() || self.min_face_size < 0.0 {
            return Err(out_of_range("min_face_size", "finite and >= 0", self.min_face_size));
        }
        let ratio = self.scale_separation.target_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(out_of_range("scale_separation.target_ratio", "in (0, 1]", ratio));
        }

        Ok(())
    }
}

fn out_of_range(field: &'static str, expected: &'static str, value: impl ToString) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        expected,
        value: value.to_string(),
    }
}

fn unit(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(out_of_range(field, "in [0, 1]", value))
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(out_of_range(field, "> 0", value))
    }
}
