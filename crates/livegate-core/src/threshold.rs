//! Context-adjusted decision threshold.
//!
//! Positive boosts make the detector stricter (a higher real score is
//! needed), negative boosts relax it. The result is always clamped.

use crate::temporal::TemporalVerdict;
use crate::types::ModelScore;
use serde::{Deserialize, Serialize};

// --- Named constants ---
const DISAGREEMENT_LIMIT: f32 = 0.3;
const DISAGREEMENT_BOOST: f32 = 0.05;
const AGREEMENT_LIMIT: f32 = 0.1;
const CONFIDENT_REAL: f32 = 0.8;
const AGREEMENT_RELIEF: f32 = -0.03;
const LOW_QUALITY: f32 = 0.5;
const LOW_QUALITY_BOOST: f32 = 0.05;
const HIGH_QUALITY: f32 = 0.8;
const HIGH_QUALITY_RELIEF: f32 = -0.02;
const LOW_STABILITY: f32 = 0.4;
const LOW_STABILITY_BOOST: f32 = 0.03;
const HIGH_STABILITY: f32 = 0.8;
const HIGH_STABILITY_RELIEF: f32 = -0.02;
const TEMPORAL_MIN_CONFIDENCE: f32 = 0.7;
const TEMPORAL_SPOOF_GAIN: f32 = 0.10;
const TEMPORAL_REAL_GAIN: f32 = -0.05;

/// Bounds for the adjusted threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdClamp {
    pub min: f32,
    pub max: f32,
}

impl Default for ThresholdClamp {
    fn default() -> Self {
        Self { min: 0.40, max: 0.85 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdAdjustment {
    pub base_threshold: f32,
    pub adjusted_threshold: f32,
    pub total_boost: f32,
    pub explanation: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AdaptiveThresholdManager {
    base_threshold: f32,
    clamp: ThresholdClamp,
}

impl AdaptiveThresholdManager {
    pub fn new(base_threshold: f32, clamp: ThresholdClamp) -> Self {
        Self {
            base_threshold,
            clamp,
        }
    }

    pub fn base_threshold(&self) -> f32 {
        self.base_threshold
    }

    pub fn set_base_threshold(&mut self, threshold: f32) {
        self.base_threshold = threshold;
    }

    pub fn adjust(
        &self,
        v2: &ModelScore,
        v1se: &ModelScore,
        quality: Option<f32>,
        stability: Option<f32>,
        temporal_verdict: Option<TemporalVerdict>,
        temporal_confidence: Option<f32>,
    ) -> ThresholdAdjustment {
        let mut boost = 0.0f32;
        let mut explanation = Vec::new();
        let mut apply = |delta: f32, reason: String| {
            boost += delta;
            explanation.push(format!("{reason} ({delta:+.3})"));
        };

        let gap = (v2.real_score - v1se.real_score).abs();
        if gap > DISAGREEMENT_LIMIT {
            apply(DISAGREEMENT_BOOST, format!("model disagreement {gap:.2}"));
        } else if gap < AGREEMENT_LIMIT
            && v2.real_score > CONFIDENT_REAL
            && v1se.real_score > CONFIDENT_REAL
        {
            apply(AGREEMENT_RELIEF, "models agree on a confident live face".into());
        }

        if let Some(q) = quality {
            if q < LOW_QUALITY {
                apply(LOW_QUALITY_BOOST, format!("low crop quality {q:.2}"));
            } else if q > HIGH_QUALITY {
                apply(HIGH_QUALITY_RELIEF, format!("high crop quality {q:.2}"));
            }
        }

        if let Some(s) = stability {
            if s < LOW_STABILITY {
                apply(LOW_STABILITY_BOOST, format!("unstable track {s:.2}"));
            } else if s > HIGH_STABILITY {
                apply(HIGH_STABILITY_RELIEF, format!("stable track {s:.2}"));
            }
        }

        if let (Some(verdict), Some(conf)) = (temporal_verdict, temporal_confidence) {
            if conf >= TEMPORAL_MIN_CONFIDENCE {
                match verdict {
                    TemporalVerdict::Spoof => {
                        apply(TEMPORAL_SPOOF_GAIN * conf, format!("temporal spoof {conf:.2}"))
                    }
                    TemporalVerdict::Real => {
                        apply(TEMPORAL_REAL_GAIN * conf, format!("temporal live {conf:.2}"))
                    }
                    TemporalVerdict::Uncertain => {}
                }
            }
        }

        let adjusted = (self.base_threshold + boost).clamp(self.clamp.min, self.clamp.max);
        tracing::debug!(
            base = self.base_threshold,
            adjusted,
            boost,
            reasons = ?explanation,
            "adaptive threshold"
        );

        ThresholdAdjustment {
            base_threshold: self.base_threshold,
            adjusted_threshold: adjusted,
            total_boost: boost,
            explanation,
        }
    }
}
