//! Weighted dual-model ensemble with temporal override and adaptive threshold.

use crate::temporal::{extract_texture_features, TemporalConsistencyAnalyzer, TemporalVerdict};
use crate::threshold::AdaptiveThresholdManager;
use crate::types::{
    EnsembleMethod, ModelScore, PerModelScores, SpoofType, Status, Verdict, MODEL_TYPE,
};
use image::RgbImage;
use serde::Deserialize;
use thiserror::Error;

// --- Named constants ---
pub const DEFAULT_V2_WEIGHT: f32 = 0.6;
pub const DEFAULT_V1SE_WEIGHT: f32 = 0.4;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecisionError {
    #[error("{model} model failed: {reason}")]
    ModelFailure { model: &'static str, reason: String },
    #[error("non-finite {0}")]
    NonFinite(&'static str),
}

/// When a temporal SPOOF verdict may override a borderline ensemble score.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct TemporalOverride {
    pub min_confidence: f32,
    /// The ensemble real score must be below this.
    pub max_real_score: f32,
    /// The ensemble fake score must be above this.
    pub min_fake_score: f32,
}

impl Default for TemporalOverride {
    fn default() -> Self {
        Self {
            min_confidence: 0.90,
            max_real_score: 0.7,
            min_fake_score: 0.6,
        }
    }
}

impl TemporalOverride {
    fn applies(&self, confidence: f32, real: f32, fake: f32) -> bool {
        confidence >= self.min_confidence && real < self.max_real_score && fake > self.min_fake_score
    }
}

/// Normalise a weight pair to sum to 1. Degenerate pairs fall back to the
/// default split.
pub fn normalize_weights(v2: f32, v1se: f32) -> (f32, f32) {
    let total = v2 + v1se;
    if !v2.is_finite() || !v1se.is_finite() || v2 < 0.0 || v1se < 0.0 || total <= 0.0 {
        tracing::warn!(v2, v1se, "invalid ensemble weights; using default split");
        return (DEFAULT_V2_WEIGHT, DEFAULT_V1SE_WEIGHT);
    }
    (v2 / total, v1se / total)
}

/// Turns a pair of model scores into a final [`Verdict`].
pub struct EnsembleEngine {
    v2_weight: f32,
    v1se_weight: f32,
    threshold: f32,
    override_rule: TemporalOverride,
    temporal: Option<TemporalConsistencyAnalyzer>,
    adaptive: Option<AdaptiveThresholdManager>,
}

impl EnsembleEngine {
    pub fn new(v2_weight: f32, v1se_weight: f32, threshold: f32) -> Self {
        let (v2_weight, v1se_weight) = normalize_weights(v2_weight, v1se_weight);
        Self {
            v2_weight,
            v1se_weight,
            threshold,
            override_rule: TemporalOverride::default(),
            temporal: None,
            adaptive: None,
        }
    }

    pub fn with_temporal(mut self, analyzer: TemporalConsistencyAnalyzer) -> Self {
        self.temporal = Some(analyzer);
        self
    }

    pub fn with_temporal_override(mut self, rule: TemporalOverride) -> Self {
        self.override_rule = rule;
        self
    }

    pub fn with_adaptive_threshold(mut self, manager: AdaptiveThresholdManager) -> Self {
        self.adaptive = Some(manager);
        self
    }

    pub fn weights(&self) -> (f32, f32) {
        (self.v2_weight, self.v1se_weight)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
        if let Some(manager) = self.adaptive.as_mut() {
            manager.set_base_threshold(threshold);
        }
    }

    pub fn temporal_enabled(&self) -> bool {
        self.temporal.is_some()
    }

    pub fn adaptive_enabled(&self) -> bool {
        self.adaptive.is_some()
    }

    /// Decide one face. Never fails: internal errors yield a fail-closed
    /// `error` verdict.
    pub fn decide(
        &mut self,
        v2: &ModelScore,
        v1se: &ModelScore,
        track_id: Option<i64>,
        quality_score: Option<f32>,
        texture_crop: Option<&RgbImage>,
    ) -> Verdict {
        match self.try_decide(v2, v1se, track_id, quality_score, texture_crop) {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::error!(error = %e, track_id, "ensemble decision failed; failing closed");
                let mut verdict = Verdict::rejected(Status::Error, e.to_string(), self.threshold);
                verdict.model_scores = Some(PerModelScores::new(v2, v1se));
                verdict.quality_score = quality_score;
                verdict.error = Some(e.to_string());
                verdict
            }
        }
    }

    fn try_decide(
        &mut self,
        v2: &ModelScore,
        v1se: &ModelScore,
        track_id: Option<i64>,
        quality_score: Option<f32>,
        texture_crop: Option<&RgbImage>,
    ) -> Result<Verdict, DecisionError> {
        for (model, score) in [("texture", v2), ("shape", v1se)] {
            if let Some(reason) = &score.error {
                return Err(DecisionError::ModelFailure {
                    model,
                    reason: reason.clone(),
                });
            }
        }
        finite("model score", &[v2.real_score, v2.fake_score, v1se.real_score, v1se.fake_score])?;

        let real = v2.real_score * self.v2_weight + v1se.real_score * self.v1se_weight;
        let fake = v2.fake_score * self.v2_weight + v1se.fake_score * self.v1se_weight;
        finite("ensemble score", &[real, fake])?;

        let mut temporal = None;
        let mut stability = None;
        if let (Some(analyzer), Some(track)) = (self.temporal.as_mut(), track_id.filter(|&t| t > 0)) {
            let texture = texture_crop.map(extract_texture_features);
            analyzer.update_history(track, real, fake, texture);
            temporal = Some(analyzer.analyze(track, real, fake));
            stability = analyzer.get_stability(track);
        }

        let mut verdict = Verdict {
            is_real: false,
            real_score: real,
            fake_score: fake,
            confidence: 0.0,
            threshold: self.threshold,
            adjusted_threshold: self.threshold,
            status: Status::Fake,
            label: String::new(),
            message: String::new(),
            model_scores: Some(PerModelScores::new(v2, v1se)),
            ensemble_method: EnsembleMethod::AdaptiveTemporal,
            temporal_verdict: None,
            temporal_confidence: None,
            temporal_analysis: None,
            threshold_info: None,
            quality_score,
            error: None,
            model_type: MODEL_TYPE.to_string(),
            cached: false,
            processing_time_ms: 0.0,
        };

        let (mut t_verdict_seen, mut t_conf_seen) = (None, None);
        if let Some((t_verdict, t_conf, diagnostics)) = temporal {
            t_verdict_seen = Some(t_verdict);
            t_conf_seen = Some(t_conf);
            // An uncertain analysis is not reported.
            if t_verdict != TemporalVerdict::Uncertain {
                verdict.temporal_verdict = Some(t_verdict);
                verdict.temporal_confidence = Some(t_conf);
                verdict.temporal_analysis = Some(diagnostics);
            }

            if t_verdict == TemporalVerdict::Spoof && self.override_rule.applies(t_conf, real, fake) {
                tracing::warn!(
                    track_id,
                    temporal_confidence = t_conf,
                    real,
                    fake,
                    "temporal override: borderline face flagged as spoof"
                );
                verdict.confidence = t_conf;
                verdict.label = "Spoof Detected (Temporal)".into();
                verdict.message = "Static or replayed pattern detected across frames".into();
                verdict.ensemble_method = EnsembleMethod::TemporalOverride;
                return Ok(verdict);
            }
        }

        if let Some(manager) = &self.adaptive {
            let adjustment = manager.adjust(
                v2,
                v1se,
                quality_score,
                stability,
                t_verdict_seen,
                t_conf_seen,
            );
            verdict.adjusted_threshold = adjustment.adjusted_threshold;
            verdict.threshold_info = Some(adjustment);
        }

        verdict.is_real = real > verdict.adjusted_threshold;
        if verdict.is_real {
            verdict.status = Status::Real;
            verdict.confidence = real;
            verdict.label = "Live Face".into();
            verdict.message = "Live face detected".into();
        } else {
            verdict.status = Status::Fake;
            verdict.confidence = fake;
            verdict.label = "Spoof Detected".into();
            verdict.message = spoof_message(v2, v1se, self.v2_weight, self.v1se_weight).into();
        }
        finite("confidence", &[verdict.confidence, verdict.adjusted_threshold])?;

        tracing::debug!(
            track_id,
            real,
            fake,
            threshold = verdict.adjusted_threshold,
            status = ?verdict.status,
            "ensemble decision"
        );

        Ok(verdict)
    }
}

fn finite(what: &'static str, values: &[f32]) -> Result<(), DecisionError> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(DecisionError::NonFinite(what))
    }
}

fn spoof_message(v2: &ModelScore, v1se: &ModelScore, w_v2: f32, w_v1se: f32) -> &'static str {
    let combined = ModelScore::from_probabilities(
        v2.spoof_2d_score * w_v2 + v1se.spoof_2d_score * w_v1se,
        v2.real_score * w_v2 + v1se.real_score * w_v1se,
        v2.spoof_3d_score * w_v2 + v1se.spoof_3d_score * w_v1se,
    );
    match combined.spoof_type() {
        SpoofType::TwoD => "Spoof detected: print or screen replay suspected",
        SpoofType::ThreeD => "Spoof detected: mask or 3D replica suspected",
        SpoofType::None | SpoofType::Error => "Spoof detected",
    }
}
