//! Batch orchestrator: one verdict per input face, in input order.
//!
//! Per face: validate box → reject (`invalid_bbox` / `too_small`) or crop
//! both scales → cache lookup → queue for batched inference → ensemble
//! decision → cache store. Anything left without a verdict at the end is
//! reported as `processing_failed`, never as live.

use crate::cache::VerdictCache;
use crate::config::{ConfigError, DetectorConfig};
use crate::crop::{clamped_crop, extract_crop};
use crate::ensemble::EnsembleEngine;
use crate::predictor::{DualModelPredictor, LivenessModel, ModelError, OnnxLivenessModel};
use crate::quality::{CropQualityGate, QualityGate};
use crate::temporal::TemporalConsistencyAnalyzer;
use crate::threshold::AdaptiveThresholdManager;
use crate::types::{FaceDetection, FaceResult, Status, Verdict, MODEL_TYPE};
use image::RgbImage;
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
}

/// Serialisable summary of the running detector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub model_type: &'static str,
    pub model_v2_path: String,
    pub model_v1se_path: String,
    pub input_size: u32,
    pub texture_scale: f64,
    pub shape_scale: f64,
    pub v2_weight: f32,
    pub v1se_weight: f32,
    pub threshold: f32,
    pub max_batch_size: usize,
    pub cache_enabled: bool,
    pub cache_duration_secs: f32,
    pub cache_confidence_floor: f32,
    pub cache_entries: usize,
    pub quality_gate: bool,
    pub temporal_analysis: bool,
    pub adaptive_threshold: bool,
}

/// Texture (2.7×) and shape (4.0×) crops of one face. In the degraded
/// path both hold the same clamped box crop.
struct CropPair {
    texture: RgbImage,
    shape: RgbImage,
}

enum Prepared {
    Ready(CropPair),
    Rejected(Verdict),
}

struct PendingFace {
    index: usize,
    track_id: Option<i64>,
    crops: CropPair,
    cache_key: Option<String>,
}

pub struct LivenessDetector {
    config: DetectorConfig,
    predictor: DualModelPredictor,
    ensemble: EnsembleEngine,
    cache: VerdictCache,
    quality_gate: Option<Box<dyn QualityGate>>,
}

impl LivenessDetector {
    /// Validate `config` and load both MiniFASNet models from disk.
    pub fn load(config: DetectorConfig) -> Result<Self, DetectorError> {
        config.validate()?;

        let texture = OnnxLivenessModel::load(&config.model_v2_path, config.intra_threads)?;
        tracing::info!(path = %config.model_v2_path, "MiniFASNetV2 texture model loaded");

        let shape = OnnxLivenessModel::load(&config.model_v1se_path, config.intra_threads)?;
        tracing::info!(path = %config.model_v1se_path, "MiniFASNetV1SE shape model loaded");

        Ok(Self::new(config, Box::new(texture), Box::new(shape))?)
    }

    /// Build a detector around already-loaded models.
    pub fn new(
        config: DetectorConfig,
        texture_model: Box<dyn LivenessModel>,
        shape_model: Box<dyn LivenessModel>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut ensemble = EnsembleEngine::new(config.v2_weight, config.v1se_weight, config.threshold)
            .with_temporal_override(config.temporal_override);
        if config.enable_temporal_analysis {
            ensemble = ensemble.with_temporal(TemporalConsistencyAnalyzer::new(config.temporal));
        }
        if config.enable_adaptive_threshold {
            ensemble = ensemble.with_adaptive_threshold(AdaptiveThresholdManager::new(
                config.threshold,
                config.threshold_clamp,
            ));
        }

        let quality_gate: Option<Box<dyn QualityGate>> = if config.enable_quality_gate {
            Some(Box::new(CropQualityGate::new(config.quality)))
        } else {
            None
        };

        let (v2_weight, v1se_weight) = ensemble.weights();
        tracing::info!(
            threshold = config.threshold,
            v2_weight,
            v1se_weight,
            max_batch_size = config.max_batch_size,
            cache_duration_secs = config.cache_duration_secs,
            quality_gate = config.enable_quality_gate,
            temporal = config.enable_temporal_analysis,
            adaptive_threshold = config.enable_adaptive_threshold,
            "liveness detector ready"
        );

        Ok(Self {
            predictor: DualModelPredictor::new(texture_model, shape_model, config.input_size),
            cache: VerdictCache::new(config.cache_duration_secs, config.cache_confidence_floor),
            ensemble,
            quality_gate,
            config,
        })
    }

    /// Replace the crop quality gate, enabling it if it was off.
    pub fn with_quality_gate(mut self, gate: Box<dyn QualityGate>) -> Self {
        self.quality_gate = Some(gate);
        self.config.enable_quality_gate = true;
        self
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Score every detection in `image`. The output always has one entry
    /// per detection, in the same order.
    pub fn detect_faces(&mut self, image: &RgbImage, detections: &[FaceDetection]) -> Vec<FaceResult> {
        if detections.is_empty() {
            return Vec::new();
        }

        let started = Instant::now();
        let threshold = self.ensemble.threshold();
        let (frame, scaled) = self.config.scale_separation.ensure_separation(image, detections);

        let mut verdicts: Vec<Option<Verdict>> = vec![None; detections.len()];
        let mut pending = Vec::new();

        for (index, face) in scaled.iter().enumerate() {
            let crops = match self.prepare(&frame, index, face, threshold) {
                Prepared::Ready(crops) => crops,
                Prepared::Rejected(verdict) => {
                    verdicts[index] = Some(verdict);
                    continue;
                }
            };

            let cache_key = self.cache.key(&crops.texture, &crops.shape);
            if let Some(hit) = cache_key.as_deref().and_then(|k| self.cache.get(k)) {
                tracing::debug!(face = index, status = ?hit.status, "verdict cache hit");
                verdicts[index] = Some(hit);
                continue;
            }

            pending.push(PendingFace {
                index,
                track_id: face.tracked_id(),
                crops,
                cache_key,
            });
        }

        for chunk in pending.chunks(self.config.max_batch_size.max(1)) {
            self.score_chunk(chunk, &mut verdicts);
        }

        let elapsed_ms = started.elapsed().as_secs_f32() * 1000.0;
        detections
            .iter()
            .zip(verdicts)
            .enumerate()
            .map(|(index, (detection, verdict))| {
                let mut verdict = verdict.unwrap_or_else(|| {
                    tracing::error!(face = index, "no verdict recorded; failing closed");
                    Verdict::rejected(
                        Status::ProcessingFailed,
                        "Anti-spoofing result missing; marked as spoof for safety",
                        threshold,
                    )
                });
                verdict.processing_time_ms = elapsed_ms;
                FaceResult::new(
                    index,
                    detection.bbox.as_ref().ok().copied(),
                    detection.track_id,
                    verdict,
                    detection.metadata.clone(),
                )
            })
            .collect()
    }

    fn prepare(&self, frame: &RgbImage, index: usize, face: &FaceDetection, threshold: f32) -> Prepared {
        let bbox = match &face.bbox {
            Ok(bbox) => *bbox,
            Err(e) => {
                tracing::debug!(face = index, error = %e, "rejecting face: invalid bounding box");
                return Prepared::Rejected(Verdict::rejected(Status::InvalidBbox, e.to_string(), threshold));
            }
        };

        let min = self.config.min_face_size;
        if bbox.width < min || bbox.height < min {
            return Prepared::Rejected(Verdict::rejected(
                Status::TooSmall,
                format!(
                    "Face too small ({:.1}x{:.1}px). Minimum: {min}x{min}px",
                    bbox.width, bbox.height
                ),
                threshold,
            ));
        }

        let texture = extract_crop(frame, &bbox, self.config.texture_scale);
        let shape = extract_crop(frame, &bbox, self.config.shape_scale);
        if let (Some(texture), Some(shape)) = (texture, shape) {
            return Prepared::Ready(CropPair { texture, shape });
        }

        tracing::warn!(
            face = index,
            width = bbox.width,
            height = bbox.height,
            "scaled crop extraction failed; falling back to raw box crop for both models"
        );
        match clamped_crop(frame, &bbox) {
            Some(crop) => Prepared::Ready(CropPair {
                texture: crop.clone(),
                shape: crop,
            }),
            None => Prepared::Rejected(Verdict::rejected(
                Status::ProcessingFailed,
                "Invalid crop region after boundary clamp",
                threshold,
            )),
        }
    }

    fn score_chunk(&mut self, chunk: &[PendingFace], verdicts: &mut [Option<Verdict>]) {
        let crops_v2: Vec<&RgbImage> = chunk.iter().map(|p| &p.crops.texture).collect();
        let crops_v1se: Vec<&RgbImage> = chunk.iter().map(|p| &p.crops.shape).collect();
        let (v2_scores, v1se_scores) = self.predictor.predict_batch(&crops_v2, &crops_v1se);

        if v2_scores.len() != chunk.len() || v1se_scores.len() != chunk.len() {
            tracing::error!(
                expected = chunk.len(),
                v2 = v2_scores.len(),
                v1se = v1se_scores.len(),
                faces = ?chunk.iter().map(|p| p.index).collect::<Vec<_>>(),
                "anti-spoofing batch size mismatch; failing chunk"
            );
            return;
        }

        for ((face, v2), v1se) in chunk.iter().zip(&v2_scores).zip(&v1se_scores) {
            let quality = self.quality_gate.as_ref().map(|gate| {
                let assessment = gate.assess(&face.crops.texture);
                if !assessment.passed {
                    tracing::debug!(
                        face = face.index,
                        score = assessment.score,
                        issues = ?assessment.issues,
                        "crop quality below gate"
                    );
                }
                assessment.score
            });

            let verdict = self.ensemble.decide(
                v2,
                v1se,
                face.track_id,
                quality,
                Some(&face.crops.texture),
            );
            tracing::debug!(
                face = face.index,
                v2_real = v2.real_score,
                v1se_real = v1se.real_score,
                status = ?verdict.status,
                "face scored"
            );

            if let Some(key) = &face.cache_key {
                self.cache.put(key, &verdict);
            }
            verdicts[face.index] = Some(verdict);
        }
    }

    /// Change the base threshold. Cached verdicts are dropped since they
    /// were decided against the old value.
    pub fn set_threshold(&mut self, threshold: f32) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::OutOfRange {
                field: "threshold",
                expected: "in [0, 1]",
                value: threshold.to_string(),
            });
        }
        self.ensemble.set_threshold(threshold);
        self.config.threshold = threshold;
        self.cache.clear();
        tracing::info!(threshold, "anti-spoofing threshold updated");
        Ok(())
    }

    /// Change the cache retention window; 0 disables caching.
    pub fn set_cache_duration(&mut self, secs: f32) -> Result<(), ConfigError> {
        if !secs.is_finite() || secs < 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "cache_duration_secs",
                expected: "finite and >= 0",
                value: secs.to_string(),
            });
        }
        self.cache.set_duration(secs);
        self.config.cache_duration_secs = secs;
        Ok(())
    }

    pub fn clear_cache(&mut self) {
        let dropped = self.cache.len();
        self.cache.clear();
        tracing::debug!(dropped, "verdict cache cleared");
    }

    pub fn model_info(&self) -> ModelInfo {
        let (v2_weight, v1se_weight) = self.ensemble.weights();
        ModelInfo {
            model_type: MODEL_TYPE,
            model_v2_path: self.config.model_v2_path.clone(),
            model_v1se_path: self.config.model_v1se_path.clone(),
            input_size: self.predictor.input_size(),
            texture_scale: self.config.texture_scale,
            shape_scale: self.config.shape_scale,
            v2_weight,
            v1se_weight,
            threshold: self.ensemble.threshold(),
            max_batch_size: self.config.max_batch_size,
            cache_enabled: self.cache.is_enabled(),
            cache_duration_secs: self.cache.duration_secs(),
            cache_confidence_floor: self.cache.confidence_floor(),
            cache_entries: self.cache.len(),
            quality_gate: self.quality_gate.is_some(),
            temporal_analysis: self.ensemble.temporal_enabled(),
            adaptive_threshold: self.ensemble.adaptive_enabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::testing::{FailingModel, FixedModel, ShortModel};
    use crate::quality::QualityAssessment;
    use crate::types::{BoxError, EnsembleMethod, FaceBox};
    use image::Rgb;
    use serde_json::{json, Map};
    use std::sync::atomic::Ordering;

    const LIVE: [f32; 3] = [0.0, 10.0, 0.0];
    const SPOOF: [f32; 3] = [10.0, 0.0, 0.0];

    fn frame() -> RgbImage {
        RgbImage::from_fn(640, 480, |x, y| {
            let v = ((x * 5 + y * 3) % 180) as u8 + 40;
            Rgb([v, v / 2 + 20, 255 - v])
        })
    }

    fn face(x: f32, y: f32, w: f32, h: f32) -> FaceDetection {
        FaceDetection::new(FaceBox::new(x, y, w, h).unwrap())
    }

    fn boxless(error: BoxError) -> FaceDetection {
        FaceDetection {
            bbox: Err(error),
            track_id: None,
            metadata: Map::new(),
        }
    }

    fn detector_with(config: DetectorConfig, texture: [f32; 3], shape: [f32; 3]) -> LivenessDetector {
        LivenessDetector::new(
            config,
            Box::new(FixedModel::new(texture)),
            Box::new(FixedModel::new(shape)),
        )
        .unwrap()
    }

    fn detector(logits: [f32; 3]) -> LivenessDetector {
        detector_with(DetectorConfig::default(), logits, logits)
    }

    #[test]
    fn test_empty_input_empty_output() {
        let mut d = detector(LIVE);
        assert!(d.detect_faces(&frame(), &[]).is_empty());
    }

    #[test]
    fn test_order_and_length_preserved() {
        let mut d = detector(LIVE);
        let dets = vec![
            face(50.0, 50.0, 80.0, 80.0),
            boxless(BoxError::Missing),
            face(300.0, 200.0, 10.0, 10.0),
            face(400.0, 100.0, 80.0, 80.0).with_track_id(3),
            boxless(BoxError::Malformed("sequence has 3 elements, expected at least 4".into())),
        ];
        let results = d.detect_faces(&frame(), &dets);

        assert_eq!(results.len(), 5);
        let statuses: Vec<Status> = results.iter().map(|r| r.antispoofing.status).collect();
        assert_eq!(
            statuses,
            vec![Status::Real, Status::InvalidBbox, Status::TooSmall, Status::Real, Status::InvalidBbox]
        );
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.face_id, i);
        }
        assert_eq!(results[3].track_id, Some(3));
        assert_eq!(results[2].antispoofing.label, "Move Closer");
        assert!(results[1].bbox.is_none());
    }

    #[test]
    fn test_too_small_makes_no_inference_call() {
        let texture = FixedModel::new(LIVE);
        let shape = FixedModel::new(LIVE);
        let (tc, sc) = (texture.calls.clone(), shape.calls.clone());
        let mut d = LivenessDetector::new(DetectorConfig::default(), Box::new(texture), Box::new(shape)).unwrap();

        let results = d.detect_faces(&frame(), &[face(100.0, 100.0, 10.0, 10.0)]);
        assert_eq!(results[0].antispoofing.status, Status::TooSmall);
        assert!(!results[0].antispoofing.is_real);
        assert_eq!(tc.load(Ordering::SeqCst), 0);
        assert_eq!(sc.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_chunks_by_max_batch_size() {
        let texture = FixedModel::new(SPOOF);
        let calls = texture.calls.clone();
        let config = DetectorConfig {
            max_batch_size: 2,
            ..DetectorConfig::default()
        };
        let mut d = LivenessDetector::new(config, Box::new(texture), Box::new(FixedModel::new(SPOOF))).unwrap();

        let dets: Vec<FaceDetection> = (0..5).map(|i| face(20.0 + 110.0 * i as f32, 200.0, 60.0, 60.0)).collect();
        let results = d.detect_faces(&frame(), &dets);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(results.iter().all(|r| r.antispoofing.status == Status::Fake));
    }

    #[test]
    fn test_inference_failure_fails_closed() {
        let mut d = LivenessDetector::new(
            DetectorConfig::default(),
            Box::new(FailingModel),
            Box::new(FixedModel::new(LIVE)),
        )
        .unwrap();
        let results = d.detect_faces(&frame(), &[face(50.0, 50.0, 80.0, 80.0), face(300.0, 50.0, 80.0, 80.0)]);
        for r in &results {
            assert!(!r.antispoofing.is_real);
            assert_eq!(r.antispoofing.status, Status::Error);
            assert_eq!(r.antispoofing.ensemble_method, EnsembleMethod::Error);
        }
    }

    #[test]
    fn test_row_count_mismatch_fails_whole_chunk() {
        let mut d = LivenessDetector::new(
            DetectorConfig::default(),
            Box::new(ShortModel),
            Box::new(FixedModel::new(LIVE)),
        )
        .unwrap();
        let dets = vec![
            face(50.0, 50.0, 80.0, 80.0),
            face(300.0, 50.0, 80.0, 80.0),
            face(300.0, 300.0, 80.0, 80.0),
        ];
        let results = d.detect_faces(&frame(), &dets);
        assert_eq!(results.len(), 3);
        for r in &results {
            assert_eq!(r.antispoofing.status, Status::ProcessingFailed);
            assert!(!r.antispoofing.is_real);
            assert_eq!(r.antispoofing.confidence, 0.0);
        }
    }

    #[test]
    fn test_results_do_not_alias() {
        let mut d = detector(LIVE);
        let dets = vec![
            face(50.0, 50.0, 80.0, 80.0),
            face(50.0, 50.0, 80.0, 80.0),
            face(50.0, 50.0, 80.0, 80.0),
        ];
        let mut results = d.detect_faces(&frame(), &dets);
        assert_eq!(results[0].antispoofing, results[1].antispoofing);

        results[0].antispoofing.label = "tampered".into();
        results[0].antispoofing.is_real = false;
        results[0].metadata.insert("note".into(), json!("x"));
        assert_eq!(results[1].antispoofing.label, "Live Face");
        assert!(results[2].antispoofing.is_real);
        assert!(results[1].metadata.is_empty());
        assert!(dets[0].metadata.is_empty());
    }

    #[test]
    fn test_metadata_and_caller_box_passed_through() {
        let mut d = detector(LIVE);
        let mut meta = Map::new();
        meta.insert("name".into(), json!("bob"));
        meta.insert("landmarks".into(), json!([[1, 2]]));
        // 130px on a 480px frame triggers downsampling; the result still
        // reports the caller's box.
        let big = face(100.0, 40.0, 130.0, 130.0).with_metadata(meta.clone());
        let results = d.detect_faces(&frame(), &[big]);
        assert_eq!(results[0].bbox, Some(FaceBox { x: 100.0, y: 40.0, width: 130.0, height: 130.0 }));
        assert_eq!(results[0].antispoofing.status, Status::Real);
        assert_eq!(results[0].metadata, meta);
    }

    #[test]
    fn test_fallback_crop_salvages_small_face() {
        let mut d = detector(LIVE);
        // 28px passes the 24px floor but not the 32px crop minimum.
        let results = d.detect_faces(&frame(), &[face(-10.0, -10.0, 28.0, 28.0)]);
        assert_eq!(results[0].antispoofing.status, Status::Real);
    }

    #[test]
    fn test_fallback_outside_frame_is_processing_failed() {
        let mut d = detector(LIVE);
        let results = d.detect_faces(&frame(), &[face(1000.0, 1000.0, 28.0, 28.0)]);
        assert_eq!(results[0].antispoofing.status, Status::ProcessingFailed);
        assert!(!results[0].antispoofing.is_real);
    }

    #[test]
    fn test_oversized_box_degrades_only_that_face() {
        let mut d = detector(LIVE);
        let dets = vec![face(0.0, 0.0, 1e7, 1e7), face(50.0, 50.0, 80.0, 80.0)];
        let results = d.detect_faces(&frame(), &dets);
        assert_eq!(results.len(), 2);
        // The huge box falls back to the frame-clamped crop.
        assert_eq!(results[0].antispoofing.status, Status::Real);
        assert_eq!(results[1].antispoofing.status, Status::Real);
        assert_eq!(results[1].face_id, 1);
    }

    #[test]
    fn test_unrepresentable_box_is_processing_failed() {
        let mut d = detector(LIVE);
        let dets = vec![face(1e30, 1e30, 100.0, 100.0), face(50.0, 50.0, 80.0, 80.0)];
        let results = d.detect_faces(&frame(), &dets);
        assert_eq!(results[0].antispoofing.status, Status::ProcessingFailed);
        assert!(!results[0].antispoofing.is_real);
        assert_eq!(results[1].antispoofing.status, Status::Real);
    }

    #[test]
    fn test_colliding_metadata_cannot_flip_verdict() {
        let mut d = detector(SPOOF);
        let mut meta = Map::new();
        meta.insert("antispoofing".into(), json!({"is_real": true, "status": "real"}));
        meta.insert("bbox".into(), json!([0, 0, 1, 1]));
        meta.insert("name".into(), json!("carol"));
        let dets = vec![face(50.0, 50.0, 80.0, 80.0).with_metadata(meta)];
        let results = d.detect_faces(&frame(), &dets);

        assert_eq!(results[0].antispoofing.status, Status::Fake);
        assert_eq!(results[0].metadata.len(), 1);
        assert_eq!(results[0].metadata["name"], json!("carol"));

        let parsed: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&results[0]).unwrap()).unwrap();
        assert_eq!(parsed["antispoofing"]["is_real"], json!(false));
        assert_eq!(parsed["bbox"]["width"], json!(80.0));
    }

    #[test]
    fn test_cache_hit_skips_inference() {
        let texture = FixedModel::new(SPOOF);
        let calls = texture.calls.clone();
        let config = DetectorConfig {
            cache_duration_secs: 60.0,
            ..DetectorConfig::default()
        };
        let mut d = LivenessDetector::new(config, Box::new(texture), Box::new(FixedModel::new(SPOOF))).unwrap();
        let img = frame();
        let dets = vec![face(50.0, 50.0, 80.0, 80.0)];

        let first = d.detect_faces(&img, &dets);
        assert!(!first[0].antispoofing.cached);
        // Keys include a one-second bucket; two of three back-to-back calls share one.
        let second = d.detect_faces(&img, &dets);
        let third = d.detect_faces(&img, &dets);
        assert!(second[0].antispoofing.cached || third[0].antispoofing.cached);
        assert!(calls.load(Ordering::SeqCst) <= 2);
        assert_eq!(third[0].antispoofing.status, Status::Fake);
    }

    #[test]
    fn test_cache_disabled_by_default() {
        let texture = FixedModel::new(SPOOF);
        let calls = texture.calls.clone();
        let mut d = LivenessDetector::new(DetectorConfig::default(), Box::new(texture), Box::new(FixedModel::new(SPOOF))).unwrap();
        let dets = vec![face(50.0, 50.0, 80.0, 80.0)];
        d.detect_faces(&frame(), &dets);
        let again = d.detect_faces(&frame(), &dets);
        assert!(!again[0].antispoofing.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    struct PoorQuality;

    impl QualityGate for PoorQuality {
        fn assess(&self, _crop: &RgbImage) -> QualityAssessment {
            QualityAssessment {
                passed: false,
                score: 0.1,
                blur_variance: 0.0,
                brightness: 128.0,
                issues: Vec::new(),
            }
        }
    }

    #[test]
    fn test_quality_score_tightens_threshold() {
        // softmax live ≈ 0.68
        let borderline = [0.0, 1.4469, 0.0];
        let config = DetectorConfig {
            enable_quality_gate: false,
            ..DetectorConfig::default()
        };
        let dets = vec![face(50.0, 50.0, 80.0, 80.0)];

        let mut plain = detector_with(config.clone(), borderline, borderline);
        let r = plain.detect_faces(&frame(), &dets);
        assert!(r[0].antispoofing.is_real);
        assert!(r[0].antispoofing.quality_score.is_none());

        let mut gated = detector_with(config, borderline, borderline).with_quality_gate(Box::new(PoorQuality));
        let r = gated.detect_faces(&frame(), &dets);
        assert!(!r[0].antispoofing.is_real);
        assert_eq!(r[0].antispoofing.quality_score, Some(0.1));
        assert!((r[0].antispoofing.adjusted_threshold - 0.70).abs() < 1e-5);
    }

    #[test]
    fn test_set_threshold_validates_and_applies() {
        let mut d = detector(LIVE);
        assert!(d.set_threshold(1.5).is_err());
        d.set_threshold(0.8).unwrap();
        assert_eq!(d.model_info().threshold, 0.8);
        let r = d.detect_faces(&frame(), &[face(50.0, 50.0, 80.0, 80.0)]);
        assert_eq!(r[0].antispoofing.threshold, 0.8);
    }

    #[test]
    fn test_set_cache_duration() {
        let mut d = detector(LIVE);
        assert!(!d.model_info().cache_enabled);
        d.set_cache_duration(5.0).unwrap();
        assert!(d.model_info().cache_enabled);
        assert!(d.set_cache_duration(-1.0).is_err());
        d.clear_cache();
        assert_eq!(d.model_info().cache_entries, 0);
    }

    #[test]
    fn test_model_info_reflects_config() {
        let config = DetectorConfig {
            v2_weight: 3.0,
            v1se_weight: 1.0,
            enable_temporal_analysis: false,
            ..DetectorConfig::default()
        };
        let info = detector_with(config, LIVE, LIVE).model_info();
        assert_eq!(info.model_type, "dual_minifasnet");
        assert!((info.v2_weight - 0.75).abs() < 1e-6);
        assert!(!info.temporal_analysis);
        assert!(info.adaptive_threshold);
        assert!(info.quality_gate);
        assert_eq!(info.input_size, 80);
        assert_eq!(info.max_batch_size, 8);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = DetectorConfig {
            max_batch_size: 0,
            ..DetectorConfig::default()
        };
        let result = LivenessDetector::new(config, Box::new(FailingModel), Box::new(FailingModel));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_missing_model_fails_fast() {
        let config = DetectorConfig {
            model_v2_path: "/nonexistent/v2.onnx".into(),
            ..DetectorConfig::default()
        };
        let err = LivenessDetector::load(config).err().unwrap();
        assert!(matches!(err, DetectorError::Model(ModelError::ModelNotFound(_))));
    }
}
