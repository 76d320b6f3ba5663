use crate::temporal::{TemporalDiagnostics, TemporalVerdict};
use crate::threshold::ThresholdAdjustment;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Tag reported on every verdict so downstream consumers can tell which
/// anti-spoofing backend produced it.
pub const MODEL_TYPE: &str = "dual_minifasnet";

/// Keys a [`FaceResult`] writes itself. Detection metadata under these keys
/// is dropped rather than serialized next to them.
pub const RESERVED_RESULT_KEYS: [&str; 4] = ["face_id", "bbox", "track_id", "antispoofing"];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BoxError {
    #[error("missing bounding box for face detection")]
    Missing,
    #[error("unrecognized bounding box format: {0}")]
    Malformed(String),
    #[error("bounding box field `{0}` is not a finite number")]
    NonFinite(&'static str),
}

/// Axis-aligned face bounding box in pixel units (top-left corner + size).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl FaceBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Result<Self, BoxError> {
        for (name, v) in [("x", x), ("y", y), ("width", width), ("height", height)] {
            if !v.is_finite() {
                return Err(BoxError::NonFinite(name));
            }
        }
        Ok(Self { x, y, width, height })
    }

    /// Normalise a caller-supplied box into a [`FaceBox`].
    ///
    /// Accepts either a mapping `{x, y, width, height}` (missing keys read
    /// as 0) or an ordered sequence `[x, y, width, height, ...]`. Empty
    /// mappings and sequences count as missing.
    pub fn parse(value: &Value) -> Result<Self, BoxError> {
        match value {
            Value::Null => Err(BoxError::Missing),
            Value::Object(map) if map.is_empty() => Err(BoxError::Missing),
            Value::Array(items) if items.is_empty() => Err(BoxError::Missing),
            Value::Object(map) => {
                let field = |name: &'static str| -> Result<f32, BoxError> {
                    match map.get(name) {
                        None | Some(Value::Null) => Ok(0.0),
                        Some(v) => number(v).ok_or_else(|| {
                            BoxError::Malformed(format!("field `{name}` is not numeric"))
                        }),
                    }
                };
                Self::new(field("x")?, field("y")?, field("width")?, field("height")?)
            }
            Value::Array(items) if items.len() >= 4 => {
                let mut vals = [0.0f32; 4];
                for (slot, item) in vals.iter_mut().zip(items.iter()) {
                    *slot = number(item).ok_or_else(|| {
                        BoxError::Malformed("sequence element is not numeric".into())
                    })?;
                }
                Self::new(vals[0], vals[1], vals[2], vals[3])
            }
            Value::Array(items) => Err(BoxError::Malformed(format!(
                "sequence has {} elements, expected at least 4",
                items.len()
            ))),
            other => Err(BoxError::Malformed(format!("unsupported value {other}"))),
        }
    }

    /// Larger of width and height.
    pub fn max_side(&self) -> f32 {
        self.width.max(self.height)
    }

    /// Uniformly rescale position and size by `factor`.
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
        }
    }
}

fn number(value: &Value) -> Option<f32> {
    match value {
        Value::Number(n) => n.as_f64().map(|v| v as f32),
        Value::String(s) => s.trim().parse::<f32>().ok(),
        _ => None,
    }
}

/// A face reported by the upstream detector for one frame.
///
/// The bounding box is normalised at ingestion; a box that could not be
/// normalised is kept as its [`BoxError`] so the face still gets a verdict.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawDetection")]
pub struct FaceDetection {
    pub bbox: Result<FaceBox, BoxError>,
    /// Tracker identity; only strictly positive values count as tracked.
    pub track_id: Option<i64>,
    /// Caller metadata, passed through to the result untouched.
    pub metadata: Map<String, Value>,
}

impl FaceDetection {
    pub fn new(bbox: FaceBox) -> Self {
        Self {
            bbox: Ok(bbox),
            track_id: None,
            metadata: Map::new(),
        }
    }

    pub fn with_track_id(mut self, track_id: i64) -> Self {
        self.track_id = Some(track_id);
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Track identifier if this face is tracked (positive id).
    pub fn tracked_id(&self) -> Option<i64> {
        self.track_id.filter(|&id| id > 0)
    }
}

#[derive(Deserialize)]
struct RawDetection {
    #[serde(default, alias = "box")]
    bbox: Option<Value>,
    #[serde(default)]
    track_id: Option<Value>,
    #[serde(flatten)]
    metadata: Map<String, Value>,
}

impl From<RawDetection> for FaceDetection {
    fn from(raw: RawDetection) -> Self {
        let bbox = match raw.bbox {
            Some(v) => FaceBox::parse(&v),
            None => Err(BoxError::Missing),
        };
        let track_id = raw.track_id.as_ref().and_then(parse_track_id);
        Self {
            bbox,
            track_id,
            metadata: raw.metadata,
        }
    }
}

/// Integer ids, integral floats (`7.0`) and numeric strings are accepted.
fn parse_track_id(value: &Value) -> Option<i64> {
    if value.is_null() {
        return None;
    }
    let id = match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    if id.is_none() {
        tracing::warn!(track_id = %value, "ignoring non-integer track id");
    }
    id
}

/// Output of one liveness model for one crop.
///
/// Class layout of the underlying softmax: index 0 = 2D spoof,
/// index 1 = live, index 2 = 3D spoof.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelScore {
    pub real_score: f32,
    /// Combined 2D + 3D spoof probability.
    pub fake_score: f32,
    pub confidence: f32,
    pub spoof_2d_score: f32,
    pub spoof_3d_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModelScore {
    /// Collapse a 3-way probability vector into a binary live/spoof score.
    pub fn from_probabilities(spoof_2d: f32, live: f32, spoof_3d: f32) -> Self {
        let fake = spoof_2d + spoof_3d;
        Self {
            real_score: live,
            fake_score: fake,
            confidence: live.max(fake),
            spoof_2d_score: spoof_2d,
            spoof_3d_score: spoof_3d,
            error: None,
        }
    }

    /// Undecided score returned when a model invocation fails.
    pub fn neutral(error: impl Into<String>) -> Self {
        Self {
            real_score: 0.5,
            fake_score: 0.5,
            confidence: 0.5,
            spoof_2d_score: 0.25,
            spoof_3d_score: 0.25,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn spoof_type(&self) -> SpoofType {
        if self.is_error() {
            SpoofType::Error
        } else if self.spoof_2d_score > self.spoof_3d_score {
            SpoofType::TwoD
        } else if self.spoof_3d_score > 0.0 {
            SpoofType::ThreeD
        } else {
            SpoofType::None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpoofType {
    #[serde(rename = "2D")]
    TwoD,
    #[serde(rename = "3D")]
    ThreeD,
    #[serde(rename = "none")]
    None,
    #[serde(rename = "error")]
    Error,
}

/// Final per-face status. Everything except `Real` means `is_real == false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Real,
    Fake,
    Error,
    InvalidBbox,
    TooSmall,
    ProcessingFailed,
}

impl Status {
    /// Statuses that describe a pipeline failure rather than a decision.
    pub fn is_failure(self) -> bool {
        matches!(self, Status::Error | Status::ProcessingFailed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsembleMethod {
    AdaptiveTemporal,
    TemporalOverride,
    Error,
    Rejected,
}

/// Raw per-model scores that went into an ensemble decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PerModelScores {
    pub v2_real_score: f32,
    pub v2_fake_score: f32,
    pub v1se_real_score: f32,
    pub v1se_fake_score: f32,
}

impl PerModelScores {
    pub fn new(v2: &ModelScore, v1se: &ModelScore) -> Self {
        Self {
            v2_real_score: v2.real_score,
            v2_fake_score: v2.fake_score,
            v1se_real_score: v1se.real_score,
            v1se_fake_score: v1se.fake_score,
        }
    }
}

/// Anti-spoofing decision for one face.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub is_real: bool,
    pub real_score: f32,
    pub fake_score: f32,
    pub confidence: f32,
    /// Configured base threshold.
    pub threshold: f32,
    /// Threshold actually applied after adaptive adjustment.
    pub adjusted_threshold: f32,
    pub status: Status,
    pub label: String,
    pub message: String,
    #[serde(flatten)]
    pub model_scores: Option<PerModelScores>,
    pub ensemble_method: EnsembleMethod,
    /// Set only once a track's history yields REAL or SPOOF.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporal_verdict: Option<TemporalVerdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporal_confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporal_analysis: Option<TemporalDiagnostics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold_info: Option<ThresholdAdjustment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub model_type: String,
    pub cached: bool,
    pub processing_time_ms: f32,
}

impl Verdict {
    /// Fail-closed verdict for a face that never reached a decision.
    pub fn rejected(status: Status, message: impl Into<String>, threshold: f32) -> Self {
        let label = match status {
            Status::TooSmall => "Move Closer",
            Status::Error => "Error",
            _ => "Spoof Suspected",
        };
        Self {
            is_real: false,
            real_score: 0.0,
            fake_score: 1.0,
            confidence: 0.0,
            threshold,
            adjusted_threshold: threshold,
            status,
            label: label.to_string(),
            message: message.into(),
            model_scores: None,
            ensemble_method: if status == Status::Error {
                EnsembleMethod::Error
            } else {
                EnsembleMethod::Rejected
            },
            temporal_verdict: None,
            temporal_confidence: None,
            temporal_analysis: None,
            threshold_info: None,
            quality_score: None,
            error: None,
            model_type: MODEL_TYPE.to_string(),
            cached: false,
            processing_time_ms: 0.0,
        }
    }

    /// Copy of this verdict without per-call fields, as stored in the cache.
    pub fn sanitized(&self) -> Self {
        Self {
            cached: false,
            processing_time_ms: 0.0,
            ..self.clone()
        }
    }
}

/// One annotated face, index-aligned with the input detections.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceResult {
    pub face_id: usize,
    pub bbox: Option<FaceBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<i64>,
    pub antispoofing: Verdict,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl FaceResult {
    /// Build a result, dropping metadata keys that would shadow the
    /// result's own fields.
    pub fn new(
        face_id: usize,
        bbox: Option<FaceBox>,
        track_id: Option<i64>,
        antispoofing: Verdict,
        mut metadata: Map<String, Value>,
    ) -> Self {
        for key in RESERVED_RESULT_KEYS {
            if metadata.remove(key).is_some() {
                tracing::warn!(face_id, key, "dropping detection metadata that collides with result field");
            }
        }
        Self {
            face_id,
            bbox,
            track_id,
            antispoofing,
            metadata,
        }
    }
}
