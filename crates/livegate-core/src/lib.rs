//! livegate-core: dual-model face anti-spoofing ensemble.
//!
//! Two MiniFASNet classifiers score every face through ONNX Runtime: V2 on
//! a 2.7× context crop (texture) and V1SE on a 4.0× crop (shape). Their
//! weighted scores, per-track temporal consistency and a context-adjusted
//! threshold produce one fail-closed verdict per face.

pub mod cache;
pub mod config;
pub mod crop;
pub mod detector;
pub mod ensemble;
pub mod predictor;
pub mod quality;
pub mod scale;
pub mod temporal;
pub mod threshold;
pub mod types;

pub use config::{ConfigError, DetectorConfig};
pub use detector::{DetectorError, LivenessDetector, ModelInfo};
pub use predictor::{LivenessModel, ModelError, OnnxLivenessModel};
pub use quality::{CropQualityGate, QualityGate};
pub use types::{FaceBox, FaceDetection, FaceResult, ModelScore, Status, Verdict};
