//! MiniFASNet liveness classifiers via ONNX Runtime.
//!
//! Two independently trained models score every face: MiniFASNetV2 on the
//! 2.7× crop (texture cues) and MiniFASNetV1SE on the 4.0× crop (shape
//! cues). Both emit 3-way logits that are softmaxed and collapsed into a
//! binary live/spoof [`ModelScore`].

use crate::types::ModelScore;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{Array2, Array4};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
/// Side length of the square model input.
pub const MINIFASNET_INPUT_SIZE: u32 = 80;
const LIVENESS_CLASSES: usize = 3;
const CLASS_SPOOF_2D: usize = 0;
const CLASS_LIVE: usize = 1;
const CLASS_SPOOF_3D: usize = 2;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("unexpected logits shape {0:?}, expected [N, {LIVENESS_CLASSES}]")]
    OutputShape(Vec<i64>),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
    #[error("tensor shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// A liveness classifier: `[N, 3, H, W]` float batch in, `[N, classes]` logits out.
///
/// Implementations must be stateless between calls apart from whatever the
/// runtime needs internally.
pub trait LivenessModel: Send {
    fn infer(&mut self, batch: &Array4<f32>) -> Result<Array2<f32>, ModelError>;
}

/// MiniFASNet session backed by ONNX Runtime.
pub struct OnnxLivenessModel {
    session: Session,
}

impl OnnxLivenessModel {
    /// Load a MiniFASNet ONNX model from the given path.
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, ModelError> {
        if !Path::new(model_path).exists() {
            return Err(ModelError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded MiniFASNet model"
        );

        Ok(Self { session })
    }
}

impl LivenessModel for OnnxLivenessModel {
    fn infer(&mut self, batch: &Array4<f32>) -> Result<Array2<f32>, ModelError> {
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(batch.view())?])?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("logits: {e}")))?;

        let dims: Vec<i64> = shape.iter().copied().collect();
        let rows = dims.first().copied().unwrap_or(0);
        if rows <= 0 || data.len() % rows as usize != 0 {
            return Err(ModelError::OutputShape(dims));
        }
        let rows = rows as usize;
        let cols = data.len() / rows;

        Ok(Array2::from_shape_vec((rows, cols), data.to_vec())?)
    }
}

/// Numerically stable softmax (the row maximum is subtracted before `exp`).
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Convert one row of model logits into a [`ModelScore`].
///
/// Malformed rows (too few classes, non-finite values) yield an
/// error-tagged neutral score.
pub fn score_from_logits(logits: &[f32]) -> ModelScore {
    if logits.len() < LIVENESS_CLASSES {
        return ModelScore::neutral(format!(
            "expected {LIVENESS_CLASSES} logits, got {}",
            logits.len()
        ));
    }
    if logits.iter().any(|v| !v.is_finite()) {
        return ModelScore::neutral("non-finite logits");
    }

    let probs = softmax(logits);
    ModelScore::from_probabilities(
        probs[CLASS_SPOOF_2D],
        probs[CLASS_LIVE],
        probs[CLASS_SPOOF_3D],
    )
}

/// Build a `[N, 3, size, size]` input batch.
///
/// Crops are bilinearly resized to the model input and kept in the raw
/// `[0, 255]` range: the models were trained without normalisation.
/// Channels are written in RGB order.
pub fn preprocess_batch(crops: &[&RgbImage], input_size: u32) -> Array4<f32> {
    let size = input_size as usize;
    let mut tensor = Array4::<f32>::zeros((crops.len(), 3, size, size));

    for (n, crop) in crops.iter().enumerate() {
        let resized;
        let src: &RgbImage = if crop.dimensions() == (input_size, input_size) {
            crop
        } else {
            resized = imageops::resize(*crop, input_size, input_size, FilterType::Triangle);
            &resized
        };

        for (x, y, pixel) in src.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            tensor[[n, 0, y, x]] = pixel[0] as f32;
            tensor[[n, 1, y, x]] = pixel[1] as f32;
            tensor[[n, 2, y, x]] = pixel[2] as f32;
        }
    }

    tensor
}

/// Score a batch of crops with a single inference call.
///
/// Inference failures produce one independent neutral score per crop. A
/// model that returns a different number of rows than crops is passed
/// through as-is; the caller must check the length.
pub fn predict_batch(
    model: &mut dyn LivenessModel,
    crops: &[&RgbImage],
    input_size: u32,
) -> Vec<ModelScore> {
    if crops.is_empty() {
        return Vec::new();
    }

    let batch = preprocess_batch(crops, input_size);
    match model.infer(&batch) {
        Ok(logits) => {
            if logits.nrows() != crops.len() {
                tracing::error!(
                    requested = crops.len(),
                    returned = logits.nrows(),
                    "liveness model returned unexpected batch size"
                );
            }
            logits
                .rows()
                .into_iter()
                .map(|row| score_from_logits(&row.to_vec()))
                .collect()
        }
        Err(e) => {
            tracing::error!(error = %e, faces = crops.len(), "liveness batch inference failed");
            let message = e.to_string();
            (0..crops.len()).map(|_| ModelScore::neutral(message.clone())).collect()
        }
    }
}

/// Score a single crop. Never fails: errors become a neutral score.
pub fn predict(model: &mut dyn LivenessModel, crop: &RgbImage, input_size: u32) -> ModelScore {
    predict_batch(model, &[crop], input_size)
        .into_iter()
        .next()
        .unwrap_or_else(|| ModelScore::neutral("model returned no output"))
}

/// The texture (2.7×) and shape (4.0×) models, run side by side.
pub struct DualModelPredictor {
    texture: Box<dyn LivenessModel>,
    shape: Box<dyn LivenessModel>,
    input_size: u32,
}

impl DualModelPredictor {
    pub fn new(
        texture: Box<dyn LivenessModel>,
        shape: Box<dyn LivenessModel>,
        input_size: u32,
    ) -> Self {
        Self {
            texture,
            shape,
            input_size,
        }
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    /// Score one face: texture crop through V2, shape crop through V1SE.
    pub fn predict(&mut self, crop_v2: &RgbImage, crop_v1se: &RgbImage) -> (ModelScore, ModelScore) {
        (
            predict(self.texture.as_mut(), crop_v2, self.input_size),
            predict(self.shape.as_mut(), crop_v1se, self.input_size),
        )
    }

    /// Score a chunk of faces with one call per model.
    pub fn predict_batch(
        &mut self,
        crops_v2: &[&RgbImage],
        crops_v1se: &[&RgbImage],
    ) -> (Vec<ModelScore>, Vec<ModelScore>) {
        (
            predict_batch(self.texture.as_mut(), crops_v2, self.input_size),
            predict_batch(self.shape.as_mut(), crops_v1se, self.input_size),
        )
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Fake model that returns the same logits row for every input.
    pub struct FixedModel {
        pub logits: [f32; 3],
        pub calls: Arc<AtomicUsize>,
    }

    impl FixedModel {
        pub fn new(logits: [f32; 3]) -> Self {
            Self {
                logits,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl LivenessModel for FixedModel {
        fn infer(&mut self, batch: &Array4<f32>) -> Result<Array2<f32>, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let n = batch.shape()[0];
            let data: Vec<f32> = (0..n).flat_map(|_| self.logits).collect();
            Ok(Array2::from_shape_vec((n, 3), data)?)
        }
    }

    /// Fake model whose inference always fails.
    pub struct FailingModel;

    impl LivenessModel for FailingModel {
        fn infer(&mut self, _batch: &Array4<f32>) -> Result<Array2<f32>, ModelError> {
            Err(ModelError::InferenceFailed("session poisoned".into()))
        }
    }

    /// Fake model that always drops the last row of the batch.
    pub struct ShortModel;

    impl LivenessModel for ShortModel {
        fn infer(&mut self, batch: &Array4<f32>) -> Result<Array2<f32>, ModelError> {
            let n = batch.shape()[0].saturating_sub(1);
            Ok(Array2::from_shape_vec((n, 3), vec![0.0, 5.0, 0.0].repeat(n))?)
        }
    }

    /// Fake model whose live logit is the mean red value of the input, so
    /// different crops get different scores.
    pub struct RedModel;

    impl LivenessModel for RedModel {
        fn infer(&mut self, batch: &Array4<f32>) -> Result<Array2<f32>, ModelError> {
            let n = batch.shape()[0];
            let mut data = Vec::with_capacity(n * 3);
            for i in 0..n {
                let red = batch.slice(ndarray::s![i, 0, .., ..]);
                let mean = red.sum() / red.len() as f32;
                data.extend([0.0, mean / 25.5, 0.0]);
            }
            Ok(Array2::from_shape_vec((n, 3), data)?)
        }
    }
}
