use image::RgbImage;
use livegate_core::{DetectorConfig, DetectorError, FaceDetection, FaceResult, LivenessDetector, ModelInfo};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from async callers to the engine thread.
enum EngineRequest {
    Check {
        image: RgbImage,
        detections: Vec<FaceDetection>,
        reply: oneshot::Sender<Vec<FaceResult>>,
    },
    Info {
        reply: oneshot::Sender<ModelInfo>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Run the anti-spoofing pipeline on one frame.
    pub async fn check(
        &self,
        image: RgbImage,
        detections: Vec<FaceDetection>,
    ) -> Result<Vec<FaceResult>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Check {
                image,
                detections,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn info(&self) -> Result<ModelInfo, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Info { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Load both models and spawn the engine. Fails fast if either model is
/// missing.
pub fn spawn_engine(config: DetectorConfig) -> Result<EngineHandle, EngineError> {
    let detector = LivenessDetector::load(config)?;
    spawn_with(detector)
}

/// Spawn the engine on a dedicated OS thread that owns `detector`.
///
/// The detector's cache and track history are not safe for concurrent
/// writers, so every request is serialised through this one thread.
pub fn spawn_with(mut detector: LivenessDetector) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("livegate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Check {
                        image,
                        detections,
                        reply,
                    } => {
                        let results = detector.detect_faces(&image, &detections);
                        let _ = reply.send(results);
                    }
                    EngineRequest::Info { reply } => {
                        let _ = reply.send(detector.model_info());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use livegate_core::{FaceBox, LivenessModel, ModelError, Status};
    use ndarray::{Array2, Array4};

    struct AlwaysLive;

    impl LivenessModel for AlwaysLive {
        fn infer(&mut self, batch: &Array4<f32>) -> Result<Array2<f32>, ModelError> {
            let n = batch.shape()[0];
            Ok(Array2::from_shape_vec((n, 3), [0.0, 8.0, 0.0].repeat(n))?)
        }
    }

    fn handle() -> EngineHandle {
        let detector =
            LivenessDetector::new(DetectorConfig::default(), Box::new(AlwaysLive), Box::new(AlwaysLive)).unwrap();
        spawn_with(detector).unwrap()
    }

    #[tokio::test]
    async fn test_check_round_trip_through_engine() {
        let handle = handle();
        let image = RgbImage::from_fn(320, 240, |x, y| image::Rgb([(x % 251) as u8, (y % 241) as u8, 90]));
        let detections = vec![
            FaceDetection::new(FaceBox::new(120.0, 80.0, 40.0, 40.0).unwrap()),
            FaceDetection::new(FaceBox::new(10.0, 10.0, 12.0, 12.0).unwrap()),
        ];
        let results = handle.check(image, detections).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].antispoofing.status, Status::Real);
        assert_eq!(results[1].antispoofing.status, Status::TooSmall);
    }

    #[tokio::test]
    async fn test_cloned_handles_share_engine() {
        let handle = handle();
        let other = handle.clone();
        let info = other.info().await.unwrap();
        assert_eq!(info.model_type, "dual_minifasnet");
        assert!(handle.info().await.is_ok());
    }
}
