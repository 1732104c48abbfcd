use crate::backend::InferenceBackend;
use crate::config::ModelConfig;
use crate::worker::ModelWorker;
use dispatcher::Detector;
use overlay::{Compositor, DecodedImage, decode_image, encode_image};
use protocol::{DetectError, DetectionResponse};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinError;

/// Where a request is in the pipeline. Nothing carries over between requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Decoding,
    Inferring,
    Compositing,
    Responding,
}

impl fmt::Display for RequestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestStage::Decoding => "decoding",
            RequestStage::Inferring => "inferring",
            RequestStage::Compositing => "compositing",
            RequestStage::Responding => "responding",
        };
        f.write_str(name)
    }
}

/// Decode, infer, composite, encode.
///
/// Cheap to clone; all clones share one model worker. Decoding and
/// compositing run on the blocking pool so they overlap across requests,
/// while model calls queue up on the worker thread.
#[derive(Clone)]
pub struct DetectionEngine {
    worker: ModelWorker,
    compositor: Compositor,
}

impl DetectionEngine {
    /// Load the model (fatal on failure) and build the engine around it.
    pub fn load<B: InferenceBackend + 'static>(
        config: &ModelConfig,
        compositor: Compositor,
    ) -> anyhow::Result<Self> {
        tracing::info!(model_path = %config.model_path, "Loading inference model");
        let worker = ModelWorker::spawn::<B>(config.clone())?;
        tracing::info!("Model loaded successfully");
        Ok(Self { worker, compositor })
    }

    pub fn compositor(&self) -> &Compositor {
        &self.compositor
    }

    pub async fn run(&self, image: Vec<u8>) -> Result<DetectionResponse, DetectError> {
        let mut stage = RequestStage::Decoding;
        let result = self.run_stages(image, &mut stage).await;
        if let Err(e) = &result {
            tracing::warn!(stage = %stage, error = %e, "Request failed");
        }
        result
    }

    async fn run_stages(
        &self,
        image: Vec<u8>,
        stage: &mut RequestStage,
    ) -> Result<DetectionResponse, DetectError> {
        *stage = RequestStage::Decoding;
        let DecodedImage { image, format } =
            tokio::task::spawn_blocking(move || decode_image(&image))
                .await
                .map_err(|e| stage_failed(RequestStage::Decoding, e))??;
        tracing::trace!(
            width = image.width(),
            height = image.height(),
            format = ?format,
            "Image decoded"
        );

        *stage = RequestStage::Inferring;
        let image = Arc::new(image);
        let segments = self.worker.predict(Arc::clone(&image)).await?;

        *stage = RequestStage::Compositing;
        let compositor = self.compositor.clone();
        let (segments, processed_image) = tokio::task::spawn_blocking(move || {
            let canvas = compositor.composite(&image, &segments)?;
            encode_image(&canvas, format).map(|overlay| (segments, overlay))
        })
        .await
        .map_err(|e| stage_failed(RequestStage::Compositing, e))??;

        *stage = RequestStage::Responding;
        let detections = segments.into_iter().map(|s| s.detection).collect();
        Ok(DetectionResponse {
            detections,
            processed_image,
        })
    }
}

impl Detector for DetectionEngine {
    async fn detect(&self, image: Vec<u8>) -> Result<DetectionResponse, DetectError> {
        self.run(image).await
    }
}

fn stage_failed(stage: RequestStage, err: JoinError) -> DetectError {
    DetectError::Backend(format!("{} step did not complete: {}", stage, err))
}
