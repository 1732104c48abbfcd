use super::InferenceBackend;
use crate::config::ModelConfig;
use image::RgbImage;
use overlay::Segment;

/// Loads nothing and finds nothing. Every image comes back unchanged with an
/// empty detection list, which is enough to exercise the full pipeline.
pub struct StubBackend {
    model_path: String,
}

impl InferenceBackend for StubBackend {
    fn load_model(config: &ModelConfig) -> anyhow::Result<Self> {
        tracing::warn!(
            model_path = %config.model_path,
            "Using stub backend - no actual detection performed"
        );
        Ok(Self {
            model_path: config.model_path.clone(),
        })
    }

    fn predict(&mut self, image: &RgbImage) -> anyhow::Result<Vec<Segment>> {
        tracing::trace!(
            model_path = %self.model_path,
            width = image.width(),
            height = image.height(),
            "Stub prediction"
        );
        Ok(Vec::new())
    }
}
