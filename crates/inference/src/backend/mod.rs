use crate::config::ModelConfig;
use image::RgbImage;
use overlay::Segment;

#[cfg(feature = "ort-backend")]
pub mod ort;

#[cfg(feature = "stub-backend")]
pub mod stub;

/// The model seam. A backend is loaded once and then owned by the model worker
/// thread, which calls `predict` for one image at a time.
pub trait InferenceBackend {
    fn load_model(config: &ModelConfig) -> anyhow::Result<Self>
    where
        Self: Sized;

    /// Detections with their raw instance masks, in model emission order.
    fn predict(&mut self, image: &RgbImage) -> anyhow::Result<Vec<Segment>>;
}
