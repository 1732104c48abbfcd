use protocol::{DetectError, DetectionResponse};
use std::future::Future;
use std::sync::Arc;

/// Something that turns one encoded image into detections plus an overlay.
///
/// The dispatcher calls this from a single worker, one task at a time, so
/// implementations never see concurrent calls from the same dispatcher.
pub trait Detector: Send + Sync + 'static {
    fn detect(
        &self,
        image: Vec<u8>,
    ) -> impl Future<Output = Result<DetectionResponse, DetectError>> + Send;
}

impl<D: Detector> Detector for Arc<D> {
    fn detect(
        &self,
        image: Vec<u8>,
    ) -> impl Future<Output = Result<DetectionResponse, DetectError>> + Send {
        (**self).detect(image)
    }
}
