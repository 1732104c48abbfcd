//! gRPC realization of the `Detect` call.
//!
//! Both peers must raise tonic's default 4 MiB message ceiling to at least
//! [`DEFAULT_MAX_MESSAGE_BYTES`]; tonic then rejects oversize messages with a
//! status instead of truncating them.

use crate::error::DetectError;
use crate::types::{Detection, DetectionResponse};

pub mod pb {
    tonic::include_proto!("detection");
}

/// 100 MiB: raw image plus overlay for large industrial captures.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 100 * 1024 * 1024;

impl From<&Detection> for pb::DetectionResult {
    fn from(detection: &Detection) -> Self {
        Self {
            bbox: detection.bbox.to_vec(),
            confidence: detection.confidence,
            class_id: detection.class_id,
        }
    }
}

impl TryFrom<pb::DetectionResult> for Detection {
    type Error = DetectError;

    fn try_from(result: pb::DetectionResult) -> Result<Self, Self::Error> {
        let bbox: [f64; 4] = result.bbox.as_slice().try_into().map_err(|_| {
            DetectError::Backend(format!(
                "malformed detection box: expected 4 coordinates, got {}",
                result.bbox.len()
            ))
        })?;
        Ok(Detection {
            bbox,
            confidence: result.confidence,
            class_id: result.class_id,
        })
    }
}

impl From<DetectionResponse> for pb::DetectResponse {
    fn from(response: DetectionResponse) -> Self {
        Self {
            results: response.detections.iter().map(pb::DetectionResult::from).collect(),
            processed_image: response.processed_image,
        }
    }
}

impl TryFrom<pb::DetectResponse> for DetectionResponse {
    type Error = DetectError;

    fn try_from(response: pb::DetectResponse) -> Result<Self, Self::Error> {
        let detections = response
            .results
            .into_iter()
            .map(Detection::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DetectionResponse {
            detections,
            processed_image: response.processed_image,
        })
    }
}
