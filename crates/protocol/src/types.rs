use crate::classes::{ClassColorTable, UnknownClass};
use serde::{Deserialize, Serialize};

/// One defect instance in source-image pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// `[x1, y1, x2, y2]`
    #[serde(rename = "box")]
    pub bbox: [f64; 4],
    pub confidence: f64,
    pub class_id: i32,
}

impl Detection {
    /// Build a detection, normalising corner order so that x1 <= x2 and y1 <= y2.
    pub fn new(bbox: [f64; 4], confidence: f64, class_id: i32) -> Self {
        let [x1, y1, x2, y2] = bbox;
        Self {
            bbox: [x1.min(x2), y1.min(y2), x1.max(x2), y1.max(y2)],
            confidence: confidence.clamp(0.0, 1.0),
            class_id,
        }
    }

    pub fn width(&self) -> f64 {
        self.bbox[2] - self.bbox[0]
    }

    pub fn height(&self) -> f64 {
        self.bbox[3] - self.bbox[1]
    }

    pub fn label(&self, table: &ClassColorTable) -> Result<&'static str, UnknownClass> {
        table.label(self.class_id)
    }

    /// `"x1,y1,x2,y2"`, the form the defect store records.
    pub fn bbox_string(&self) -> String {
        let [x1, y1, x2, y2] = self.bbox;
        format!("{x1},{y1},{x2},{y2}")
    }
}

/// Detections in model emission order plus the rendered overlay image.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DetectionResponse {
    pub detections: Vec<Detection>,
    /// Encoded overlay, same dimensions and encoding family as the request image
    pub processed_image: Vec<u8>,
}

impl DetectionResponse {
    pub fn has_defect(&self) -> bool {
        !self.detections.is_empty()
    }
}
