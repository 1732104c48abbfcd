use crate::processing::pre::TransformParams;
use ndarray::ArrayViewD;
use overlay::{InstanceMask, Segment};
use protocol::Detection;

/// One box that survived the confidence filter, still in model-input pixels.
#[derive(Debug, Clone)]
struct Candidate {
    bbox: [f32; 4],
    confidence: f32,
    class_id: usize,
    coefficients: Vec<f32>,
}

pub struct PostProcessor {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

impl PostProcessor {
    pub fn new(confidence_threshold: f32, iou_threshold: f32) -> Self {
        Self {
            confidence_threshold,
            iou_threshold,
        }
    }

    /// Turn YOLO segmentation heads into segments in source coordinates.
    ///
    /// `preds` is `[1, 4 + classes + coefficients, anchors]` with boxes in
    /// cxcywh input pixels; `protos` is `[1, coefficients, mask_h, mask_w]`.
    /// Segments come out in descending confidence order.
    #[tracing::instrument(skip_all)]
    pub fn parse_segments(
        &self,
        preds: &ArrayViewD<f32>,
        protos: &ArrayViewD<f32>,
        transform: &TransformParams,
    ) -> anyhow::Result<Vec<Segment>> {
        let pred_shape = preds.shape();
        let proto_shape = protos.shape();
        if pred_shape.len() != 3 || proto_shape.len() != 4 {
            anyhow::bail!(
                "Unexpected output shapes: preds {:?}, protos {:?}",
                pred_shape,
                proto_shape
            );
        }

        let num_channels = pred_shape[1];
        let num_anchors = pred_shape[2];
        let num_coefficients = proto_shape[1];
        if num_channels <= 4 + num_coefficients {
            anyhow::bail!(
                "Prediction head has {} channels, too few for {} mask coefficients",
                num_channels,
                num_coefficients
            );
        }
        let num_classes = num_channels - 4 - num_coefficients;

        let mut candidates = Vec::new();
        for i in 0..num_anchors {
            let mut confidence = f32::NEG_INFINITY;
            let mut class_id = 0usize;
            for c in 0..num_classes {
                let score = preds[[0, 4 + c, i]];
                if score > confidence {
                    confidence = score;
                    class_id = c;
                }
            }

            if confidence < self.confidence_threshold {
                continue;
            }

            let cx = preds[[0, 0, i]];
            let cy = preds[[0, 1, i]];
            let w = preds[[0, 2, i]];
            let h = preds[[0, 3, i]];

            let coefficients = (0..num_coefficients)
                .map(|k| preds[[0, 4 + num_classes + k, i]])
                .collect();

            candidates.push(Candidate {
                bbox: cxcywh_to_xyxy(cx, cy, w, h),
                confidence,
                class_id,
                coefficients,
            });
        }

        let kept = non_max_suppression(candidates, self.iou_threshold);
        tracing::debug!(detections = kept.len(), "Segments decoded");

        Ok(kept
            .iter()
            .map(|candidate| {
                let (x1, y1) = transform.to_source(candidate.bbox[0], candidate.bbox[1]);
                let (x2, y2) = transform.to_source(candidate.bbox[2], candidate.bbox[3]);
                let detection = Detection::new(
                    [x1 as f64, y1 as f64, x2 as f64, y2 as f64],
                    candidate.confidence as f64,
                    candidate.class_id as i32,
                );
                let mask = decode_mask(candidate, protos, transform);
                Segment::new(detection, mask)
            })
            .collect())
    }
}

/// Combine the prototypes with the instance coefficients, keep what lies inside
/// the box, and cut the letterbox padding away.
///
/// The result covers exactly the resized source region, so stretching it onto
/// the source image lines it up with the original pixels.
fn decode_mask(
    candidate: &Candidate,
    protos: &ArrayViewD<f32>,
    transform: &TransformParams,
) -> Option<InstanceMask> {
    let mask_h = protos.shape()[2];
    let mask_w = protos.shape()[3];
    let sx = mask_w as f32 / transform.input_width as f32;
    let sy = mask_h as f32 / transform.input_height as f32;

    let content_x0 = (transform.offset_x * sx).floor() as usize;
    let content_y0 = (transform.offset_y * sy).floor() as usize;
    let content_x1 = (((transform.offset_x + transform.resized_width as f32) * sx).ceil() as usize)
        .min(mask_w);
    let content_y1 = (((transform.offset_y + transform.resized_height as f32) * sy).ceil() as usize)
        .min(mask_h);
    if content_x1 <= content_x0 || content_y1 <= content_y0 {
        return None;
    }

    let [bx1, by1, bx2, by2] = candidate.bbox;
    let (bx1, bx2) = (bx1 * sx, bx2 * sx);
    let (by1, by2) = (by1 * sy, by2 * sy);

    let width = content_x1 - content_x0;
    let height = content_y1 - content_y0;
    let mut data = vec![0u8; width * height];

    for y in content_y0..content_y1 {
        let cy = y as f32 + 0.5;
        if cy < by1 || cy > by2 {
            continue;
        }
        for x in content_x0..content_x1 {
            let cx = x as f32 + 0.5;
            if cx < bx1 || cx > bx2 {
                continue;
            }
            let logit: f32 = candidate
                .coefficients
                .iter()
                .enumerate()
                .map(|(k, c)| c * protos[[0, k, y, x]])
                .sum();
            // sigmoid(logit) > 0.5
            if logit > 0.0 {
                data[(y - content_y0) * width + (x - content_x0)] = 255;
            }
        }
    }

    InstanceMask::new(width as u32, height as u32, data).ok()
}

/// Class-wise NMS, highest confidence first.
fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        let suppressed = keep.iter().any(|kept| {
            kept.class_id == candidate.class_id && iou(&kept.bbox, &candidate.bbox) > iou_threshold
        });
        if !suppressed {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let intersection = ix * iy;
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - intersection;
    if union <= 0.0 { 0.0 } else { intersection / union }
}

/// Convert bounding box from center-width-height format to corner format
#[inline]
fn cxcywh_to_xyxy(cx: f32, cy: f32, w: f32, h: f32) -> [f32; 4] {
    [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
}
