use crate::codec::{DecodedImage, encode_image};
use crate::error::OverlayError;
use crate::mask::InstanceMask;
use common::span;
use image::{Rgb, RgbImage};
use protocol::{ClassColorTable, DEFECT_CLASSES, Detection};

pub const DEFAULT_ALPHA: f32 = 0.35;
/// Mask bytes strictly above this count as foreground.
pub const DEFAULT_MASK_THRESHOLD: u8 = 127;

/// Raw model output for one instance: the structured detection plus its mask, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub detection: Detection,
    pub mask: Option<InstanceMask>,
}

impl Segment {
    pub fn new(detection: Detection, mask: Option<InstanceMask>) -> Self {
        Self { detection, mask }
    }
}

/// Paints instance masks onto the source image.
///
/// Each mask becomes a full-size layer holding the class color inside the mask
/// and zero elsewhere, added with weight `alpha` on top of everything painted
/// before it. Overlaps therefore accumulate in emission order. Boxes are not
/// drawn, and instances without a mask leave the pixels alone.
#[derive(Debug, Clone)]
pub struct Compositor {
    table: ClassColorTable,
    alpha: f32,
    mask_threshold: u8,
}

impl Default for Compositor {
    fn default() -> Self {
        Self::new(DEFECT_CLASSES)
    }
}

impl Compositor {
    pub fn new(table: ClassColorTable) -> Self {
        Self {
            table,
            alpha: DEFAULT_ALPHA,
            mask_threshold: DEFAULT_MASK_THRESHOLD,
        }
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha.clamp(0.0, 1.0);
        self
    }

    pub fn with_mask_threshold(mut self, threshold: u8) -> Self {
        self.mask_threshold = threshold;
        self
    }

    pub fn table(&self) -> &ClassColorTable {
        &self.table
    }

    pub fn composite(&self, source: &RgbImage, segments: &[Segment]) -> Result<RgbImage, OverlayError> {
        let _s = span!("composite_overlay");

        // Every class id is checked up front, masked or not.
        let colors = segments
            .iter()
            .map(|s| self.table.color(s.detection.class_id))
            .collect::<Result<Vec<_>, _>>()?;

        let mut canvas = source.clone();
        if segments.iter().all(|s| s.mask.is_none()) {
            return Ok(canvas);
        }

        let (width, height) = source.dimensions();
        let mut layer = RgbImage::new(width, height);

        for (segment, color) in segments.iter().zip(colors) {
            let Some(mask) = &segment.mask else {
                continue;
            };
            let resized = mask.resize_nearest(width, height)?;
            if !fill_layer(&mut layer, &resized, self.mask_threshold, color) {
                tracing::trace!(class_id = segment.detection.class_id, "Empty mask after threshold");
                continue;
            }
            blend_layer(&mut canvas, &layer, self.alpha);
        }

        Ok(canvas)
    }

    /// Composite and re-encode in the source image's format.
    pub fn render(&self, source: &DecodedImage, segments: &[Segment]) -> Result<Vec<u8>, OverlayError> {
        let canvas = self.composite(&source.image, segments)?;
        encode_image(&canvas, source.format)
    }
}

/// Paint `color` where the mask is foreground and clear everything else.
/// Returns whether any pixel was painted.
fn fill_layer(layer: &mut RgbImage, mask: &[u8], threshold: u8, color: [u8; 3]) -> bool {
    let mut painted = false;
    for (pixel, &m) in layer.pixels_mut().zip(mask) {
        if m > threshold {
            *pixel = Rgb(color);
            painted = true;
        } else {
            *pixel = Rgb([0, 0, 0]);
        }
    }
    painted
}

/// `canvas = saturate(round(canvas + alpha * layer))`
fn blend_layer(canvas: &mut RgbImage, layer: &RgbImage, alpha: f32) {
    for (dst, &src) in canvas.iter_mut().zip(layer.iter()) {
        if src != 0 {
            *dst = (*dst as f32 + alpha * src as f32).round().min(255.0) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::DefectClass;

    static RED_ONLY: ClassColorTable = ClassColorTable::new(&[DefectClass {
        label: "red",
        color: [255, 0, 0],
    }]);

    fn det(class_id: i32) -> Detection {
        Detection::new([0.0, 0.0, 4.0, 4.0], 0.9, class_id)
    }

    fn noise(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 31 % 256) as u8, (y * 17 % 256) as u8, ((x ^ y) % 256) as u8])
        })
    }

    #[test]
    fn no_detections_is_identity() {
        let source = noise(23, 11);
        let out = Compositor::default().composite(&source, &[]).unwrap();
        assert_eq!(out, source);
    }

    #[test]
    fn maskless_detections_leave_pixels_untouched() {
        let source = noise(8, 8);
        let segments = [Segment::new(det(0), None), Segment::new(det(3), None)];
        let out = Compositor::default().composite(&source, &segments).unwrap();
        assert_eq!(out, source);
    }

    #[test]
    fn full_red_mask_over_black() {
        let source = RgbImage::new(10, 6);
        let mask = InstanceMask::from_fn(160, 160, |_, _| true);
        let out = Compositor::new(RED_ONLY)
            .composite(&source, &[Segment::new(det(0), Some(mask))])
            .unwrap();

        // 0 * 1 + 255 * 0.35 = 89.25
        for pixel in out.pixels() {
            assert_eq!(*pixel, Rgb([89, 0, 0]));
        }
    }

    #[test]
    fn zero_area_mask_is_noop() {
        let source = noise(12, 12);
        let mask = InstanceMask::from_fn(12, 12, |_, _| false);
        let out = Compositor::default()
            .composite(&source, &[Segment::new(det(1), Some(mask))])
            .unwrap();
        assert_eq!(out, source);
    }

    #[test]
    fn below_threshold_values_are_background() {
        let source = RgbImage::new(2, 1);
        let mask = InstanceMask::new(2, 1, vec![127, 128]).unwrap();
        let out = Compositor::new(RED_ONLY)
            .composite(&source, &[Segment::new(det(0), Some(mask))])
            .unwrap();
        assert_eq!(*out.get_pixel(0, 0), Rgb([0, 0, 0]));
        assert_eq!(*out.get_pixel(1, 0), Rgb([89, 0, 0]));
    }

    #[test]
    fn overlapping_masks_accumulate_in_order() {
        let source = RgbImage::new(4, 1);
        let left = InstanceMask::from_fn(4, 1, |x, _| x < 3);
        let right = InstanceMask::from_fn(4, 1, |x, _| x > 0);
        let out = Compositor::new(RED_ONLY)
            .composite(
                &source,
                &[
                    Segment::new(det(0), Some(left)),
                    Segment::new(det(0), Some(right)),
                ],
            )
            .unwrap();

        assert_eq!(out.get_pixel(0, 0)[0], 89);
        // 89 + 89.25 rounds to 178
        assert_eq!(out.get_pixel(1, 0)[0], 178);
        assert_eq!(out.get_pixel(2, 0)[0], 178);
        assert_eq!(out.get_pixel(3, 0)[0], 89);
    }

    #[test]
    fn blending_saturates() {
        let source = RgbImage::from_pixel(1, 1, Rgb([250, 0, 0]));
        let mask = InstanceMask::from_fn(1, 1, |_, _| true);
        let out = Compositor::new(RED_ONLY)
            .composite(&source, &[Segment::new(det(0), Some(mask))])
            .unwrap();
        assert_eq!(*out.get_pixel(0, 0), Rgb([255, 0, 0]));
    }

    #[test]
    fn unknown_class_fails_fast_even_without_mask() {
        let source = noise(4, 4);
        let err = Compositor::default()
            .composite(&source, &[Segment::new(det(4), None)])
            .unwrap_err();
        assert!(matches!(err, OverlayError::UnknownClass(_)));

        let err = Compositor::default()
            .composite(&source, &[Segment::new(det(-1), None)])
            .unwrap_err();
        assert!(matches!(err, OverlayError::UnknownClass(_)));
    }

    #[test]
    fn class_colors_follow_table() {
        let source = RgbImage::new(1, 1);
        let mask = InstanceMask::from_fn(1, 1, |_, _| true);
        // transverse crack is green
        let out = Compositor::default()
            .composite(&source, &[Segment::new(det(1), Some(mask))])
            .unwrap();
        assert_eq!(*out.get_pixel(0, 0), Rgb([0, 89, 0]));
    }

    #[test]
    fn alpha_is_configurable() {
        let source = RgbImage::new(1, 1);
        let mask = InstanceMask::from_fn(1, 1, |_, _| true);
        let out = Compositor::new(RED_ONLY)
            .with_alpha(0.5)
            .composite(&source, &[Segment::new(det(0), Some(mask))])
            .unwrap();
        assert_eq!(*out.get_pixel(0, 0), Rgb([128, 0, 0]));
    }

    #[test]
    fn render_keeps_png_bit_exact_when_empty() {
        let source = noise(9, 9);
        let png = encode_image(&source, image::ImageFormat::Png).unwrap();
        let decoded = crate::codec::decode_image(&png).unwrap();
        let rendered = Compositor::default().render(&decoded, &[]).unwrap();
        let round_trip = crate::codec::decode_image(&rendered).unwrap();
        assert_eq!(round_trip.format, image::ImageFormat::Png);
        assert_eq!(round_trip.image, source);
    }
}
