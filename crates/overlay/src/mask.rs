use crate::error::OverlayError;
use fast_image_resize::{
    PixelType, ResizeAlg, ResizeOptions, Resizer,
    images::{Image, ImageRef},
};

/// Per-instance segmentation mask, one byte per pixel (0 = background).
///
/// Masks come from the model at its own resolution and are resampled to the
/// source image only when composited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceMask {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl InstanceMask {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, OverlayError> {
        if data.len() != (width as usize) * (height as usize) {
            return Err(OverlayError::MaskSize {
                width,
                height,
                len: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> bool) -> Self {
        let mut data = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(if f(x, y) { 255 } else { 0 });
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Nearest-neighbour resample to `width` x `height`.
    ///
    /// Nearest keeps every output value one of the input values, so a binary
    /// mask stays binary and thresholding afterwards cannot flip foreground
    /// and background.
    pub fn resize_nearest(&self, width: u32, height: u32) -> Result<Vec<u8>, OverlayError> {
        let len = (width as usize) * (height as usize);
        if (self.width, self.height) == (width, height) {
            return Ok(self.data.clone());
        }
        if self.width == 0 || self.height == 0 || len == 0 {
            return Ok(vec![0; len]);
        }

        let src = ImageRef::new(self.width, self.height, &self.data, PixelType::U8)
            .map_err(|e| OverlayError::Resize(e.to_string()))?;
        let mut dst = Image::new(width, height, PixelType::U8);

        Resizer::new()
            .resize(
                &src,
                &mut dst,
                &ResizeOptions::new().resize_alg(ResizeAlg::Nearest),
            )
            .map_err(|e| OverlayError::Resize(e.to_string()))?;

        Ok(dst.buffer().to_vec())
    }
}
