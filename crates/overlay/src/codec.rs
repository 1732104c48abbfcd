use crate::error::OverlayError;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};
use std::io::Cursor;

const JPEG_QUALITY: u8 = 90;

/// A request image decoded to RGB, remembering its container format so the
/// overlay can be returned in the same encoding family.
pub struct DecodedImage {
    pub image: RgbImage,
    pub format: ImageFormat,
}

pub fn decode_image(bytes: &[u8]) -> Result<DecodedImage, OverlayError> {
    let format = image::guess_format(bytes).map_err(OverlayError::Decode)?;
    let image = image::load_from_memory_with_format(bytes, format)
        .map_err(OverlayError::Decode)?
        .to_rgb8();

    tracing::trace!(
        width = image.width(),
        height = image.height(),
        format = ?format,
        "Decoded request image"
    );

    Ok(DecodedImage { image, format })
}

/// Encode in `format` when we can write it, PNG otherwise.
pub fn encode_image(image: &RgbImage, format: ImageFormat) -> Result<Vec<u8>, OverlayError> {
    let mut out = Cursor::new(Vec::new());
    match format {
        ImageFormat::Jpeg => {
            JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
                .encode_image(image)
                .map_err(OverlayError::Encode)?;
        }
        ImageFormat::Png | ImageFormat::Bmp => {
            image.write_to(&mut out, format).map_err(OverlayError::Encode)?;
        }
        other => {
            tracing::debug!(format = ?other, "No encoder for source format, using PNG");
            image
                .write_to(&mut out, ImageFormat::Png)
                .map_err(OverlayError::Encode)?;
        }
    }
    Ok(out.into_inner())
}
