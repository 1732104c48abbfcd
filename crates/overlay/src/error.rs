use protocol::{DetectError, UnknownClass};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("failed to encode overlay: {0}")]
    Encode(#[source] image::ImageError),

    #[error(transparent)]
    UnknownClass(#[from] UnknownClass),

    #[error("mask of {width}x{height} does not match its buffer of {len} bytes")]
    MaskSize { width: u32, height: u32, len: usize },

    #[error("mask resize failed: {0}")]
    Resize(String),
}

impl From<OverlayError> for DetectError {
    fn from(err: OverlayError) -> Self {
        match err {
            OverlayError::Decode(_) => DetectError::InvalidImage(err.to_string()),
            _ => DetectError::Backend(err.to_string()),
        }
    }
}
