pub mod codec;
pub mod compositor;
pub mod error;
pub mod mask;

pub use codec::{DecodedImage, decode_image, encode_image};
pub use compositor::{Compositor, DEFAULT_ALPHA, DEFAULT_MASK_THRESHOLD, Segment};
pub use error::OverlayError;
pub use mask::InstanceMask;
