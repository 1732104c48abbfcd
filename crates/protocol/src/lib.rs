pub mod classes;
pub mod error;
pub mod rpc;
pub mod types;

pub use classes::{ClassColorTable, DEFECT_CLASSES, DefectClass, UnknownClass};
pub use error::{DetectError, ErrorKind};
pub use rpc::{DEFAULT_MAX_MESSAGE_BYTES, pb};
pub use types::{Detection, DetectionResponse};
