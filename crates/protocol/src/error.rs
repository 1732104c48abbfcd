use serde::{Deserialize, Serialize};
use thiserror::Error;
use tonic::{Code, Status};

/// Which side of the call is at fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request itself is bad (undecodable image, oversize message). Retrying won't help.
    Client,
    /// The backend failed (model fault, resource exhaustion).
    Server,
}

/// Outcome of a failed `Detect` call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectError {
    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("detection backend unavailable: {0}")]
    Unavailable(String),
}

impl DetectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DetectError::InvalidImage(_) => ErrorKind::Client,
            DetectError::Backend(_) | DetectError::Unavailable(_) => ErrorKind::Server,
        }
    }

    /// The bare message, without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            DetectError::InvalidImage(m) | DetectError::Backend(m) | DetectError::Unavailable(m) => m,
        }
    }
}

/// Client side: classify the status a `Detect` call ended with.
impl From<Status> for DetectError {
    fn from(status: Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            // OutOfRange is tonic's verdict on a message above the size limit
            Code::InvalidArgument | Code::OutOfRange => DetectError::InvalidImage(message),
            Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => {
                DetectError::Unavailable(message)
            }
            _ => DetectError::Backend(message),
        }
    }
}

/// Server side: client faults become `INVALID_ARGUMENT`, everything else `INTERNAL`.
impl From<DetectError> for Status {
    fn from(err: DetectError) -> Self {
        match err {
            DetectError::InvalidImage(m) => Status::invalid_argument(m),
            DetectError::Backend(m) | DetectError::Unavailable(m) => Status::internal(m),
        }
    }
}

impl From<tonic::transport::Error> for DetectError {
    fn from(err: tonic::transport::Error) -> Self {
        DetectError::Unavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_formatting() {
        let err = DetectError::InvalidImage("unsupported format".to_string());
        assert_eq!(err.to_string(), "invalid image: unsupported format");
        assert_eq!(err.message(), "unsupported format");

        let err = DetectError::Unavailable("tcp connect error".to_string());
        assert_eq!(
            err.to_string(),
            "detection backend unavailable: tcp connect error"
        );
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            DetectError::InvalidImage(String::new()).kind(),
            ErrorKind::Client
        );
        assert_eq!(DetectError::Backend(String::new()).kind(), ErrorKind::Server);
        assert_eq!(
            DetectError::Unavailable(String::new()).kind(),
            ErrorKind::Server
        );
    }

    #[test]
    fn test_status_codes_follow_the_fault() {
        let status = Status::from(DetectError::InvalidImage("truncated jpeg".into()));
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "truncated jpeg");

        let status = Status::from(DetectError::Backend("model prediction panicked".into()));
        assert_eq!(status.code(), Code::Internal);
    }

    #[test]
    fn test_status_round_trip_keeps_kind() {
        for original in [
            DetectError::InvalidImage("truncated jpeg".into()),
            DetectError::Backend("CUDA out of memory".into()),
        ] {
            let rebuilt = DetectError::from(Status::from(original.clone()));
            assert_eq!(rebuilt, original);
        }
    }

    #[test]
    fn test_transport_statuses_are_unavailable() {
        let err = DetectError::from(Status::unavailable("connection refused"));
        assert_eq!(err, DetectError::Unavailable("connection refused".into()));

        let err = DetectError::from(Status::out_of_range("message too large"));
        assert_eq!(err.kind(), ErrorKind::Client);
    }
}
