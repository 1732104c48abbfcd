use crate::store::StoreError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use dispatcher::DispatchError;
use serde_json::json;
use thiserror::Error;

/// Failure of one step while detecting a stored image. The message prefix
/// names the step; batch streams report it verbatim.
#[derive(Error, Debug)]
pub enum StepError {
    #[error("Read error: {0}")]
    Read(#[source] StoreError),

    #[error("Detection error: {0}")]
    Detection(#[source] DispatchError),

    #[error("Persist error: {0}")]
    Persist(#[source] StoreError),
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0} is required")]
    MissingParameter(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Step(#[from] StepError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingParameter(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(e) => store_status(e),
            ApiError::Step(StepError::Read(e)) => match e {
                StoreError::ImageNotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Step(StepError::Detection(e)) => dispatch_status(e),
            ApiError::Step(StepError::Persist(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::BatchNotFound(_) | StoreError::ImageNotFound(_) => StatusCode::NOT_FOUND,
        StoreError::InvalidImage(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn dispatch_status(err: &DispatchError) -> StatusCode {
    match err {
        _ if err.is_client_error() => StatusCode::BAD_REQUEST,
        DispatchError::QueueFull { .. } | DispatchError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        DispatchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "Request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatcher::TaskId;
    use protocol::DetectError;

    #[test]
    fn step_errors_carry_their_prefix() {
        let err = StepError::Detection(DispatchError::ShuttingDown);
        assert_eq!(err.to_string(), "Detection error: dispatcher is shutting down");

        let err = StepError::Persist(StoreError::ImageNotFound(4));
        assert_eq!(err.to_string(), "Persist error: image 4 not found");
    }

    #[test]
    fn status_codes() {
        assert_eq!(
            ApiError::MissingParameter("batchId").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(StoreError::BatchNotFound(1)).status(),
            StatusCode::NOT_FOUND
        );

        let invalid = DispatchError::Detection {
            id: TaskId::from_raw(1),
            source: DetectError::InvalidImage("truncated".into()),
        };
        assert_eq!(
            ApiError::from(StepError::Detection(invalid)).status(),
            StatusCode::BAD_REQUEST
        );

        let backend = DispatchError::Detection {
            id: TaskId::from_raw(2),
            source: DetectError::Backend("oom".into()),
        };
        assert_eq!(
            ApiError::from(StepError::Detection(backend)).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(StepError::Detection(DispatchError::QueueFull { capacity: 2 })).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
