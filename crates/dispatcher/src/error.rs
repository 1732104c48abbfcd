use crate::task::TaskId;
use protocol::{DetectError, ErrorKind};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("dispatch queue is full ({capacity} tasks pending)")]
    QueueFull { capacity: usize },

    #[error("dispatcher is shutting down")]
    ShuttingDown,

    #[error("{id} still pending after {waited:?}")]
    Timeout { id: TaskId, waited: Duration },

    #[error("{id} was dropped without a result")]
    WorkerGone { id: TaskId },

    #[error("{id} failed: {source}")]
    Detection {
        id: TaskId,
        #[source]
        source: DetectError,
    },
}

impl DispatchError {
    /// The backend's verdict, if the task got that far.
    pub fn detect_error(&self) -> Option<&DetectError> {
        match self {
            DispatchError::Detection { source, .. } => Some(source),
            _ => None,
        }
    }

    /// True when the image itself was rejected; everything else is on our side.
    pub fn is_client_error(&self) -> bool {
        self.detect_error()
            .is_some_and(|e| e.kind() == ErrorKind::Client)
    }
}
