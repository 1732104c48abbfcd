use crate::error::DispatchError;
use protocol::{DetectError, DetectionResponse};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

pub(crate) type TaskResult = Result<DetectionResponse, DetectError>;

/// Process-unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Monotonic counter; ids are never reused within a process.
#[derive(Debug)]
pub(crate) struct TaskIdGenerator(AtomicU64);

impl TaskIdGenerator {
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub(crate) fn next(&self) -> TaskId {
        TaskId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// A queued task. The reply sender is the task's own completion signal.
pub(crate) struct PendingTask {
    pub(crate) id: TaskId,
    pub(crate) image: Vec<u8>,
    pub(crate) enqueued_at: Instant,
    pub(crate) reply: oneshot::Sender<TaskResult>,
}

impl PendingTask {
    pub(crate) fn new(id: TaskId, image: Vec<u8>, timeout: Option<Duration>) -> (Self, Ticket) {
        let (reply, rx) = oneshot::channel();
        let enqueued_at = Instant::now();
        let task = Self {
            id,
            image,
            enqueued_at,
            reply,
        };
        let ticket = Ticket {
            id,
            enqueued_at,
            timeout,
            rx,
        };
        (task, ticket)
    }
}

/// Claim on one submitted task's result.
///
/// The result can be taken exactly once through [`Ticket::wait`]. Dropping the
/// ticket cancels the task: if the worker has not started it yet, it is skipped.
#[must_use = "dropping a ticket cancels its task"]
pub struct Ticket {
    id: TaskId,
    enqueued_at: Instant,
    timeout: Option<Duration>,
    rx: oneshot::Receiver<TaskResult>,
}

impl Ticket {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub async fn wait(self) -> Result<DetectionResponse, DispatchError> {
        let Ticket {
            id,
            enqueued_at,
            timeout,
            rx,
        } = self;

        let received = match timeout {
            Some(limit) => {
                let deadline = tokio::time::Instant::from_std(enqueued_at + limit);
                match tokio::time::timeout_at(deadline, rx).await {
                    Ok(received) => received,
                    Err(_) => {
                        return Err(DispatchError::Timeout {
                            id,
                            waited: enqueued_at.elapsed(),
                        });
                    }
                }
            }
            None => rx.await,
        };

        match received {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(source)) => Err(DispatchError::Detection { id, source }),
            Err(_) => Err(DispatchError::WorkerGone { id }),
        }
    }
}
