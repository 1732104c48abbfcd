use common::{env_opt, env_or, env_parse};
use std::str::FromStr;
use std::time::Duration;

/// What `enqueue` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Hold the caller until a slot frees up (bounded by the task timeout, if any).
    Wait,
    /// Fail immediately with `DispatchError::QueueFull`.
    Reject,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "wait" | "block" => Ok(Self::Wait),
            "reject" => Ok(Self::Reject),
            other => Err(format!(
                "{} is not a supported overflow policy. Use either `wait` or `reject`.",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Longest a caller waits for its result, counted from enqueue. `None` waits forever.
    pub task_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            overflow: OverflowPolicy::Wait,
            task_timeout: None,
        }
    }
}

impl DispatcherConfig {
    /// Load configuration from environment variables with sensible defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let queue_capacity = env_parse("DISPATCH_QUEUE_CAPACITY", defaults.queue_capacity).max(1);

        let overflow = env_or("DISPATCH_OVERFLOW", "wait")
            .parse()
            .unwrap_or_else(|e: String| {
                tracing::warn!("{}; falling back to `wait`", e);
                OverflowPolicy::Wait
            });

        let task_timeout = env_opt::<u64>("DISPATCH_TIMEOUT_SECS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Self {
            queue_capacity,
            overflow,
            task_timeout,
        }
    }
}
