pub mod config;
pub mod logging;
pub mod retry;
pub mod telemetry;
#[cfg(feature = "async")]
pub mod wait;

pub use config::{Environment, env_opt, env_or, env_parse};
pub use logging::setup_logging;
pub use retry::Backoff;
pub use telemetry::{TelemetryGuard, init_observability};

#[cfg(feature = "async")]
pub use retry::retry_with_backoff_async;
#[cfg(feature = "async")]
pub use wait::wait_for_resource_async;
