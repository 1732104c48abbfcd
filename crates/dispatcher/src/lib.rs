pub mod client;
pub mod config;
pub mod detector;
pub mod dispatcher;
pub mod error;
pub mod task;

pub use client::RemoteDetector;
pub use config::{DispatcherConfig, OverflowPolicy};
pub use detector::Detector;
pub use dispatcher::Dispatcher;
pub use error::DispatchError;
pub use task::{TaskId, Ticket};
