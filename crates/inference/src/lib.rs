pub mod backend;
pub mod config;
pub mod engine;
pub mod processing;
pub mod service;
pub mod worker;

// Re-export commonly used types for convenience
pub use backend::InferenceBackend;
pub use config::{InferenceConfig, ModelConfig};
pub use engine::{DetectionEngine, RequestStage};
pub use service::InferenceServer;
pub use worker::ModelWorker;

#[cfg(feature = "ort-backend")]
pub type DefaultBackend = backend::ort::OrtBackend;

#[cfg(all(feature = "stub-backend", not(feature = "ort-backend")))]
pub type DefaultBackend = backend::stub::StubBackend;
