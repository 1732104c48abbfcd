pub mod batch;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod store;
pub mod video;

pub use batch::{BatchMessage, run_batch};
pub use config::{BackendMode, GatewayConfig};
pub use error::{ApiError, StepError};
pub use routes::router;
pub use state::AppState;
pub use store::{DefectStore, LocalStore, StoreError};
pub use video::{VideoSession, detect_frame, persist_frame};
