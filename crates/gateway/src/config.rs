use common::{env_opt, env_or, env_parse};
use dispatcher::DispatcherConfig;
use inference::ModelConfig;
use overlay::DEFAULT_ALPHA;
use protocol::DEFAULT_MAX_MESSAGE_BYTES;
use std::path::PathBuf;
use std::str::FromStr;

pub use common::Environment;

/// Where detections run: on a remote inference server or in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    Remote,
    Local,
}

impl BackendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendMode::Remote => "remote",
            BackendMode::Local => "local",
        }
    }
}

impl FromStr for BackendMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "remote" => Ok(Self::Remote),
            "local" => Ok(Self::Local),
            other => Err(format!(
                "{} is not a supported detection mode. Use either `remote` or `local`.",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub environment: Environment,
    pub bind_addr: String,
    pub mode: BackendMode,
    pub backend_addr: String,
    pub backend_poll_interval_ms: u64,
    pub upload_dir: PathBuf,
    /// Largest image accepted on uploads, websocket frames and the backend link
    pub max_message_bytes: usize,
    pub overlay_alpha: f32,
    pub otel_endpoint: Option<String>,
    pub dispatcher: DispatcherConfig,
    /// Only used in local mode
    pub model: ModelConfig,
}

impl GatewayConfig {
    /// Load configuration from environment variables with sensible defaults
    pub fn from_env() -> Self {
        let mode = env_or("DETECTION_MODE", "remote")
            .parse()
            .unwrap_or_else(|e: String| {
                tracing::warn!("{}; falling back to `remote`", e);
                BackendMode::Remote
            });

        Self {
            environment: Environment::from_env(),
            bind_addr: env_or("GATEWAY_ADDR", "0.0.0.0:5000"),
            mode,
            backend_addr: env_or("BACKEND_ADDR", "127.0.0.1:50051"),
            backend_poll_interval_ms: env_parse("BACKEND_POLL_INTERVAL_MS", 500),
            upload_dir: PathBuf::from(env_or("UPLOAD_DIR", "instance/uploads")),
            max_message_bytes: env_parse("MAX_MESSAGE_BYTES", DEFAULT_MAX_MESSAGE_BYTES)
                .max(DEFAULT_MAX_MESSAGE_BYTES),
            overlay_alpha: env_parse("OVERLAY_ALPHA", DEFAULT_ALPHA),
            otel_endpoint: env_opt("OTEL_EXPORTER_OTLP_ENDPOINT"),
            dispatcher: DispatcherConfig::from_env(),
            model: ModelConfig::from_env(),
        }
    }

    /// Create default configuration for testing
    pub fn test_default(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            environment: Environment::Development,
            bind_addr: "127.0.0.1:0".to_string(),
            mode: BackendMode::Local,
            backend_addr: "127.0.0.1:50051".to_string(),
            backend_poll_interval_ms: 10,
            upload_dir: upload_dir.into(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            overlay_alpha: DEFAULT_ALPHA,
            otel_endpoint: None,
            dispatcher: DispatcherConfig::default(),
            model: ModelConfig::default(),
        }
    }
}
