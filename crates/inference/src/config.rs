use common::{env_opt, env_or, env_parse};
use overlay::DEFAULT_ALPHA;
use protocol::DEFAULT_MAX_MESSAGE_BYTES;

pub use common::Environment;

pub const DEFAULT_INPUT_SIZE: (u32, u32) = (640, 640);

/// Everything a backend needs to load and run the model.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_path: String,
    pub input_size: (u32, u32),
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// `cpu` or `cuda`; only the ONNX Runtime backend looks at it
    pub execution_provider: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: "models/seg_n.onnx".to_string(),
            input_size: DEFAULT_INPUT_SIZE,
            confidence_threshold: 0.4,
            iou_threshold: 0.7,
            execution_provider: "cpu".to_string(),
        }
    }
}

impl ModelConfig {
    /// Load configuration from environment variables with sensible defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let input_width = env_parse("INPUT_WIDTH", defaults.input_size.0);
        let input_height = env_parse("INPUT_HEIGHT", defaults.input_size.1);

        Self {
            model_path: env_or("MODEL_PATH", &defaults.model_path),
            input_size: (input_width, input_height),
            confidence_threshold: env_parse("CONFIDENCE_THRESHOLD", defaults.confidence_threshold),
            iou_threshold: env_parse("IOU_THRESHOLD", defaults.iou_threshold),
            execution_provider: env_or("EXECUTION_PROVIDER", &defaults.execution_provider),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub environment: Environment,
    pub bind_addr: String,
    pub max_message_bytes: usize,
    pub overlay_alpha: f32,
    pub otel_endpoint: Option<String>,
    pub model: ModelConfig,
}

impl InferenceConfig {
    /// Load configuration from environment variables with sensible defaults
    pub fn from_env() -> Self {
        Self {
            environment: Environment::from_env(),
            bind_addr: env_or("INFERENCE_BIND_ADDR", "0.0.0.0:50051"),
            max_message_bytes: env_parse("MAX_MESSAGE_BYTES", DEFAULT_MAX_MESSAGE_BYTES)
                .max(DEFAULT_MAX_MESSAGE_BYTES),
            overlay_alpha: env_parse("OVERLAY_ALPHA", DEFAULT_ALPHA),
            otel_endpoint: env_opt("OTEL_EXPORTER_OTLP_ENDPOINT"),
            model: ModelConfig::from_env(),
        }
    }

    /// Create default configuration for testing
    pub fn test_default() -> Self {
        Self {
            environment: Environment::Development,
            bind_addr: "127.0.0.1:0".to_string(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            overlay_alpha: DEFAULT_ALPHA,
            otel_endpoint: None,
            model: ModelConfig::default(),
        }
    }
}
