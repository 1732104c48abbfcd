use super::InferenceBackend;
use crate::config::ModelConfig;
use crate::processing::{post::PostProcessor, pre::PreProcessor};
use image::RgbImage;
use ort::{
    session::{Session, builder::GraphOptimizationLevel},
    value::TensorRef,
};
use overlay::Segment;

#[derive(Debug, Clone, Copy)]
pub enum ExecutionProvider {
    Cpu,
    Cuda,
}

impl ExecutionProvider {
    fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "cuda" | "gpu" => Self::Cuda,
            _ => Self::Cpu,
        }
    }
}

/// YOLO segmentation model (detection head + mask prototypes) on ONNX Runtime.
pub struct OrtBackend {
    session: Session,
    preprocessor: PreProcessor,
    postprocessor: PostProcessor,
}

impl OrtBackend {
    /// Load model with specified execution provider
    pub fn load_model_with_provider(
        config: &ModelConfig,
        provider: ExecutionProvider,
    ) -> anyhow::Result<Self> {
        // Initialize ORT environment (idempotent)
        let _ = ort::init().commit();

        let mut builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?;

        match provider {
            ExecutionProvider::Cuda => {
                tracing::info!("Initializing ONNX Runtime with CUDA execution provider");
                builder = builder.with_execution_providers([
                    ort::execution_providers::CUDAExecutionProvider::default()
                        .with_device_id(0)
                        .build()
                        .error_on_failure(),
                ])?;
            }
            ExecutionProvider::Cpu => {
                tracing::info!("Initializing ONNX Runtime with CPU execution provider");
            }
        }

        let session = builder.commit_from_file(&config.model_path)?;
        tracing::info!("Model loaded from {}", config.model_path);

        Ok(Self {
            session,
            preprocessor: PreProcessor::new(config.input_size),
            postprocessor: PostProcessor::new(config.confidence_threshold, config.iou_threshold),
        })
    }
}

impl InferenceBackend for OrtBackend {
    fn load_model(config: &ModelConfig) -> anyhow::Result<Self> {
        Self::load_model_with_provider(
            config,
            ExecutionProvider::from_name(&config.execution_provider),
        )
    }

    fn predict(&mut self, image: &RgbImage) -> anyhow::Result<Vec<Segment>> {
        let (input, transform) = self.preprocessor.preprocess(image)?;

        let (preds, protos) = {
            let _infer_span = tracing::info_span!("model_inference").entered();
            let outputs = self
                .session
                .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            if outputs.len() < 2 {
                anyhow::bail!(
                    "Segmentation model must expose predictions and mask prototypes, got {} outputs",
                    outputs.len()
                );
            }
            let preds = outputs[0].try_extract_array::<f32>()?.into_owned();
            let protos = outputs[1].try_extract_array::<f32>()?.into_owned();
            (preds, protos)
        };

        self.postprocessor
            .parse_segments(&preds.view(), &protos.view(), &transform)
    }
}
