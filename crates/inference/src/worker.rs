use crate::backend::InferenceBackend;
use crate::config::ModelConfig;
use image::RgbImage;
use overlay::Segment;
use protocol::DetectError;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, mpsc};
use std::thread;
use tokio::sync::oneshot;

struct Job {
    image: Arc<RgbImage>,
    reply: oneshot::Sender<Result<Vec<Segment>, DetectError>>,
}

/// Handle to the thread that owns the model.
///
/// The backend is loaded on that thread and never leaves it, so model calls
/// are serialized no matter how many handles exist.
#[derive(Clone)]
pub struct ModelWorker {
    jobs: mpsc::Sender<Job>,
}

impl ModelWorker {
    /// Start the worker and load the model on it. Fails if the model fails to load.
    pub fn spawn<B: InferenceBackend + 'static>(config: ModelConfig) -> anyhow::Result<Self> {
        let (jobs, rx) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<anyhow::Result<()>>(1);

        thread::Builder::new()
            .name("model-worker".to_string())
            .spawn(move || {
                let mut backend = match B::load_model(&config) {
                    Ok(backend) => {
                        let _ = ready_tx.send(Ok(()));
                        backend
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                run(&mut backend, rx);
            })?;

        ready_rx
            .recv()
            .map_err(|_| anyhow::anyhow!("Model worker exited while loading the model"))??;

        Ok(Self { jobs })
    }

    /// Run the model on one image. Waits behind any predictions already queued.
    pub async fn predict(&self, image: Arc<RgbImage>) -> Result<Vec<Segment>, DetectError> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job { image, reply })
            .map_err(|_| DetectError::Backend("model worker is not running".to_string()))?;
        rx.await
            .map_err(|_| DetectError::Backend("model worker dropped the request".to_string()))?
    }
}

fn run<B: InferenceBackend>(backend: &mut B, jobs: mpsc::Receiver<Job>) {
    tracing::info!("Model worker ready");

    while let Ok(Job { image, reply }) = jobs.recv() {
        if reply.is_closed() {
            continue;
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| backend.predict(&image)));
        let result = match outcome {
            Ok(Ok(segments)) => Ok(segments),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Model prediction failed");
                Err(DetectError::Backend(format!("model prediction failed: {:#}", e)))
            }
            Err(_) => {
                tracing::error!("Model prediction panicked");
                Err(DetectError::Backend("model prediction panicked".to_string()))
            }
        };
        let _ = reply.send(result);
    }

    tracing::info!("Model worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::Detection;

    /// Panics on 1x1 images, fails on 2x2, otherwise reports one detection.
    struct PickyBackend;

    impl InferenceBackend for PickyBackend {
        fn load_model(config: &ModelConfig) -> anyhow::Result<Self> {
            if config.model_path == "missing.onnx" {
                anyhow::bail!("model file not found: {}", config.model_path);
            }
            Ok(Self)
        }

        fn predict(&mut self, image: &RgbImage) -> anyhow::Result<Vec<Segment>> {
            match image.width() {
                1 => panic!("model fault"),
                2 => anyhow::bail!("out of memory"),
                w => Ok(vec![Segment::new(
                    Detection::new([0.0, 0.0, w as f64, w as f64], 0.9, 0),
                    None,
                )]),
            }
        }
    }

    #[test]
    fn load_failure_is_reported() {
        let config = ModelConfig {
            model_path: "missing.onnx".to_string(),
            ..ModelConfig::default()
        };
        let err = ModelWorker::spawn::<PickyBackend>(config).err().unwrap();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn worker_survives_errors_and_panics() {
        let worker = ModelWorker::spawn::<PickyBackend>(ModelConfig::default()).unwrap();

        let err = worker.predict(Arc::new(RgbImage::new(1, 1))).await.unwrap_err();
        assert_eq!(err, DetectError::Backend("model prediction panicked".to_string()));

        let err = worker.predict(Arc::new(RgbImage::new(2, 2))).await.unwrap_err();
        assert!(err.message().contains("out of memory"));

        let segments = worker.predict(Arc::new(RgbImage::new(5, 5))).await.unwrap();
        assert_eq!(segments[0].detection.bbox, [0.0, 0.0, 5.0, 5.0]);
    }
}
