use crate::engine::DetectionEngine;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use prost::Message;
use protocol::pb::detector_server::{Detector, DetectorServer};
use protocol::pb::{DetectRequest, DetectResponse};
use protocol::{DetectError, DetectionResponse, ErrorKind};
use std::future::Future;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::Instrument;

#[derive(Clone)]
struct ServerMetrics {
    duration_histogram: Histogram<f64>,
    requests_counter: Counter<u64>,
    detections_counter: Counter<u64>,
    failures_counter: Counter<u64>,
}

fn init_metrics(meter_name: &'static str) -> ServerMetrics {
    let meter = global::meter(meter_name);
    let latency_buckets = [
        0.005, 0.01, 0.02, 0.05, 0.075, 0.1, 0.15, 0.2, 0.3, 0.5, 0.75, 1.0, 2.0, 5.0,
    ];
    ServerMetrics {
        duration_histogram: meter
            .f64_histogram("detect_request_duration_seconds")
            .with_description("Time to serve one Detect call (decode + infer + composite + encode)")
            .with_unit("s")
            .with_boundaries(latency_buckets.to_vec())
            .build(),
        requests_counter: meter
            .u64_counter("detect_requests_total")
            .with_description("Total Detect calls served")
            .build(),
        detections_counter: meter
            .u64_counter("detect_detections_total")
            .with_description("Total detections returned")
            .build(),
        failures_counter: meter
            .u64_counter("detect_failures_total")
            .with_description("Detect calls answered with an error")
            .build(),
    }
}

/// Serves the `Detector` gRPC service.
///
/// tonic runs each call on its own task; model calls from all of them share
/// the engine's worker.
#[derive(Clone)]
pub struct InferenceServer {
    engine: DetectionEngine,
    max_message_bytes: usize,
    metrics: ServerMetrics,
}

impl InferenceServer {
    pub fn new(engine: DetectionEngine, max_message_bytes: usize) -> Self {
        Self {
            engine,
            max_message_bytes,
            metrics: init_metrics("inference"),
        }
    }

    /// The service with tonic's 4 MiB default raised to our message limit.
    pub fn into_service(self) -> DetectorServer<Self> {
        let limit = self.max_message_bytes;
        DetectorServer::new(self)
            .max_decoding_message_size(limit)
            .max_encoding_message_size(limit)
    }

    /// Serve until `shutdown` resolves, then let in-flight calls finish.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        tracing::info!(
            addr = %listener.local_addr()?,
            limit = self.max_message_bytes,
            "Inference server accepting connections"
        );

        Server::builder()
            .add_service(self.into_service())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
            .await?;

        tracing::info!("Inference server stopped");
        Ok(())
    }

    async fn process(&self, image: Vec<u8>) -> Result<DetectionResponse, DetectError> {
        let start = Instant::now();
        let result = self.engine.run(image).await;
        let elapsed = start.elapsed().as_secs_f64();

        self.metrics.duration_histogram.record(elapsed, &[]);
        self.metrics.requests_counter.add(1, &[]);

        match &result {
            Ok(response) => {
                self.metrics
                    .detections_counter
                    .add(response.detections.len() as u64, &[]);
                tracing::debug!(
                    detections = response.detections.len(),
                    elapsed_ms = (elapsed * 1000.0) as u64,
                    "Request served"
                );
            }
            Err(e) => {
                let kind = match e.kind() {
                    ErrorKind::Client => "client",
                    ErrorKind::Server => "server",
                };
                self.metrics
                    .failures_counter
                    .add(1, &[KeyValue::new("kind", kind)]);
            }
        }

        result
    }
}

#[tonic::async_trait]
impl Detector for InferenceServer {
    async fn detect(
        &self,
        request: Request<DetectRequest>,
    ) -> Result<Response<DetectResponse>, Status> {
        let peer = request
            .remote_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let image = request.into_inner().image_data;
        let span = tracing::info_span!("detect_request", %peer, bytes = image.len());

        let reply = DetectResponse::from(self.process(image).instrument(span).await?);
        let size = reply.encoded_len();
        if size > self.max_message_bytes {
            tracing::error!(%peer, size, limit = self.max_message_bytes, "Overlay does not fit in a response");
            return Err(Status::internal(format!(
                "response of {} bytes exceeds the {} byte message limit",
                size, self.max_message_bytes
            )));
        }
        Ok(Response::new(reply))
    }
}
