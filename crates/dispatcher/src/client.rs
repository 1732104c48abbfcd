use crate::detector::Detector;
use common::{Backoff, retry_with_backoff_async};
use protocol::pb::{DetectRequest, detector_client::DetectorClient};
use protocol::{DEFAULT_MAX_MESSAGE_BYTES, DetectError, DetectionResponse, ErrorKind};
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Detector that forwards each image to a remote detection server over gRPC.
///
/// The channel connects lazily and reconnects on its own after the backend
/// goes away. Calls that find the backend unreachable are retried with
/// exponential backoff; any other failure is returned as is.
pub struct RemoteDetector {
    addr: String,
    endpoint: Endpoint,
    channel: Channel,
    max_message_bytes: usize,
    backoff: Backoff,
}

impl RemoteDetector {
    /// `addr` is `host:port`. Must be called inside a Tokio runtime.
    pub fn new(addr: impl Into<String>) -> Result<Self, tonic::transport::Error> {
        let addr = addr.into();
        let endpoint = Endpoint::from_shared(format!("http://{}", addr))?
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_nodelay(true);
        let channel = endpoint.connect_lazy();
        Ok(Self {
            addr,
            endpoint,
            channel,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            backoff: Backoff::default(),
        })
    }

    pub fn with_max_message_bytes(mut self, max_message_bytes: usize) -> Self {
        self.max_message_bytes = max_message_bytes;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    /// Check that the backend accepts connections.
    pub async fn connect(&self) -> Result<(), tonic::transport::Error> {
        self.endpoint.connect().await?;
        tracing::info!(addr = %self.addr, "Detection backend reachable");
        Ok(())
    }

    fn client(&self) -> DetectorClient<Channel> {
        DetectorClient::new(self.channel.clone())
            .max_decoding_message_size(self.max_message_bytes)
            .max_encoding_message_size(self.max_message_bytes)
    }

    /// One call. Only an unreachable backend is an `Err` here, so that the
    /// retry loop leaves every other status alone.
    async fn call(&self, request: DetectRequest) -> Result<Result<DetectionResponse, DetectError>, Status> {
        match self.client().detect(request).await {
            Ok(reply) => Ok(DetectionResponse::try_from(reply.into_inner())),
            Err(status) if status.code() == Code::Unavailable => Err(status),
            Err(status) => Ok(Err(DetectError::from(status))),
        }
    }
}

impl Detector for RemoteDetector {
    async fn detect(&self, image: Vec<u8>) -> Result<DetectionResponse, DetectError> {
        if image.len() > self.max_message_bytes {
            return Err(DetectError::InvalidImage(format!(
                "image of {} bytes exceeds the {} byte message limit",
                image.len(),
                self.max_message_bytes
            )));
        }

        let request = DetectRequest { image_data: image };
        let result = retry_with_backoff_async(
            || self.call(request.clone()),
            &self.backoff,
            "Detect call",
        )
        .await
        .map_err(DetectError::from)
        .and_then(|result| result);

        match &result {
            Err(e) if e.kind() == ErrorKind::Server => {
                tracing::error!(addr = %self.addr, error = %e, "Detection request failed");
            }
            _ => {}
        }
        result
    }
}
