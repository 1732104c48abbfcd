use crate::error::{ApiError, StepError};
use crate::state::AppState;
use crate::store::{ImageRecord, SavedDetection};
use async_stream::stream;
use axum::{
    body::Body,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio::sync::mpsc;
use tracing::Instrument;

pub const ALL_DETECTED: &str = "All images have been detected";
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// One line of the batch progress stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BatchMessage {
    #[serde(rename_all = "camelCase")]
    Pending { undetected_image_ids: Vec<u64> },

    #[serde(rename_all = "camelCase")]
    Detected {
        image_id: u64,
        has_defect: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        processed: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Failed { image_id: u64, error: String },

    Finished { message: &'static str },
}

impl BatchMessage {
    /// JSON object terminated by `\n`.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Read a stored image, run it through the dispatcher and record the result.
pub async fn detect_stored(state: &AppState, image: ImageRecord) -> Result<SavedDetection, StepError> {
    let image_id = image.image_id;
    let bytes = state
        .with_store(move |store| store.read_original(&image))
        .await
        .map_err(StepError::Read)?;

    let response = state
        .dispatcher
        .submit(bytes)
        .await
        .map_err(StepError::Detection)?;

    let detections = response.detections;
    let processed_image = response.processed_image;
    state
        .with_store(move |store| store.save_detection(image_id, &processed_image, &detections))
        .await
        .map_err(StepError::Persist)
}

/// Detect `pending` one image at a time, reporting progress on `tx`.
///
/// A failed item is reported and skipped. Once the receiver is gone no
/// further item is started.
pub async fn run_batch(state: AppState, pending: Vec<ImageRecord>, tx: mpsc::Sender<BatchMessage>) {
    if pending.is_empty() {
        let _ = tx.send(BatchMessage::Finished { message: ALL_DETECTED }).await;
        return;
    }

    let total = pending.len();
    let undetected_image_ids = pending.iter().map(|image| image.image_id).collect();
    if tx.send(BatchMessage::Pending { undetected_image_ids }).await.is_err() {
        return;
    }

    for (done, image) in pending.into_iter().enumerate() {
        if tx.is_closed() {
            tracing::info!(done, total, "Client went away, stopping batch");
            return;
        }

        let image_id = image.image_id;
        let message = match detect_stored(&state, image).await {
            Ok(saved) => BatchMessage::Detected {
                image_id,
                has_defect: saved.has_defect(),
                processed: saved.image.processed_url(),
            },
            Err(e) => {
                tracing::warn!(image_id, error = %e, "Batch item failed");
                BatchMessage::Failed {
                    image_id,
                    error: e.to_string(),
                }
            }
        };

        if tx.send(message).await.is_err() {
            tracing::info!(done = done + 1, total, "Client went away, stopping batch");
            return;
        }
    }

    tracing::info!(total, "Batch finished");
}

#[derive(Debug, Deserialize)]
pub struct BatchQuery {
    #[serde(rename = "batchId")]
    pub batch_id: Option<u64>,
}

/// `POST /batch-detect?batchId=` streams NDJSON progress for the batch.
pub async fn batch_detect(
    State(state): State<AppState>,
    Query(query): Query<BatchQuery>,
) -> Result<Response, ApiError> {
    let batch_id = query.batch_id.ok_or(ApiError::MissingParameter("batchId"))?;
    let pending = state
        .with_store(move |store| store.undetected_images(batch_id))
        .await?;
    tracing::info!(batch_id, pending = pending.len(), "Batch detection started");

    let (tx, mut rx) = mpsc::channel(1);
    let span = tracing::info_span!("batch_detect", batch_id);
    tokio::spawn(run_batch(state, pending, tx).instrument(span));

    let lines = stream! {
        while let Some(message) = rx.recv().await {
            match message.to_line() {
                Ok(line) => {
                    yield Ok::<_, Infallible>(line);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode batch message");
                }
            }
        }
    };

    Ok((
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        Body::from_stream(lines),
    )
        .into_response())
}
