use crate::batch::{batch_detect, detect_stored};
use crate::error::ApiError;
use crate::state::AppState;
use crate::store::{DefectRecord, StoreError};
use crate::video::ws_handler;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, services::ServeDir};

pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/batches", post(create_batch))
        .route("/batches/:batch_id/images", post(upload_image))
        .route("/single-detect", post(single_detect))
        .route("/batch-detect", post(batch_detect))
        .route("/ws/video", get(ws_handler));

    if let Some(root) = state.store.file_root() {
        app = app.nest_service("/static", ServeDir::new(root));
    }

    app.layer(DefaultBodyLimit::max(state.max_upload_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    queue_capacity: usize,
    pending: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let dispatcher = &state.dispatcher;
    Json(HealthResponse {
        status: if dispatcher.is_shutting_down() {
            "shutting_down"
        } else {
            "ok"
        },
        queue_capacity: dispatcher.queue_capacity(),
        pending: dispatcher.pending(),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchCreated {
    batch_id: u64,
}

async fn create_batch(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<BatchCreated>), ApiError> {
    let batch = state.with_store(|store| store.create_batch()).await?;
    tracing::info!(batch_id = batch.batch_id, "Batch created");
    Ok((
        StatusCode::CREATED,
        Json(BatchCreated {
            batch_id: batch.batch_id,
        }),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageUploaded {
    image_id: u64,
    width: u32,
    height: u32,
}

async fn upload_image(
    State(state): State<AppState>,
    Path(batch_id): Path<u64>,
    body: Bytes,
) -> Result<(StatusCode, Json<ImageUploaded>), ApiError> {
    let image = state
        .with_store(move |store| store.add_image(batch_id, &body))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ImageUploaded {
            image_id: image.image_id,
            width: image.width,
            height: image.height,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct ImageQuery {
    #[serde(rename = "imageId")]
    image_id: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DefectView {
    defect_id: u64,
    defect_type: String,
    bbox: String,
    confidence: f64,
}

impl From<DefectRecord> for DefectView {
    fn from(defect: DefectRecord) -> Self {
        Self {
            defect_id: defect.defect_id,
            defect_type: defect.defect_type,
            bbox: defect.bbox,
            confidence: defect.confidence,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SingleDetectResponse {
    has_defect: bool,
    image_id: u64,
    /// RFC 3339, local time
    detect_time: Option<String>,
    processed: Option<String>,
    defects: Vec<DefectView>,
}

/// `POST /single-detect?imageId=` detects one stored image synchronously.
async fn single_detect(
    State(state): State<AppState>,
    Query(query): Query<ImageQuery>,
) -> Result<Json<SingleDetectResponse>, ApiError> {
    let image_id = query.image_id.ok_or(ApiError::MissingParameter("imageId"))?;
    let image = state
        .with_store(move |store| store.image(image_id).ok_or(StoreError::ImageNotFound(image_id)))
        .await?;

    let saved = detect_stored(&state, image).await?;
    tracing::info!(image_id, defects = saved.new_defects, "Single image detected");

    Ok(Json(SingleDetectResponse {
        has_defect: saved.has_defect(),
        image_id,
        detect_time: saved.image.detect_time.map(|t| t.to_rfc3339()),
        processed: saved.image.processed_url(),
        defects: saved.defects.into_iter().map(DefectView::from).collect(),
    }))
}
