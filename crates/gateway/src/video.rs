use crate::state::AppState;
use crate::store::{SavedDetection, StoreError};
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use dispatcher::DispatchError;
use protocol::{DEFECT_CLASSES, Detection, DetectionResponse, UnknownClass};
use serde::Serialize;
use thiserror::Error;
use tracing::Instrument;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Detection error: {0}")]
    Detection(#[from] DispatchError),

    #[error("Detection error: {0}")]
    UnknownClass(#[from] UnknownClass),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("failed to encode frame event: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameDefect {
    pub x: i64,
    pub y: i64,
    pub w: i64,
    pub h: i64,
    pub label: &'static str,
}

impl FrameDefect {
    pub fn from_detection(detection: &Detection) -> Result<Self, UnknownClass> {
        let [x1, y1, x2, y2] = detection.bbox;
        Ok(Self {
            x: x1 as i64,
            y: y1 as i64,
            w: (x2 - x1) as i64,
            h: (y2 - y1) as i64,
            label: detection.label(&DEFECT_CLASSES)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: usize,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub severity: &'static str,
}

/// Metadata half of a `processed_frame` packet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameEvent {
    pub event: &'static str,
    pub defects: Vec<FrameDefect>,
    pub notifications: Vec<Notification>,
}

impl FrameEvent {
    pub fn from_detections(detections: &[Detection]) -> Result<Self, UnknownClass> {
        let defects = detections
            .iter()
            .map(FrameDefect::from_detection)
            .collect::<Result<Vec<_>, _>>()?;
        let notifications = defects
            .iter()
            .enumerate()
            .map(|(idx, defect)| Notification {
                id: idx + 1,
                kind: defect.label,
                severity: "danger",
            })
            .collect();

        Ok(Self {
            event: "processed_frame",
            defects,
            notifications,
        })
    }
}

#[derive(Debug, Serialize)]
struct ErrorEvent<'a> {
    event: &'static str,
    msg: &'a str,
}

/// Binary reply: `[u32 LE json_len][json][overlay bytes]`.
pub fn encode_packet(event: &FrameEvent, overlay: &[u8]) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(event)?;
    let mut packet = Vec::with_capacity(4 + json.len() + overlay.len());
    packet.extend_from_slice(&(json.len() as u32).to_le_bytes());
    packet.extend_from_slice(&json);
    packet.extend_from_slice(overlay);
    Ok(packet)
}

/// Text reply for a frame that could not be handled.
pub fn error_message(err: &FrameError) -> String {
    let msg = err.to_string();
    let event = ErrorEvent {
        event: "error",
        msg: &msg,
    };
    serde_json::to_string(&event).unwrap_or_else(|_| r#"{"event":"error","msg":"unknown error"}"#.to_string())
}

/// Per-connection state. The batch is created on the first frame with a
/// defect and reused for the rest of the connection.
#[derive(Debug)]
pub struct VideoSession {
    id: String,
    batch_id: Option<u64>,
}

impl VideoSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            batch_id: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn batch_id(&self) -> Option<u64> {
        self.batch_id
    }
}

/// A detected frame, ready to be sent back and persisted.
#[derive(Debug)]
pub struct DetectedFrame {
    pub event: FrameEvent,
    pub response: DetectionResponse,
}

impl DetectedFrame {
    pub fn packet(&self) -> Result<Vec<u8>, serde_json::Error> {
        encode_packet(&self.event, &self.response.processed_image)
    }
}

pub async fn detect_frame(state: &AppState, frame: Vec<u8>) -> Result<DetectedFrame, FrameError> {
    let response = state.dispatcher.submit(frame).await?;
    let event = FrameEvent::from_detections(&response.detections)?;
    Ok(DetectedFrame { event, response })
}

/// Record a frame with defects under the session's batch. Frames without
/// defects are not stored.
pub async fn persist_frame(
    state: &AppState,
    session: &mut VideoSession,
    frame: Vec<u8>,
    response: DetectionResponse,
) -> Result<Option<SavedDetection>, StoreError> {
    if !response.has_defect() {
        return Ok(None);
    }

    // Recorded before the frame is stored, so a failed frame cannot orphan the batch.
    let batch_id = match session.batch_id {
        Some(batch_id) => batch_id,
        None => {
            let batch = state.with_store(|store| store.create_batch()).await?;
            tracing::info!(session = %session.id, batch_id = batch.batch_id, "Created batch for video session");
            session.batch_id = Some(batch.batch_id);
            batch.batch_id
        }
    };

    let saved = state
        .with_store(move |store| {
            let image = store.add_image(batch_id, &frame)?;
            store.save_detection(
                image.image_id,
                &response.processed_image,
                &response.detections,
            )
        })
        .await?;
    Ok(Some(saved))
}

/// `GET /ws/video`: every binary message is one encoded frame.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let session = VideoSession::new(state.next_session());
    let span = tracing::info_span!("video_session", session = %session.id);
    ws.max_message_size(state.max_upload_bytes)
        .max_frame_size(state.max_upload_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, session).instrument(span))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, mut session: VideoSession) {
    tracing::info!("New WebSocket connection established");
    let mut frames = 0u64;

    while let Some(message) = socket.recv().await {
        let frame = match message {
            Ok(Message::Binary(frame)) => frame,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "WebSocket receive failed");
                break;
            }
        };
        frames += 1;

        let reply = match detect_frame(&state, frame.clone()).await {
            Ok(detected) => match detected.packet() {
                Ok(packet) => {
                    if socket.send(Message::Binary(packet)).await.is_err() {
                        break;
                    }
                    persist_frame(&state, &mut session, frame, detected.response)
                        .await
                        .err()
                        .map(FrameError::from)
                }
                Err(e) => Some(FrameError::from(e)),
            },
            Err(e) => Some(e),
        };

        if let Some(err) = reply {
            tracing::warn!(frame = frames, error = %err, "Frame failed");
            if socket.send(Message::Text(error_message(&err))).await.is_err() {
                break;
            }
        }
    }

    tracing::info!(frames, batch_id = ?session.batch_id, "WebSocket client disconnected");
}
