use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use dispatcher::{Detector, Dispatcher, DispatcherConfig};
use futures_util::{SinkExt, StreamExt};
use gateway::{
    AppState, BatchMessage, DefectStore, LocalStore, StoreError, VideoSession, detect_frame,
    persist_frame, router, run_batch,
};
use image::{ImageFormat, Rgb, RgbImage};
use overlay::{decode_image, encode_image};
use protocol::{DetectError, Detection, DetectionResponse};
use serde_json::{Value, json};
use std::future::IntoFuture;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tower::ServiceExt;

/// Flags an image with one full-frame detection of `class_id` when its
/// top-left pixel is white. The overlay is the request image itself.
struct FakeDetector {
    class_id: i32,
}

impl Detector for FakeDetector {
    async fn detect(&self, image: Vec<u8>) -> Result<DetectionResponse, DetectError> {
        let decoded = decode_image(&image).map_err(DetectError::from)?;
        let (width, height) = decoded.image.dimensions();
        let detections = if decoded.image.get_pixel(0, 0) == &Rgb([255, 255, 255]) {
            vec![Detection::new(
                [0.0, 0.0, width as f64, height as f64],
                0.9,
                self.class_id,
            )]
        } else {
            Vec::new()
        };
        Ok(DetectionResponse {
            detections,
            processed_image: image,
        })
    }
}

struct Harness {
    state: AppState,
    store: Arc<LocalStore>,
    _uploads: TempDir,
}

impl Harness {
    fn new(class_id: i32) -> Self {
        let uploads = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::open(uploads.path().join("uploads")).unwrap());
        let dispatcher = Dispatcher::start(FakeDetector { class_id }, DispatcherConfig::default());
        let state = AppState::new(Arc::new(dispatcher), store.clone());
        Self {
            state,
            store,
            _uploads: uploads,
        }
    }

    fn app(&self) -> Router {
        router(self.state.clone())
    }

    async fn send(&self, method: Method, uri: &str, body: Vec<u8>) -> (StatusCode, String, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body))
            .unwrap();
        let response = self.app().oneshot(request).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string())
            .unwrap_or_default();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec();
        (status, content_type, body)
    }

    async fn json(&self, method: Method, uri: &str, body: Vec<u8>) -> (StatusCode, Value) {
        let (status, _, body) = self.send(method, uri, body).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn create_batch(&self) -> u64 {
        let (status, body) = self.json(Method::POST, "/batches", Vec::new()).await;
        assert_eq!(status, StatusCode::CREATED);
        body["batchId"].as_u64().unwrap()
    }

    async fn upload(&self, batch_id: u64, image: Vec<u8>) -> u64 {
        let uri = format!("/batches/{}/images", batch_id);
        let (status, body) = self.json(Method::POST, &uri, image).await;
        assert_eq!(status, StatusCode::CREATED);
        body["imageId"].as_u64().unwrap()
    }

    /// Serve the router on a real socket and return the video websocket URL.
    async fn serve(&self) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, self.app()).into_future());
        format!("ws://{}/ws/video", addr)
    }

    async fn batch_detect(&self, batch_id: u64) -> Vec<Value> {
        let uri = format!("/batch-detect?batchId={}", batch_id);
        let (status, content_type, body) = self.send(Method::POST, &uri, Vec::new()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type, "application/x-ndjson");
        ndjson(&body)
    }
}

/// Black PNG, with a white top-left pixel when `flagged`.
fn png(width: u32, height: u32, flagged: bool) -> Vec<u8> {
    let mut image = RgbImage::new(width, height);
    if flagged {
        image.put_pixel(0, 0, Rgb([255, 255, 255]));
    }
    encode_image(&image, ImageFormat::Png).unwrap()
}

/// Split a `processed_frame` packet into its event JSON and overlay bytes.
fn unpack(packet: &[u8]) -> (Value, Vec<u8>) {
    let json_len = u32::from_le_bytes(packet[..4].try_into().unwrap()) as usize;
    let event = serde_json::from_slice(&packet[4..4 + json_len]).unwrap();
    (event, packet[4 + json_len..].to_vec())
}

fn ndjson(body: &[u8]) -> Vec<Value> {
    body.split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice(line).unwrap())
        .collect()
}

#[tokio::test]
async fn two_image_batch_streams_progress_in_order() {
    let harness = Harness::new(0);
    let batch_id = harness.create_batch().await;
    let a = harness.upload(batch_id, png(8, 8, true)).await;
    let b = harness.upload(batch_id, png(8, 8, false)).await;

    let messages = harness.batch_detect(batch_id).await;
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0], json!({ "undetectedImageIds": [a, b] }));
    assert_eq!(messages[1]["imageId"], a);
    assert_eq!(messages[1]["hasDefect"], true);
    assert_eq!(messages[2]["imageId"], b);
    assert_eq!(messages[2]["hasDefect"], false);

    let processed = messages[1]["processed"].as_str().unwrap();
    assert!(processed.starts_with("/static/"));
    assert!(processed.ends_with("_processed.png"));

    let defects = harness.store.defects(a);
    assert_eq!(defects.len(), 1);
    assert_eq!(defects[0].defect_type, "edge_crack");
    assert_eq!(defects[0].bbox, "0,0,8,8");
    assert!(harness.store.defects(b).is_empty());

    // Everything is detected now
    let again = harness.batch_detect(batch_id).await;
    assert_eq!(again, vec![json!({ "message": "All images have been detected" })]);
}

#[tokio::test]
async fn empty_batch_emits_a_single_message() {
    let harness = Harness::new(0);
    let batch_id = harness.create_batch().await;

    let messages = harness.batch_detect(batch_id).await;
    assert_eq!(messages, vec![json!({ "message": "All images have been detected" })]);
}

#[tokio::test]
async fn n_pending_images_emit_n_plus_one_messages() {
    let harness = Harness::new(1);
    let batch_id = harness.create_batch().await;
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(harness.upload(batch_id, png(6, 6, i % 2 == 0)).await);
    }

    let messages = harness.batch_detect(batch_id).await;
    assert_eq!(messages.len(), ids.len() + 1);
    assert_eq!(messages[0]["undetectedImageIds"], json!(ids));
    for (i, (message, id)) in messages[1..].iter().zip(&ids).enumerate() {
        assert_eq!(message["imageId"], *id);
        assert_eq!(message["hasDefect"], i % 2 == 0);
    }
}

#[tokio::test]
async fn unreadable_image_is_reported_inline_and_the_batch_continues() {
    let harness = Harness::new(0);
    let batch_id = harness.create_batch().await;
    let lost = harness.upload(batch_id, png(4, 4, true)).await;
    let kept = harness.upload(batch_id, png(4, 4, true)).await;

    let record = harness.store.image(lost).unwrap();
    std::fs::remove_file(harness.store.path_of(&record, &record.original_name)).unwrap();

    let messages = harness.batch_detect(batch_id).await;
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1]["imageId"], lost);
    assert!(messages[1]["error"].as_str().unwrap().starts_with("Read error: "));
    assert_eq!(messages[2]["imageId"], kept);
    assert_eq!(messages[2]["hasDefect"], true);
}

#[tokio::test]
async fn batch_detect_validates_its_parameter() {
    let harness = Harness::new(0);

    let (status, body) = harness.json(Method::POST, "/batch-detect", Vec::new()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "batchId is required");

    let (status, body) = harness
        .json(Method::POST, "/batch-detect?batchId=77", Vec::new())
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "batch 77 not found");
}

#[tokio::test]
async fn coordinator_stops_once_the_client_is_gone() {
    let harness = Harness::new(0);
    let batch = harness.store.create_batch().unwrap();
    for _ in 0..3 {
        harness.store.add_image(batch.batch_id, &png(4, 4, false)).unwrap();
    }
    let pending = harness.store.undetected_images(batch.batch_id).unwrap();

    let (tx, mut rx) = mpsc::channel(1);
    let coordinator = tokio::spawn(run_batch(harness.state.clone(), pending, tx));

    assert!(matches!(rx.recv().await, Some(BatchMessage::Pending { .. })));
    drop(rx);
    coordinator.await.unwrap();

    assert!(!harness.store.undetected_images(batch.batch_id).unwrap().is_empty());
}

#[tokio::test]
async fn single_detect_returns_the_stored_defects() {
    let harness = Harness::new(3);
    let batch_id = harness.create_batch().await;
    let image_id = harness.upload(batch_id, png(10, 5, true)).await;

    let uri = format!("/single-detect?imageId={}", image_id);
    let (status, body) = harness.json(Method::POST, &uri, Vec::new()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["hasDefect"], true);
    assert_eq!(body["imageId"], image_id);
    assert!(body["detectTime"].is_string());
    assert!(body["processed"].as_str().unwrap().ends_with("_processed.png"));
    assert_eq!(body["defects"].as_array().unwrap().len(), 1);
    assert_eq!(body["defects"][0]["defectType"], "patch_defect");
    assert_eq!(body["defects"][0]["bbox"], "0,0,10,5");
    assert_eq!(body["defects"][0]["confidence"], 0.9);

    let (status, body) = harness.json(Method::POST, "/single-detect", Vec::new()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "imageId is required");

    let (status, _) = harness
        .json(Method::POST, "/single-detect?imageId=999", Vec::new())
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn uploads_are_validated() {
    let harness = Harness::new(0);
    let batch_id = harness.create_batch().await;

    let uri = format!("/batches/{}/images", batch_id);
    let (status, body) = harness
        .json(Method::POST, &uri, b"not an image".to_vec())
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().starts_with("invalid image"));

    let (status, _) = harness
        .json(Method::POST, "/batches/404/images", png(2, 2, false))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_reports_the_queue() {
    let harness = Harness::new(0);
    let (status, body) = harness.json(Method::GET, "/health", Vec::new()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok", "queueCapacity": 64, "pending": 0 }));
}

#[tokio::test]
async fn processed_images_are_served() {
    let harness = Harness::new(0);
    let batch_id = harness.create_batch().await;
    let image_id = harness.upload(batch_id, png(4, 4, true)).await;

    let uri = format!("/single-detect?imageId={}", image_id);
    let (_, body) = harness.json(Method::POST, &uri, Vec::new()).await;
    let processed = body["processed"].as_str().unwrap().to_string();

    let (status, _, bytes) = harness.send(Method::GET, &processed, Vec::new()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, png(4, 4, true));
}

#[tokio::test]
async fn video_frames_persist_only_when_defects_are_found() {
    let harness = Harness::new(2);
    let mut session = VideoSession::new(harness.state.next_session());
    assert!(session.id().starts_with("session-"));

    let clean = png(6, 6, false);
    let detected = detect_frame(&harness.state, clean.clone()).await.unwrap();
    assert!(detected.event.defects.is_empty());
    let saved = persist_frame(&harness.state, &mut session, clean, detected.response)
        .await
        .unwrap();
    assert!(saved.is_none());
    assert_eq!(session.batch_id(), None);

    let mut batches = Vec::new();
    for _ in 0..2 {
        let frame = png(6, 6, true);
        let detected = detect_frame(&harness.state, frame.clone()).await.unwrap();
        assert_eq!(detected.event.defects[0].label, "surface_inclusion");
        assert_eq!(detected.event.notifications[0].severity, "danger");

        let packet = detected.packet().unwrap();
        let json_len = u32::from_le_bytes(packet[..4].try_into().unwrap()) as usize;
        assert_eq!(&packet[4 + json_len..], frame.as_slice());

        let saved = persist_frame(&harness.state, &mut session, frame, detected.response)
            .await
            .unwrap()
            .unwrap();
        assert!(saved.image.is_detected());
        batches.push(saved.image.batch_id);
    }

    // One batch per session, created by the first defect
    assert_eq!(batches[0], batches[1]);
    assert_eq!(session.batch_id(), Some(batches[0]));
    assert!(harness.store.undetected_images(batches[0]).unwrap().is_empty());
}

#[tokio::test]
async fn video_sessions_get_distinct_tokens() {
    let harness = Harness::new(0);
    let first = harness.state.next_session();
    let second = harness.state.next_session();
    assert_ne!(first, second);
}

#[tokio::test]
async fn video_frame_with_unknown_class_is_an_error() {
    let harness = Harness::new(9);
    let err = detect_frame(&harness.state, png(4, 4, true)).await.unwrap_err();
    assert!(err.to_string().starts_with("Detection error: class id 9"));

    let err = detect_frame(&harness.state, b"garbage".to_vec()).await.unwrap_err();
    assert!(err.to_string().starts_with("Detection error: "));
}

#[tokio::test]
async fn failed_first_defect_frame_keeps_the_session_batch() {
    let harness = Harness::new(1);
    let mut session = VideoSession::new(harness.state.next_session());

    let unreadable = DetectionResponse {
        detections: vec![Detection::new([0.0, 0.0, 2.0, 2.0], 0.8, 1)],
        processed_image: b"bad-frame".to_vec(),
    };
    let err = persist_frame(&harness.state, &mut session, b"bad-frame".to_vec(), unreadable)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidImage(_)));
    let batch_id = session.batch_id().unwrap();
    assert!(harness.store.batch(batch_id).is_some());

    let frame = png(6, 6, true);
    let detected = detect_frame(&harness.state, frame.clone()).await.unwrap();
    let saved = persist_frame(&harness.state, &mut session, frame, detected.response)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saved.image.batch_id, batch_id);
    assert_eq!(session.batch_id(), Some(batch_id));
}

#[tokio::test]
async fn websocket_reports_frame_errors_and_keeps_serving() {
    let harness = Harness::new(3);
    let (mut socket, _) = tokio_tungstenite::connect_async(harness.serve().await)
        .await
        .unwrap();

    socket.send(WsMessage::Binary(b"garbage".to_vec())).await.unwrap();
    let text = match socket.next().await.unwrap().unwrap() {
        WsMessage::Text(text) => text,
        other => panic!("expected an error event, got {:?}", other),
    };
    let error: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(error["event"], "error");
    assert!(error["msg"].as_str().unwrap().starts_with("Detection error: "));

    let frame = png(6, 6, true);
    socket.send(WsMessage::Binary(frame.clone())).await.unwrap();
    let packet = match socket.next().await.unwrap().unwrap() {
        WsMessage::Binary(packet) => packet,
        other => panic!("expected a processed frame, got {:?}", other),
    };
    let (event, overlay) = unpack(&packet);
    assert_eq!(event["event"], "processed_frame");
    assert_eq!(event["defects"][0]["label"], "patch_defect");
    assert_eq!(event["notifications"][0]["type"], "patch_defect");
    assert_eq!(overlay, frame);

    socket.close(None).await.unwrap();
}

#[tokio::test]
async fn websocket_sends_the_frame_before_storing_it() {
    let harness = Harness::new(0);
    let (mut socket, _) = tokio_tungstenite::connect_async(harness.serve().await)
        .await
        .unwrap();

    // A file where the upload directory should be makes every write fail
    let root = harness.store.root().to_path_buf();
    std::fs::remove_dir_all(&root).unwrap();
    std::fs::write(&root, b"").unwrap();

    let frame = png(6, 6, true);
    socket.send(WsMessage::Binary(frame.clone())).await.unwrap();
    match socket.next().await.unwrap().unwrap() {
        WsMessage::Binary(packet) => assert_eq!(unpack(&packet).1, frame),
        other => panic!("expected a processed frame first, got {:?}", other),
    }
    match socket.next().await.unwrap().unwrap() {
        WsMessage::Text(text) => {
            let error: Value = serde_json::from_str(&text).unwrap();
            assert!(error["msg"].as_str().unwrap().starts_with("Storage error: "));
        }
        other => panic!("expected a storage error, got {:?}", other),
    }

    // Clean frames need no storage, so the connection still answers
    socket.send(WsMessage::Binary(png(6, 6, false))).await.unwrap();
    match socket.next().await.unwrap().unwrap() {
        WsMessage::Binary(packet) => {
            let (event, _) = unpack(&packet);
            assert_eq!(event["defects"], json!([]));
        }
        other => panic!("expected a processed frame, got {:?}", other),
    }
}
