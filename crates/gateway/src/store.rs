use chrono::{DateTime, Local};
use overlay::{DecodedImage, OverlayError, decode_image, encode_image};
use protocol::{DEFECT_CLASSES, Detection, UnknownClass};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

const THUMBNAIL_SIZE: u32 = 150;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("batch {0} not found")]
    BatchNotFound(u64),

    #[error("image {0} not found")]
    ImageNotFound(u64),

    #[error("invalid image: {0}")]
    InvalidImage(#[source] OverlayError),

    #[error(transparent)]
    UnknownClass(#[from] UnknownClass),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("storage task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchRecord {
    pub batch_id: u64,
    pub import_time: DateTime<Local>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub image_id: u64,
    pub batch_id: u64,
    /// File name inside the image's date folder
    pub original_name: String,
    pub processed_name: Option<String>,
    pub create_time: DateTime<Local>,
    /// Set once the image went through detection
    pub detect_time: Option<DateTime<Local>>,
    pub width: u32,
    pub height: u32,
}

impl ImageRecord {
    /// `YYYY-MM-DD` folder holding every file of this image.
    pub fn date_folder(&self) -> String {
        self.create_time.format("%Y-%m-%d").to_string()
    }

    pub fn is_detected(&self) -> bool {
        self.detect_time.is_some()
    }

    /// Path under which the HTTP layer serves the overlay.
    pub fn processed_url(&self) -> Option<String> {
        self.processed_name
            .as_ref()
            .map(|name| format!("/static/{}/{}", self.date_folder(), name))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DefectRecord {
    pub defect_id: u64,
    pub image_id: u64,
    pub defect_type: String,
    /// `"x1,y1,x2,y2"`
    pub bbox: String,
    pub confidence: f64,
}

/// Outcome of recording one detection run against a stored image.
#[derive(Debug, Clone)]
pub struct SavedDetection {
    pub image: ImageRecord,
    /// Defects added by this run
    pub new_defects: usize,
    /// Every defect on record for the image, oldest first
    pub defects: Vec<DefectRecord>,
}

impl SavedDetection {
    pub fn has_defect(&self) -> bool {
        self.new_defects > 0
    }
}

/// Persistence for batches, images and their defects.
///
/// Calls block on disk I/O; async callers go through `spawn_blocking`.
pub trait DefectStore: Send + Sync + 'static {
    fn create_batch(&self) -> Result<BatchRecord, StoreError>;

    fn batch(&self, batch_id: u64) -> Option<BatchRecord>;

    /// Store an encoded image (plus a thumbnail) in `batch_id`. The bytes must decode.
    fn add_image(&self, batch_id: u64, bytes: &[u8]) -> Result<ImageRecord, StoreError>;

    fn image(&self, image_id: u64) -> Option<ImageRecord>;

    /// Images of the batch that were never detected, in upload order.
    fn undetected_images(&self, batch_id: u64) -> Result<Vec<ImageRecord>, StoreError>;

    fn read_original(&self, image: &ImageRecord) -> Result<Vec<u8>, StoreError>;

    /// Write the overlay, record the defects and mark the image detected.
    ///
    /// Every class id is resolved before anything is written, so an unknown
    /// class leaves the image untouched.
    fn save_detection(
        &self,
        image_id: u64,
        processed_image: &[u8],
        detections: &[Detection],
    ) -> Result<SavedDetection, StoreError>;

    fn defects(&self, image_id: u64) -> Vec<DefectRecord>;

    /// Directory the stored files can be served from, if any.
    fn file_root(&self) -> Option<&Path> {
        None
    }
}

#[derive(Default)]
struct Tables {
    last_batch_id: u64,
    last_image_id: u64,
    last_defect_id: u64,
    batches: BTreeMap<u64, BatchRecord>,
    images: BTreeMap<u64, ImageRecord>,
    defects: Vec<DefectRecord>,
}

fn next_id(last: &mut u64) -> u64 {
    *last += 1;
    *last
}

/// Records in memory, files under `root/YYYY-MM-DD/`.
pub struct LocalStore {
    root: PathBuf,
    tables: Mutex<Tables>,
}

impl LocalStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        tracing::info!(root = %root.display(), "Upload store ready");
        Ok(Self {
            root,
            tables: Mutex::new(Tables::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a stored file.
    pub fn path_of(&self, image: &ImageRecord, name: &str) -> PathBuf {
        self.root.join(image.date_folder()).join(name)
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DefectStore for LocalStore {
    fn create_batch(&self) -> Result<BatchRecord, StoreError> {
        let mut tables = self.lock();
        let batch = BatchRecord {
            batch_id: next_id(&mut tables.last_batch_id),
            import_time: Local::now(),
        };
        tables.batches.insert(batch.batch_id, batch.clone());
        tracing::debug!(batch_id = batch.batch_id, "Batch created");
        Ok(batch)
    }

    fn batch(&self, batch_id: u64) -> Option<BatchRecord> {
        self.lock().batches.get(&batch_id).cloned()
    }

    fn add_image(&self, batch_id: u64, bytes: &[u8]) -> Result<ImageRecord, StoreError> {
        if self.batch(batch_id).is_none() {
            return Err(StoreError::BatchNotFound(batch_id));
        }
        let decoded = decode_image(bytes).map_err(StoreError::InvalidImage)?;
        let (width, height) = decoded.image.dimensions();
        let extension = decoded.format.extensions_str().first().copied().unwrap_or("png");

        let create_time = Local::now();
        let image_id = next_id(&mut self.lock().last_image_id);
        let original_name = format!("{}_{}.{}", create_time.format("%H%M%S%6f"), image_id, extension);
        let dir = self.root.join(create_time.format("%Y-%m-%d").to_string());

        write_file(&dir, &original_name, bytes)?;
        let thumbnail = thumbnail(&decoded).unwrap_or_else(|e| {
            tracing::warn!(image_id, error = %e, "Thumbnail failed, storing the original instead");
            bytes.to_vec()
        });
        write_file(&dir, &derived_name(&original_name, "thumbnail"), &thumbnail)?;

        let record = ImageRecord {
            image_id,
            batch_id,
            original_name,
            processed_name: None,
            create_time,
            detect_time: None,
            width,
            height,
        };
        self.lock().images.insert(image_id, record.clone());
        tracing::debug!(image_id, batch_id, width, height, "Image stored");
        Ok(record)
    }

    fn image(&self, image_id: u64) -> Option<ImageRecord> {
        self.lock().images.get(&image_id).cloned()
    }

    fn undetected_images(&self, batch_id: u64) -> Result<Vec<ImageRecord>, StoreError> {
        let tables = self.lock();
        if !tables.batches.contains_key(&batch_id) {
            return Err(StoreError::BatchNotFound(batch_id));
        }
        Ok(tables
            .images
            .values()
            .filter(|image| image.batch_id == batch_id && !image.is_detected())
            .cloned()
            .collect())
    }

    fn read_original(&self, image: &ImageRecord) -> Result<Vec<u8>, StoreError> {
        let path = self.path_of(image, &image.original_name);
        fs::read(&path).map_err(|source| StoreError::Io { path, source })
    }

    fn save_detection(
        &self,
        image_id: u64,
        processed_image: &[u8],
        detections: &[Detection],
    ) -> Result<SavedDetection, StoreError> {
        let labels = detections
            .iter()
            .map(|d| d.label(&DEFECT_CLASSES))
            .collect::<Result<Vec<_>, _>>()?;
        let image = self.image(image_id).ok_or(StoreError::ImageNotFound(image_id))?;

        let processed_name = derived_name(&image.original_name, "processed");
        write_file(&self.root.join(image.date_folder()), &processed_name, processed_image)?;

        let mut tables = self.lock();
        let record = tables
            .images
            .get_mut(&image_id)
            .ok_or(StoreError::ImageNotFound(image_id))?;
        record.processed_name = Some(processed_name);
        record.detect_time = Some(Local::now());
        let image = record.clone();

        for (detection, label) in detections.iter().zip(labels) {
            let defect_id = next_id(&mut tables.last_defect_id);
            tables.defects.push(DefectRecord {
                defect_id,
                image_id,
                defect_type: label.to_string(),
                bbox: detection.bbox_string(),
                confidence: detection.confidence,
            });
        }
        let defects = tables
            .defects
            .iter()
            .filter(|d| d.image_id == image_id)
            .cloned()
            .collect();

        Ok(SavedDetection {
            image,
            new_defects: detections.len(),
            defects,
        })
    }

    fn defects(&self, image_id: u64) -> Vec<DefectRecord> {
        self.lock()
            .defects
            .iter()
            .filter(|d| d.image_id == image_id)
            .cloned()
            .collect()
    }

    fn file_root(&self) -> Option<&Path> {
        Some(&self.root)
    }
}

/// `photo.jpg` + `processed` -> `photo_processed.jpg`
pub fn derived_name(original: &str, suffix: &str) -> String {
    let path = Path::new(original);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default();
    match path.extension() {
        Some(ext) => format!("{}_{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}_{}", stem, suffix),
    }
}

fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
    fs::create_dir_all(dir).map_err(|source| StoreError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let path = dir.join(name);
    fs::write(&path, bytes).map_err(|source| StoreError::Io { path, source })
}

fn thumbnail(decoded: &DecodedImage) -> Result<Vec<u8>, OverlayError> {
    let (width, height) = thumbnail_dimensions(decoded.image.width(), decoded.image.height());
    let small = image::imageops::thumbnail(&decoded.image, width, height);
    encode_image(&small, decoded.format)
}

/// Fit inside a `THUMBNAIL_SIZE` square, keeping the aspect ratio. Never upscales.
fn thumbnail_dimensions(width: u32, height: u32) -> (u32, u32) {
    let longest = width.max(height).max(1) as f64;
    let scale = (THUMBNAIL_SIZE as f64 / longest).min(1.0);
    let scaled = |side: u32| ((side as f64 * scale).round() as u32).max(1);
    (scaled(width), scaled(height))
}
