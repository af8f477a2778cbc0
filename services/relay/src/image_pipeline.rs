//! Image reconstruction, camera capture and the managed image directory.
//!
//! Every produced file lives directly under the configured image directory
//! and is referenced externally as `<public_prefix>/<file name>`. Inbound
//! paths are reduced to their final component before touching the disk.

use crate::camera::{Camera, CameraError};
use crate::config::ImagesConfig;
use chrono::Local;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

/// Nearest-neighbour upscale applied to reconstructed frames.
pub const UPSCALE_FACTOR: u32 = 10;

/// Edge length of the blank placeholder image.
pub const PLACEHOLDER_SIZE: u32 = 32;

/// Errors that can occur while producing an image.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Image encoding failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Image directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error("Capture did not finish within {0:?}")]
    CaptureTimeout(Duration),

    #[error("Capture task failed: {0}")]
    CaptureTask(String),

    #[error("Previous capture still holds the camera")]
    CaptureBusy,
}

/// Raster frame carried inline in a sensor packet.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
    width: u32,
    height: u32,
    /// Row-major RGB triples
    pixels: Vec<[u8; 3]>,
}

impl ImageFrame {
    /// Parse `{"width", "height", "pixels": [[{"r","g","b"}, ...], ...]}`.
    ///
    /// Channels are clamped to one byte, missing channels read as 0. Rows and
    /// cells beyond the declared size are ignored.
    pub fn from_value(value: &Value) -> Result<Self, ImageError> {
        let width = dimension(value, "width")?;
        let height = dimension(value, "height")?;

        let rows = value
            .get("pixels")
            .and_then(Value::as_array)
            .ok_or_else(|| ImageError::InvalidFrame("pixels is not a list".to_string()))?;
        if rows.len() < height as usize {
            return Err(ImageError::InvalidFrame(format!(
                "expected {height} rows, got {}",
                rows.len()
            )));
        }

        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        for (y, row) in rows.iter().take(height as usize).enumerate() {
            let cells = row
                .as_array()
                .filter(|cells| cells.len() >= width as usize)
                .ok_or_else(|| {
                    ImageError::InvalidFrame(format!("row {y} has fewer than {width} pixels"))
                })?;

            for (x, cell) in cells.iter().take(width as usize).enumerate() {
                if !cell.is_object() {
                    return Err(ImageError::InvalidFrame(format!(
                        "pixel ({x}, {y}) is not an object"
                    )));
                }
                pixels.push([channel(cell, "r"), channel(cell, "g"), channel(cell, "b")]);
            }
        }

        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raster upscaled by `factor` with nearest-neighbour sampling.
    pub fn upscaled(&self, factor: u32) -> RgbImage {
        RgbImage::from_fn(self.width * factor, self.height * factor, |x, y| {
            let idx = (y / factor) as usize * self.width as usize + (x / factor) as usize;
            Rgb(self.pixels[idx])
        })
    }
}

fn dimension(value: &Value, key: &str) -> Result<u32, ImageError> {
    let raw = value.get(key).and_then(|v| {
        v.as_i64()
            .or_else(|| v.as_f64().map(|f| f.trunc() as i64))
    });
    match raw {
        Some(n) if n > 0 => u32::try_from(n)
            .map_err(|_| ImageError::InvalidFrame(format!("{key} {n} out of range"))),
        _ => Err(ImageError::InvalidFrame(format!("{key} must be a positive integer"))),
    }
}

fn channel(cell: &Value, key: &str) -> u8 {
    cell.get(key)
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .map(|n| n.clamp(0, 255) as u8)
        .unwrap_or(0)
}

/// How a stored image came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// An existing file named by the packet
    Reused,
    /// Reconstructed from an inline frame
    Frame,
    /// Blank stand-in for missing or invalid image data
    Placeholder,
    /// Grabbed from the camera
    Camera,
}

impl ImageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSource::Reused => "reused",
            ImageSource::Frame => "frame",
            ImageSource::Placeholder => "placeholder",
            ImageSource::Camera => "camera",
        }
    }
}

/// An image file under the managed directory.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredImage {
    /// Path exposed to the backend, rooted at the public prefix
    pub public_path: String,
    /// Location on local disk
    pub file_path: PathBuf,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub source: ImageSource,
}

/// Produces and locates image files under the managed image directory.
pub struct ImagePipeline {
    dir: PathBuf,
    public_prefix: String,
    camera: Arc<dyn Camera>,
    capture_timeout: Duration,
    /// One permit; held by a device call until it returns, even past its timeout
    camera_gate: Arc<Semaphore>,
    sequence: AtomicU64,
}

impl ImagePipeline {
    /// Create the pipeline, creating the image directory if needed.
    pub fn new(
        config: &ImagesConfig,
        camera: Arc<dyn Camera>,
        capture_timeout: Duration,
    ) -> Result<Self, ImageError> {
        std::fs::create_dir_all(&config.dir)?;

        Ok(Self {
            dir: config.dir.clone(),
            public_prefix: config.public_prefix.trim_end_matches('/').to_string(),
            camera,
            capture_timeout,
            camera_gate: Arc::new(Semaphore::new(1)),
            sequence: AtomicU64::new(0),
        })
    }

    /// The managed image directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Local file for any externally supplied path, using only its final
    /// component. `None` for empty, `.` or `..` names.
    pub fn local_path(&self, path: &str) -> Option<PathBuf> {
        sanitized_name(path).map(|name| self.dir.join(name))
    }

    /// Reuse a file already present in the image directory.
    pub fn existing(&self, image_path: &str) -> Option<StoredImage> {
        let name = sanitized_name(image_path)?;
        let file_path = self.dir.join(name);
        if !file_path.is_file() {
            return None;
        }

        Some(StoredImage {
            public_path: self.public_path(name),
            file_path,
            width: None,
            height: None,
            source: ImageSource::Reused,
        })
    }

    /// Write an inline frame as an upscaled PNG. An invalid frame produces a
    /// placeholder instead of an error.
    #[instrument(skip(self, frame))]
    pub fn reconstruct(&self, frame: &Value) -> Result<StoredImage, ImageError> {
        let frame = match ImageFrame::from_value(frame) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Invalid frame, writing placeholder");
                return self.placeholder();
            }
        };

        let raster = frame.upscaled(UPSCALE_FACTOR);
        self.write(&raster, "relay", ImageFormat::Png, ImageSource::Frame)
    }

    /// Write a blank placeholder PNG.
    pub fn placeholder(&self) -> Result<StoredImage, ImageError> {
        let raster = RgbImage::new(PLACEHOLDER_SIZE, PLACEHOLDER_SIZE);
        self.write(&raster, "relay", ImageFormat::Png, ImageSource::Placeholder)
    }

    /// Grab one frame from the camera and write it as JPEG.
    ///
    /// The device call runs on the blocking pool and is bounded by the
    /// capture timeout. While an earlier call is still running, including one
    /// that already timed out, the capture fails with `CaptureBusy`.
    #[instrument(skip(self))]
    pub async fn capture(&self) -> Result<StoredImage, ImageError> {
        let permit = self
            .camera_gate
            .clone()
            .try_acquire_owned()
            .map_err(|_| ImageError::CaptureBusy)?;
        let camera = self.camera.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            camera.capture()
        });

        let raster = tokio::time::timeout(self.capture_timeout, task)
            .await
            .map_err(|_| ImageError::CaptureTimeout(self.capture_timeout))?
            .map_err(|e| ImageError::CaptureTask(e.to_string()))??;

        self.write(&raster, "relay_cam", ImageFormat::Jpeg, ImageSource::Camera)
    }

    fn write(
        &self,
        raster: &RgbImage,
        prefix: &str,
        format: ImageFormat,
        source: ImageSource,
    ) -> Result<StoredImage, ImageError> {
        let extension = match format {
            ImageFormat::Jpeg => "jpg",
            _ => "png",
        };
        let name = self.next_file_name(prefix, extension);
        let file_path = self.dir.join(&name);

        raster.save_with_format(&file_path, format)?;

        debug!(
            path = %file_path.display(),
            width = raster.width(),
            height = raster.height(),
            source = source.as_str(),
            "Image written"
        );
        metrics::counter!("relay.images.produced", "source" => source.as_str()).increment(1);

        Ok(StoredImage {
            public_path: self.public_path(&name),
            file_path,
            width: Some(raster.width()),
            height: Some(raster.height()),
            source,
        })
    }

    /// `<prefix>_<YYYYmmdd_HHMMSS_mmm>_<seq>.<ext>`; the sequence keeps names
    /// unique within one millisecond.
    fn next_file_name(&self, prefix: &str, extension: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let ts = Local::now().format("%Y%m%d_%H%M%S_%3f");
        format!("{prefix}_{ts}_{seq:06}.{extension}")
    }

    fn public_path(&self, name: &str) -> String {
        format!("{}/{}", self.public_prefix, name)
    }
}

fn sanitized_name(path: &str) -> Option<&str> {
    let name = path.rsplit(|c: char| c == '/' || c == '\\').next()?;
    match name {
        "" | "." | ".." => None,
        name => Some(name),
    }
}

#[cfg(test)]
pub(crate) fn test_pipeline(dir: &Path, camera: Arc<dyn Camera>) -> ImagePipeline {
    let config = ImagesConfig {
        dir: dir.to_path_buf(),
        ..ImagesConfig::default()
    };
    ImagePipeline::new(&config, camera, Duration::from_secs(2)).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{MockCamera, UnavailableCamera};
    use serde_json::json;

    fn two_pixel_frame() -> Value {
        json!({
            "width": 2,
            "height": 1,
            "pixels": [[{"r": 255, "g": 10, "b": 0}, {"r": 0, "g": 0, "b": 300}]]
        })
    }

    #[test]
    fn test_frame_parse_clamps_channels() {
        let frame = ImageFrame::from_value(&two_pixel_frame()).unwrap();
        assert_eq!(frame.width(), 2);
        assert_eq!(frame.height(), 1);
        assert_eq!(frame.pixels, vec![[255, 10, 0], [0, 0, 255]]);
    }

    #[test]
    fn test_frame_parse_rejects_bad_shapes() {
        let cases = [
            json!({"width": 0, "height": 1, "pixels": [[]]}),
            json!({"width": 2, "height": 2, "pixels": [[{"r": 1}, {"r": 1}]]}),
            json!({"width": 2, "height": 1, "pixels": [[{"r": 1}]]}),
            json!({"width": 1, "height": 1, "pixels": "nope"}),
            json!({"width": 1, "height": 1, "pixels": [[5]]}),
        ];

        for case in cases {
            assert!(
                matches!(ImageFrame::from_value(&case), Err(ImageError::InvalidFrame(_))),
                "accepted {case}"
            );
        }
    }

    #[test]
    fn test_reconstruct_upscales_and_preserves_colors() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path(), Arc::new(UnavailableCamera));

        let stored = pipeline.reconstruct(&two_pixel_frame()).unwrap();
        assert_eq!(stored.source, ImageSource::Frame);
        assert_eq!((stored.width, stored.height), (Some(20), Some(10)));
        assert!(stored.public_path.starts_with("/static/images/relay_"));
        assert!(stored.public_path.ends_with(".png"));

        let decoded = image::open(&stored.file_path).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (20, 10));
        assert_eq!(decoded.get_pixel(0, 0), &Rgb([255, 10, 0]));
        assert_eq!(decoded.get_pixel(9, 9), &Rgb([255, 10, 0]));
        assert_eq!(decoded.get_pixel(10, 0), &Rgb([0, 0, 255]));
    }

    #[test]
    fn test_invalid_frame_yields_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path(), Arc::new(UnavailableCamera));

        let stored = pipeline
            .reconstruct(&json!({"width": -1, "height": 4}))
            .unwrap();
        assert_eq!(stored.source, ImageSource::Placeholder);

        let decoded = image::open(&stored.file_path).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (PLACEHOLDER_SIZE, PLACEHOLDER_SIZE));
        assert_eq!(decoded.get_pixel(0, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_existing_uses_basename_only() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path(), Arc::new(UnavailableCamera));
        std::fs::write(dir.path().join("relay_cam_1.jpg"), b"jpeg").unwrap();

        let stored = pipeline.existing("/static/images/relay_cam_1.jpg").unwrap();
        assert_eq!(stored.public_path, "/static/images/relay_cam_1.jpg");
        assert_eq!(stored.source, ImageSource::Reused);

        assert!(pipeline.existing("../../relay_cam_1.jpg").is_some());
        assert!(pipeline.existing("/etc/passwd").is_none());
        assert!(pipeline.existing("/static/images/..").is_none());
        assert!(pipeline.existing("").is_none());
        assert!(pipeline.existing(" relay_cam_1.jpg").is_none());
        assert!(pipeline.existing("relay_cam_1.jpg ").is_none());
    }

    #[test]
    fn test_file_names_unique_within_same_instant() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path(), Arc::new(UnavailableCamera));

        let a = pipeline.placeholder().unwrap();
        let b = pipeline.placeholder().unwrap();
        assert_ne!(a.file_path, b.file_path);
        assert!(a.file_path.exists() && b.file_path.exists());
    }

    #[tokio::test]
    async fn test_capture_writes_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = MockCamera::new();
        camera
            .expect_capture()
            .times(1)
            .returning(|| Ok(RgbImage::from_pixel(4, 3, Rgb([200, 100, 50]))));
        let pipeline = test_pipeline(dir.path(), Arc::new(camera));

        let stored = pipeline.capture().await.unwrap();
        assert_eq!(stored.source, ImageSource::Camera);
        assert_eq!((stored.width, stored.height), (Some(4), Some(3)));
        assert!(stored.public_path.contains("/relay_cam_"));
        assert!(stored.public_path.ends_with(".jpg"));
        assert_eq!(image::open(&stored.file_path).unwrap().width(), 4);
    }

    #[tokio::test]
    async fn test_capture_failure_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path(), Arc::new(UnavailableCamera));

        assert!(matches!(
            pipeline.capture().await,
            Err(ImageError::Camera(CameraError::Unavailable(_)))
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    struct SlowCamera {
        delay: Duration,
        calls: AtomicU64,
    }

    impl Camera for SlowCamera {
        fn capture(&self) -> Result<RgbImage, CameraError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(RgbImage::from_pixel(2, 2, Rgb([9, 9, 9])))
        }
    }

    #[tokio::test]
    async fn test_timed_out_capture_keeps_camera_busy() {
        let dir = tempfile::tempdir().unwrap();
        let camera = Arc::new(SlowCamera {
            delay: Duration::from_millis(400),
            calls: AtomicU64::new(0),
        });
        let config = ImagesConfig {
            dir: dir.path().to_path_buf(),
            ..ImagesConfig::default()
        };
        let pipeline =
            ImagePipeline::new(&config, camera.clone(), Duration::from_millis(100)).unwrap();

        assert!(matches!(
            pipeline.capture().await,
            Err(ImageError::CaptureTimeout(_))
        ));
        assert!(matches!(
            pipeline.capture().await,
            Err(ImageError::CaptureBusy)
        ));
        assert_eq!(camera.calls.load(Ordering::SeqCst), 1);

        // Once the stuck call returns the device is free again
        tokio::time::sleep(Duration::from_millis(500)).await;
        let pipeline = ImagePipeline {
            capture_timeout: Duration::from_secs(2),
            ..pipeline
        };
        assert!(pipeline.capture().await.is_ok());
        assert_eq!(camera.calls.load(Ordering::SeqCst), 2);
    }
}
