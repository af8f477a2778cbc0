//! Single-frame camera capture.
//!
//! Capture goes through a one-shot GStreamer V4L2 pipeline when the crate is
//! built with the `camera` feature. Without it the relay uses
//! [`UnavailableCamera`] and every capture falls back to a placeholder.

use crate::config::CameraConfig;
use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Errors that can occur during a capture.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("Camera unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to open camera {device}: {message}")]
    Open { device: String, message: String },

    #[error("Failed to read frame: {0}")]
    Read(String),

    #[error("No frame within {0:?}")]
    Timeout(Duration),
}

/// A capture device that can grab one RGB frame.
///
/// Implementations block; callers run them on the blocking pool.
#[cfg_attr(test, mockall::automock)]
pub trait Camera: Send + Sync {
    fn capture(&self) -> Result<RgbImage, CameraError>;
}

/// Resolve an environment-style device identifier to a device index.
///
/// "/dev/video2" and "2" both resolve to 2; anything unparseable is 0.
pub fn device_index(device: &str) -> u32 {
    let device = device.trim();
    device
        .strip_prefix("/dev/video")
        .unwrap_or(device)
        .parse()
        .unwrap_or(0)
}

/// Camera used when no capture backend is compiled in.
#[derive(Debug, Default)]
pub struct UnavailableCamera;

impl Camera for UnavailableCamera {
    fn capture(&self) -> Result<RgbImage, CameraError> {
        Err(CameraError::Unavailable(
            "built without the `camera` feature".to_string(),
        ))
    }
}

/// Open the configured camera, degrading to [`UnavailableCamera`].
pub fn open_camera(config: &CameraConfig) -> Arc<dyn Camera> {
    let index = device_index(&config.device);

    match backend(index, config.timeout()) {
        Ok(camera) => {
            info!(device = %config.device, index, "Camera capture enabled");
            camera
        }
        Err(e) => {
            warn!(device = %config.device, error = %e, "Using placeholder images");
            Arc::new(UnavailableCamera)
        }
    }
}

#[cfg(feature = "camera")]
fn backend(index: u32, timeout: Duration) -> Result<Arc<dyn Camera>, CameraError> {
    Ok(Arc::new(v4l2::V4l2Camera::new(index, timeout)?))
}

#[cfg(not(feature = "camera"))]
fn backend(_index: u32, _timeout: Duration) -> Result<Arc<dyn Camera>, CameraError> {
    Err(CameraError::Unavailable(
        "built without the `camera` feature".to_string(),
    ))
}

#[cfg(feature = "camera")]
mod v4l2 {
    use super::{Camera, CameraError};
    use gstreamer as gst;
    use gstreamer::prelude::*;
    use gstreamer_app as gst_app;
    use gstreamer_video as gst_video;
    use image::RgbImage;
    use std::time::Duration;
    use tracing::debug;

    /// One-shot V4L2 capture. The pipeline is built per capture and torn down
    /// right after the first sample so the device is never held between grabs.
    pub struct V4l2Camera {
        device_path: String,
        timeout: Duration,
    }

    impl V4l2Camera {
        pub fn new(index: u32, timeout: Duration) -> Result<Self, CameraError> {
            gst::init().map_err(|e| CameraError::Unavailable(e.to_string()))?;
            Ok(Self {
                device_path: format!("/dev/video{index}"),
                timeout,
            })
        }

        fn pipeline_string(&self) -> String {
            format!(
                "v4l2src device={device} num-buffers=1 \
                 ! videoconvert ! video/x-raw,format=RGB \
                 ! appsink name=sink sync=false max-buffers=1 drop=true",
                device = self.device_path,
            )
        }

        fn open_error(&self, message: impl ToString) -> CameraError {
            CameraError::Open {
                device: self.device_path.clone(),
                message: message.to_string(),
            }
        }
    }

    impl Camera for V4l2Camera {
        fn capture(&self) -> Result<RgbImage, CameraError> {
            let pipeline_str = self.pipeline_string();
            debug!(pipeline = %pipeline_str, "Creating capture pipeline");

            let pipeline = gst::parse::launch(&pipeline_str)
                .map_err(|e| self.open_error(e))?
                .downcast::<gst::Pipeline>()
                .map_err(|_| self.open_error("not a pipeline"))?;

            let appsink = pipeline
                .by_name("sink")
                .ok_or_else(|| self.open_error("appsink missing"))?
                .downcast::<gst_app::AppSink>()
                .map_err(|_| self.open_error("sink is not an AppSink"))?;

            if let Err(e) = pipeline.set_state(gst::State::Playing) {
                let _ = pipeline.set_state(gst::State::Null);
                return Err(self.open_error(e));
            }

            let sample = appsink.try_pull_sample(gst::ClockTime::from_mseconds(
                self.timeout.as_millis() as u64,
            ));
            let _ = pipeline.set_state(gst::State::Null);

            let sample = sample.ok_or(CameraError::Timeout(self.timeout))?;
            sample_to_rgb(&sample)
        }
    }

    fn sample_to_rgb(sample: &gst::Sample) -> Result<RgbImage, CameraError> {
        let caps = sample
            .caps()
            .ok_or_else(|| CameraError::Read("sample has no caps".to_string()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| CameraError::Read(e.to_string()))?;
        let buffer = sample
            .buffer()
            .ok_or_else(|| CameraError::Read("sample has no buffer".to_string()))?;
        let map = buffer
            .map_readable()
            .map_err(|e| CameraError::Read(e.to_string()))?;

        let (width, height) = (info.width(), info.height());
        let stride = info.stride()[0] as usize;
        let row_bytes = width as usize * 3;
        let data = map.as_slice();

        // Rows may be padded to the stride
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            let line = data
                .get(start..start + row_bytes)
                .ok_or_else(|| CameraError::Read("short frame buffer".to_string()))?;
            pixels.extend_from_slice(line);
        }

        RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| CameraError::Read("frame size mismatch".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_index() {
        assert_eq!(device_index("/dev/video0"), 0);
        assert_eq!(device_index("/dev/video3"), 3);
        assert_eq!(device_index("2"), 2);
        assert_eq!(device_index("usb-cam"), 0);
        assert_eq!(device_index(""), 0);
    }

    #[test]
    fn test_unavailable_camera() {
        assert!(matches!(
            UnavailableCamera.capture(),
            Err(CameraError::Unavailable(_))
        ));
    }
}
