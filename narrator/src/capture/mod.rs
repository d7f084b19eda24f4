pub mod device;
pub mod mjpeg;
pub mod snapshot;

use async_trait::async_trait;
use scene_narrator_common::config::{CameraConfig, CameraSource};
use scene_narrator_common::frame::{Frame, FrameError};

use self::device::DeviceCamera;
use self::mjpeg::MjpegCamera;
use self::snapshot::SnapshotCamera;

/// A camera the capture loop can pull frames from.
#[async_trait]
pub trait FrameSource: Send {
    fn name(&self) -> &'static str;

    /// Check once, before the loop starts, that the camera is reachable.
    async fn open(&mut self) -> Result<(), CaptureError>;

    /// Next frame, or `None` if nothing usable was captured this time.
    async fn grab(&mut self) -> Option<Frame>;
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("unable to access the camera: {0}")]
    Unavailable(String),
    #[error("failed to run ffmpeg: {0}")]
    Spawn(String),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("bad frame: {0}")]
    Frame(#[from] FrameError),
}

/// Build the capture source selected in the config. Validation has already
/// ensured `url` is present for the HTTP sources.
pub fn build_source(config: &CameraConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
    let url = config.url.clone().unwrap_or_default();
    let source: Box<dyn FrameSource> = match config.source {
        CameraSource::Device => Box::new(DeviceCamera::new(config.index)),
        CameraSource::Snapshot => Box::new(SnapshotCamera::new(url)?),
        CameraSource::Mjpeg => Box::new(MjpegCamera::new(url)),
    };
    Ok(source)
}
