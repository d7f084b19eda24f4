use async_trait::async_trait;
use chrono::Utc;
use scene_narrator_common::frame::Frame;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{CaptureError, FrameSource};

/// Local camera addressed by index. Each grab runs `ffmpeg` once and reads a
/// single MJPEG frame from its stdout.
pub struct DeviceCamera {
    index: u32,
    program: String,
}

impl DeviceCamera {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            program: "ffmpeg".into(),
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(input_args(self.index));
        args.extend(
            [
                "-frames:v", "1",
                "-f", "image2pipe",
                "-vcodec", "mjpeg",
                "pipe:1",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args
    }

    async fn capture_jpeg(&self) -> Result<Vec<u8>, CaptureError> {
        let output = Command::new(&self.program)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| CaptureError::Spawn(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CaptureError::Unavailable(format!(
                "camera {} ({}): {}",
                self.index,
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[cfg(target_os = "macos")]
fn input_args(index: u32) -> Vec<String> {
    vec!["-f".into(), "avfoundation".into(), "-i".into(), index.to_string()]
}

#[cfg(not(target_os = "macos"))]
fn input_args(index: u32) -> Vec<String> {
    vec!["-f".into(), "v4l2".into(), "-i".into(), format!("/dev/video{index}")]
}

#[async_trait]
impl FrameSource for DeviceCamera {
    fn name(&self) -> &'static str {
        "device"
    }

    async fn open(&mut self) -> Result<(), CaptureError> {
        let jpeg = self.capture_jpeg().await?;
        let frame = Frame::from_jpeg(&jpeg, Utc::now().timestamp_millis())?;
        info!(
            index = self.index,
            width = frame.width(),
            height = frame.height(),
            "camera opened"
        );
        Ok(())
    }

    async fn grab(&mut self) -> Option<Frame> {
        let jpeg = match self.capture_jpeg().await {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, index = self.index, "failed to capture frame");
                return None;
            }
        };
        match Frame::from_jpeg(&jpeg, Utc::now().timestamp_millis()) {
            Ok(frame) => Some(frame),
            Err(e) => {
                debug!(error = %e, bytes = jpeg.len(), "discarding undecodable frame");
                None
            }
        }
    }
}
