use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use scene_narrator_common::frame::Frame;
use std::time::Duration;
use tracing::{info, warn};

use super::{CaptureError, FrameSource};

/// HTTP camera that serves one JPEG per GET request.
pub struct SnapshotCamera {
    client: Client,
    url: String,
}

impl SnapshotCamera {
    pub fn new(url: String) -> Result<Self, CaptureError> {
        // Cameras live on the local network; never route them through a proxy.
        let client = Client::builder()
            .no_proxy()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, url })
    }

    async fn fetch(&self) -> Result<Frame, CaptureError> {
        let resp = self.client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            return Err(CaptureError::HttpStatus(resp.status().as_u16()));
        }
        let jpeg = resp.bytes().await?;
        Ok(Frame::from_jpeg(&jpeg, Utc::now().timestamp_millis())?)
    }
}

#[async_trait]
impl FrameSource for SnapshotCamera {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    async fn open(&mut self) -> Result<(), CaptureError> {
        let frame = self
            .fetch()
            .await
            .map_err(|e| CaptureError::Unavailable(format!("{}: {e}", self.url)))?;
        info!(
            url = self.url,
            width = frame.width(),
            height = frame.height(),
            "snapshot camera reachable"
        );
        Ok(())
    }

    async fn grab(&mut self) -> Option<Frame> {
        match self.fetch().await {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(error = %e, url = self.url, "failed to fetch camera frame");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `body` with `status` to every connection on a local port.
    async fn serve(status: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let head = format!(
                        "HTTP/1.1 {status}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}/frame")
    }

    #[tokio::test]
    async fn fetches_and_decodes_frame() {
        let jpeg = Frame::filled(8, 6, [10, 200, 30], 0).to_jpeg(90).unwrap();
        let url = serve("200 OK", jpeg).await;
        let mut camera = SnapshotCamera::new(url).unwrap();

        camera.open().await.unwrap();
        let frame = camera.grab().await.unwrap();
        assert_eq!(frame.dimensions(), (8, 6));
    }

    #[tokio::test]
    async fn error_status_is_unavailable() {
        let url = serve("503 Service Unavailable", Vec::new()).await;
        let mut camera = SnapshotCamera::new(url).unwrap();

        assert!(matches!(
            camera.open().await,
            Err(CaptureError::Unavailable(_))
        ));
        assert!(camera.grab().await.is_none());
    }

    #[tokio::test]
    async fn silent_camera_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and never answer.
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let mut camera = SnapshotCamera::new(format!("http://{addr}/frame")).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(20), camera.open()).await;
        assert!(matches!(result, Ok(Err(CaptureError::Unavailable(_)))));
    }
}
