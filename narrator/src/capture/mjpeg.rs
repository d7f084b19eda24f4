use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures_util::StreamExt;
use reqwest::Client;
use scene_narrator_common::frame::Frame;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{CaptureError, FrameSource};

const DEFAULT_BOUNDARY: &str = "frame";
const HEADER_END: &[u8] = b"\r\n\r\n";
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(10);

/// Newest JPEG seen on the stream, tagged with a sequence number so the
/// loop can tell a fresh frame from one it already processed.
type Latest = Option<(u64, Bytes)>;

/// Parse state for the MJPEG multipart stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Looking for the boundary marker `--frame\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental `multipart/x-mixed-replace` splitter.
pub struct MjpegParser {
    buffer: BytesMut,
    state: ParseState,
    jpeg_start: usize,
    /// Delimiter line, `--{boundary}\r\n`.
    marker: Vec<u8>,
}

impl Default for MjpegParser {
    fn default() -> Self {
        Self::new(DEFAULT_BOUNDARY)
    }
}

impl MjpegParser {
    pub fn new(boundary: &str) -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            jpeg_start: 0,
            marker: format!("--{boundary}\r\n").into_bytes(),
        }
    }

    /// Feed one chunk and return every JPEG completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    let marker_len = self.marker.len();
                    if let Some(pos) = find_subsequence(&self.buffer, &self.marker) {
                        let _ = self.buffer.split_to(pos + marker_len);
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep the tail in case the boundary spans chunks.
                        if self.buffer.len() > marker_len {
                            let _ = self.buffer.split_to(self.buffer.len() - marker_len);
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.jpeg_start = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingJpeg => {
                    let marker_len = self.marker.len();
                    let Some(pos) =
                        find_subsequence(&self.buffer[self.jpeg_start..], &self.marker)
                    else {
                        // Resume the search near the end next time.
                        self.jpeg_start = self.buffer.len().saturating_sub(marker_len);
                        break;
                    };

                    let jpeg_end = self.jpeg_start + pos;
                    // Strip the \r\n that precedes the boundary.
                    let end = if self.buffer[..jpeg_end].ends_with(b"\r\n") {
                        jpeg_end - 2
                    } else {
                        jpeg_end
                    };

                    let mut part = self.buffer.split_to(jpeg_end + marker_len);
                    part.truncate(end);
                    if !part.is_empty() {
                        frames.push(part.freeze());
                    }
                    self.state = ParseState::SeekingHeaderEnd;
                }
            }
        }

        frames
    }
}

/// Follows an MJPEG stream in a background task and hands the loop only the
/// newest frame.
pub struct MjpegCamera {
    url: String,
    latest: Option<watch::Receiver<Latest>>,
    last_seq: Option<u64>,
    task: Option<JoinHandle<()>>,
}

impl MjpegCamera {
    pub fn new(url: String) -> Self {
        Self {
            url,
            latest: None,
            last_seq: None,
            task: None,
        }
    }
}

impl Drop for MjpegCamera {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl FrameSource for MjpegCamera {
    fn name(&self) -> &'static str {
        "mjpeg"
    }

    async fn open(&mut self) -> Result<(), CaptureError> {
        let (tx, mut rx) = watch::channel(None);
        let url = self.url.clone();
        self.task = Some(tokio::spawn(async move {
            run_stream(&url, tx).await;
        }));

        let first = tokio::time::timeout(FIRST_FRAME_TIMEOUT, rx.wait_for(Option::is_some))
            .await
            .map(|r| r.is_ok());
        let failure = match first {
            Ok(true) => None,
            Ok(false) => Some("stream task ended".to_string()),
            Err(_) => Some(format!("no frame within {FIRST_FRAME_TIMEOUT:?}")),
        };

        if let Some(reason) = failure {
            if let Some(task) = self.task.take() {
                task.abort();
            }
            return Err(CaptureError::Unavailable(format!("{}: {reason}", self.url)));
        }

        info!(url = self.url, "MJPEG stream delivering frames");
        self.latest = Some(rx);
        Ok(())
    }

    async fn grab(&mut self) -> Option<Frame> {
        let (seq, jpeg) = self.latest.as_ref()?.borrow().clone()?;
        if self.last_seq == Some(seq) {
            return None;
        }
        self.last_seq = Some(seq);

        match Frame::from_jpeg(&jpeg, Utc::now().timestamp_millis()) {
            Ok(frame) => Some(frame),
            Err(e) => {
                debug!(error = %e, seq, "discarding undecodable MJPEG frame");
                None
            }
        }
    }
}

/// Consume the stream forever, reconnecting with exponential backoff.
/// Returns once every receiver has been dropped.
async fn run_stream(url: &str, tx: watch::Sender<Latest>) {
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(30);
    let mut seq: u64 = 0;

    loop {
        info!(url, "connecting to MJPEG stream");
        match consume_stream(url, &tx, &mut seq).await {
            Ok(()) => {
                info!("stream ended cleanly, reconnecting");
                backoff = Duration::from_secs(2);
            }
            Err(e) => {
                error!(error = %e, "stream error, reconnecting in {:?}", backoff);
            }
        }
        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

async fn consume_stream(
    url: &str,
    tx: &watch::Sender<Latest>,
    seq: &mut u64,
) -> Result<(), CaptureError> {
    let client = Client::builder()
        .no_proxy()
        .connect_timeout(Duration::from_secs(10))
        .build()?;
    let response = client.get(url).send().await?;

    if !response.status().is_success() {
        return Err(CaptureError::HttpStatus(response.status().as_u16()));
    }
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let boundary = boundary_from_content_type(content_type).unwrap_or_else(|| {
        warn!(
            content_type,
            "no multipart boundary advertised, assuming \"{DEFAULT_BOUNDARY}\""
        );
        DEFAULT_BOUNDARY.to_string()
    });
    info!(status = %response.status(), boundary = %boundary, "connected to MJPEG stream");

    let mut byte_stream = response.bytes_stream();
    let mut parser = MjpegParser::new(&boundary);

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk?;
        for jpeg in parser.push(&chunk) {
            *seq += 1;
            if tx.send(Some((*seq, jpeg))).is_err() {
                warn!("frame receiver dropped, stopping MJPEG stream");
                return Ok(());
            }
        }
    }

    Ok(())
}

/// The `boundary` parameter of a `multipart/*` content type, without quotes
/// or a leading `--`.
fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"'))
        .map(|value| value.strip_prefix("--").unwrap_or(value).to_string())
        .filter(|value| !value.is_empty())
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
