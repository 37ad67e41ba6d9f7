//! Network camera sources: HTTP snapshot and multipart MJPEG stream.

use crate::frame::{Frame, JpegScanner};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Interval, MissedTickBehavior};

const USER_AGENT: &str = concat!("rollcall/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("frame request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("camera returned HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("no frame data within {0:?}")]
    Timeout(Duration),
    #[error("camera stream ended")]
    StreamEnded,
    #[error("camera returned an empty frame")]
    EmptyFrame,
}

/// Anything that yields encoded camera frames.
#[allow(async_fn_in_trait)]
pub trait FrameSource {
    async fn next_frame(&mut self) -> Result<Frame, CaptureError>;
}

fn build_client(timeout: Option<Duration>) -> Result<reqwest::Client, CaptureError> {
    let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?)
}

/// One HTTP GET per frame, paced to one request per poll period.
pub struct SnapshotSource {
    client: reqwest::Client,
    url: String,
    poll: Duration,
    interval: Option<Interval>,
    sequence: u64,
}

impl SnapshotSource {
    /// `timeout` bounds each request, including the body download.
    pub fn new(url: &str, poll: Duration, timeout: Duration) -> Result<Self, CaptureError> {
        Ok(Self {
            client: build_client(Some(timeout))?,
            url: url.to_string(),
            poll,
            interval: None,
            sequence: 0,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch one frame immediately, without pacing.
    pub async fn capture(&mut self) -> Result<Frame, CaptureError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CaptureError::Status(status));
        }
        let body = response.bytes().await?;
        if body.is_empty() {
            return Err(CaptureError::EmptyFrame);
        }
        self.sequence += 1;
        tracing::trace!(seq = self.sequence, bytes = body.len(), "snapshot captured");
        Ok(Frame::new(body.to_vec(), self.sequence))
    }
}

impl FrameSource for SnapshotSource {
    async fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        let poll = self.poll;
        let interval = self.interval.get_or_insert_with(|| {
            let mut interval = tokio::time::interval(poll);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        interval.tick().await;
        self.capture().await
    }
}

/// Long-lived multipart MJPEG connection.
///
/// Frames are yielded as fast as the camera sends them; pair with a
/// [`FrameSampler`](crate::FrameSampler) to throttle. Any read error drops
/// the connection and the next call reconnects.
pub struct MjpegStreamSource {
    client: reqwest::Client,
    url: String,
    read_timeout: Duration,
    response: Option<reqwest::Response>,
    scanner: JpegScanner,
    sequence: u64,
}

impl MjpegStreamSource {
    /// `read_timeout` bounds the connect and each chunk read; the stream
    /// itself may stay open indefinitely.
    pub fn new(url: &str, read_timeout: Duration) -> Result<Self, CaptureError> {
        Ok(Self {
            client: build_client(None)?,
            url: url.to_string(),
            read_timeout,
            response: None,
            scanner: JpegScanner::new(),
            sequence: 0,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.response.is_some()
    }

    async fn connect(&self) -> Result<reqwest::Response, CaptureError> {
        let response = tokio::time::timeout(self.read_timeout, self.client.get(&self.url).send())
            .await
            .map_err(|_| CaptureError::Timeout(self.read_timeout))??;
        let status = response.status();
        if !status.is_success() {
            return Err(CaptureError::Status(status));
        }
        tracing::info!(url = %self.url, "camera stream opened");
        Ok(response)
    }

    fn disconnect(&mut self) {
        self.response = None;
        self.scanner.clear();
    }
}

impl FrameSource for MjpegStreamSource {
    async fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        loop {
            if let Some(data) = self.scanner.next_image() {
                self.sequence += 1;
                return Ok(Frame::new(data, self.sequence));
            }

            if self.response.is_none() {
                self.response = Some(self.connect().await?);
            }
            let Some(response) = self.response.as_mut() else {
                continue;
            };

            let read = tokio::time::timeout(self.read_timeout, response.chunk()).await;
            let chunk = match read {
                Ok(Ok(Some(chunk))) => chunk,
                Ok(Ok(None)) => {
                    self.disconnect();
                    return Err(CaptureError::StreamEnded);
                }
                Ok(Err(e)) => {
                    self.disconnect();
                    return Err(e.into());
                }
                Err(_) => {
                    self.disconnect();
                    return Err(CaptureError::Timeout(self.read_timeout));
                }
            };
            self.scanner.push(&chunk);
        }
    }
}

/// Runtime-selected camera source.
pub enum CameraSource {
    Snapshot(SnapshotSource),
    Stream(MjpegStreamSource),
}

impl CameraSource {
    pub fn url(&self) -> &str {
        match self {
            CameraSource::Snapshot(s) => s.url(),
            CameraSource::Stream(s) => s.url(),
        }
    }
}

impl FrameSource for CameraSource {
    async fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        match self {
            CameraSource::Snapshot(s) => s.next_frame().await,
            CameraSource::Stream(s) => s.next_frame().await,
        }
    }
}
