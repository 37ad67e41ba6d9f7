//! Face detection + feature extraction client.
//!
//! The encoder service receives an encoded image and answers with one
//! bounding box and one 128-dim feature vector per detected face.

use rollcall_core::{BoundingBox, FeatureVector, VectorError};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("encoder request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("encoder returned HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("encoder produced an invalid feature vector: {0}")]
    InvalidVector(#[from] VectorError),
    #[error("image could not be decoded: {0}")]
    Image(#[from] image::ImageError),
}

impl EncoderError {
    /// A malformed vector means the encoder is incompatible with the
    /// roster; continuing would compare vectors of different spaces.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EncoderError::InvalidVector(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFace {
    pub bbox: Option<BoundingBox>,
    pub vector: FeatureVector,
}

/// Detects faces in an encoded image and extracts their feature vectors.
pub trait Encoder: Send + Sync {
    /// Zero faces is a normal result, not an error.
    fn detect_and_encode(
        &self,
        image: &[u8],
    ) -> impl Future<Output = Result<Vec<EncodedFace>, EncoderError>> + Send;
}

#[derive(Deserialize)]
struct EncodeResponse {
    #[serde(default)]
    faces: Vec<WireFace>,
}

#[derive(Deserialize)]
struct WireFace {
    #[serde(default)]
    bbox: Option<BoundingBox>,
    vector: Vec<f64>,
}

/// Encoder reached over HTTP: the image is POSTed as the raw request body.
#[derive(Debug, Clone)]
pub struct HttpEncoder {
    client: reqwest::Client,
    url: String,
}

impl HttpEncoder {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, EncoderError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("rollcalld/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Encoder for HttpEncoder {
    async fn detect_and_encode(&self, image: &[u8]) -> Result<Vec<EncodedFace>, EncoderError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EncoderError::Status(status));
        }
        let body: EncodeResponse = response.json().await?;

        let faces = body
            .faces
            .into_iter()
            .map(|face| {
                Ok(EncodedFace {
                    bbox: face.bbox,
                    vector: FeatureVector::new(face.vector)?,
                })
            })
            .collect::<Result<Vec<_>, EncoderError>>()?;
        tracing::debug!(faces = faces.len(), bytes = image.len(), "frame encoded");
        Ok(faces)
    }
}
