use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dimension of every face feature vector produced by the encoder.
pub const FEATURE_DIM: usize = 128;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VectorError {
    #[error("expected {expected}-dim feature vector, got {actual}")]
    WrongDimension { expected: usize, actual: usize },
    #[error("feature vector component {index} is not finite")]
    NonFinite { index: usize },
}

/// Face feature vector (128-dimensional, one per detected face).
///
/// Construction validates the dimension and rejects NaN/infinite components,
/// so every `FeatureVector` in the system can be compared with every other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct FeatureVector {
    values: Vec<f64>,
}

impl FeatureVector {
    pub fn new(values: Vec<f64>) -> Result<Self, VectorError> {
        if values.len() != FEATURE_DIM {
            return Err(VectorError::WrongDimension {
                expected: FEATURE_DIM,
                actual: values.len(),
            });
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(VectorError::NonFinite { index });
        }
        Ok(Self { values })
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    /// Compute Euclidean distance between two feature vectors.
    pub fn euclidean_distance(&self, other: &FeatureVector) -> f64 {
        euclidean(&self.values, &other.values)
    }
}

impl TryFrom<Vec<f64>> for FeatureVector {
    type Error = VectorError;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<FeatureVector> for Vec<f64> {
    fn from(vector: FeatureVector) -> Self {
        vector.values
    }
}

pub(crate) fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Bounding box for a detected face in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    #[serde(default)]
    pub confidence: f32,
}

/// An enrolled identity with its single reference vector.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityEntry {
    pub identity_id: i64,
    pub display_name: String,
    pub reference_vector: FeatureVector,
}

impl From<(i64, String, FeatureVector)> for IdentityEntry {
    fn from((identity_id, display_name, reference_vector): (i64, String, FeatureVector)) -> Self {
        Self {
            identity_id,
            display_name,
            reference_vector,
        }
    }
}

/// One detected face in one processed frame.
#[derive(Debug, Clone)]
pub struct Observation {
    pub vector: FeatureVector,
    pub captured_at: DateTime<Utc>,
}
