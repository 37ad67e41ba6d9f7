//! rollcall-capture: Frame acquisition from network cameras.
//!
//! Provides single-shot HTTP snapshot capture, continuous MJPEG stream
//! capture, and the sampler that throttles stream frames before encoding.

pub mod frame;
pub mod sampler;
pub mod source;

pub use frame::{Frame, JpegScanner};
pub use sampler::FrameSampler;
pub use source::{CameraSource, CaptureError, FrameSource, MjpegStreamSource, SnapshotSource};
