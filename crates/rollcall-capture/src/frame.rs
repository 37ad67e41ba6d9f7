//! Frame type and JPEG framing for multipart MJPEG streams.

use chrono::{DateTime, Utc};

/// Start-of-image marker.
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
/// End-of-image marker.
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Upper bound on one buffered image; larger partial images are dropped.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// A captured camera frame, still encoded (JPEG for the shipped sources).
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    /// Wall-clock capture time, used for cooldown and audit.
    pub captured_at: DateTime<Utc>,
    /// Monotonic capture time, used for sampling.
    pub timestamp: std::time::Instant,
    pub sequence: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, sequence: u64) -> Self {
        Self {
            data,
            captured_at: Utc::now(),
            timestamp: std::time::Instant::now(),
            sequence,
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("bytes", &self.data.len())
            .field("captured_at", &self.captured_at)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Splits complete JPEG images out of an MJPEG byte stream.
///
/// Multipart boundaries and part headers are skipped implicitly: everything
/// before an SOI marker is discarded, and an image ends at the first EOI.
#[derive(Debug, Default)]
pub struct JpegScanner {
    buf: Vec<u8>,
}

impl JpegScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes currently held waiting for a complete image.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Pop the next complete image, if one is buffered.
    pub fn next_image(&mut self) -> Option<Vec<u8>> {
        let Some(start) = find_marker(&self.buf, JPEG_SOI, 0) else {
            // Keep a trailing 0xFF: it may be the first half of a split SOI.
            let keep = usize::from(self.buf.last() == Some(&0xFF));
            let discard = self.buf.len() - keep;
            self.buf.drain(..discard);
            return None;
        };
        if start > 0 {
            self.buf.drain(..start);
        }

        match find_marker(&self.buf, JPEG_EOI, JPEG_SOI.len()) {
            Some(end) => Some(self.buf.drain(..end + JPEG_EOI.len()).collect()),
            None => {
                if self.buf.len() > MAX_FRAME_BYTES {
                    tracing::warn!(
                        buffered = self.buf.len(),
                        "dropping oversized partial frame"
                    );
                    self.buf.clear();
                }
                None
            }
        }
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == marker.as_slice())
        .map(|pos| pos + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut image = JPEG_SOI.to_vec();
        image.extend_from_slice(body);
        image.extend_from_slice(&JPEG_EOI);
        image
    }

    #[test]
    fn test_extracts_image_between_multipart_headers() {
        let mut scanner = JpegScanner::new();
        let image = jpeg(&[1, 2, 3]);
        scanner.push(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
        scanner.push(&image);
        scanner.push(b"\r\n");

        assert_eq!(scanner.next_image(), Some(image));
        assert_eq!(scanner.next_image(), None);
        assert_eq!(scanner.buffered(), 0);
    }

    #[test]
    fn test_image_split_across_chunks() {
        let mut scanner = JpegScanner::new();
        let image = jpeg(&[9, 8, 7, 6]);
        let (head, tail) = image.split_at(3);

        scanner.push(head);
        assert_eq!(scanner.next_image(), None);
        scanner.push(tail);
        assert_eq!(scanner.next_image(), Some(image));
    }

    #[test]
    fn test_split_soi_marker_is_kept() {
        let mut scanner = JpegScanner::new();
        scanner.push(b"junk\xFF");
        assert_eq!(scanner.next_image(), None);
        assert_eq!(scanner.buffered(), 1);
        scanner.push(&[0xD8, 5, 0xFF, 0xD9]);
        assert_eq!(scanner.next_image(), Some(vec![0xFF, 0xD8, 5, 0xFF, 0xD9]));
    }

    #[test]
    fn test_back_to_back_images() {
        let mut scanner = JpegScanner::new();
        let first = jpeg(&[1]);
        let second = jpeg(&[2, 2]);
        scanner.push(&first);
        scanner.push(&second);
        assert_eq!(scanner.next_image(), Some(first));
        assert_eq!(scanner.next_image(), Some(second));
    }

    #[test]
    fn test_oversized_partial_frame_is_dropped() {
        let mut scanner = JpegScanner::new();
        scanner.push(&JPEG_SOI);
        scanner.push(&vec![0u8; MAX_FRAME_BYTES + 1]);
        assert_eq!(scanner.next_image(), None);
        assert_eq!(scanner.buffered(), 0);
    }
}
