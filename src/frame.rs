//! Camera frames and the frame source contract.
//!
//! - `Frame`: one captured image plus its capture timestamp. Not `Clone`; a frame is
//!   handed to inference exactly once and dropped at the end of its cycle.
//! - `FrameSource`: the camera collaborator. Failures surface as
//!   `SentinelError::SourceUnavailable` rather than blocking indefinitely.

use chrono::{DateTime, Utc};

use crate::error::SentinelError;

/// A captured camera frame. Pixel data is packed RGB24.
///
/// Deliberately not `Clone`: memory stays bounded at one frame per cycle.
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
    /// Monotonic per-source sequence number.
    pub sequence: u64,
}

impl Frame {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        captured_at: DateTime<Utc>,
        sequence: u64,
    ) -> Self {
        Self {
            data,
            width,
            height,
            captured_at,
            sequence,
        }
    }

    /// Read-only pixel access for inference adapters.
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("captured_at", &self.captured_at)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Camera collaborator.
///
/// `next_frame` may block up to a bounded, implementation-defined timeout. Camera faults
/// must be reported as `SourceUnavailable`; the capture loop backs off and retries.
pub trait FrameSource: Send {
    /// Source identifier for logs.
    fn name(&self) -> &str;

    /// Capture the next frame.
    fn next_frame(&mut self) -> Result<Frame, SentinelError>;

    /// Whether the source has recently produced frames.
    fn is_healthy(&self) -> bool {
        true
    }

    /// Frames captured since start.
    fn frames_captured(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_does_not_dump_pixels() {
        let frame = Frame::new(vec![7u8; 12], 2, 2, Utc::now(), 1);
        let rendered = format!("{:?}", frame);
        assert!(rendered.contains("bytes: 12"));
        assert!(!rendered.contains("[7, 7"));
    }

    #[test]
    fn exposes_pixels_read_only() {
        let frame = Frame::new(vec![1, 2, 3], 1, 1, Utc::now(), 9);
        assert_eq!(frame.pixels(), &[1, 2, 3]);
        assert_eq!(frame.byte_len(), 3);
        assert_eq!(frame.sequence, 9);
    }
}
