use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::InferenceAdapter;
use crate::detect::result::{BoundingBox, Detection, TargetClass};
use crate::frame::Frame;

/// Deterministic stand-in for a model. Derives detections from a hash of the pixels, so the
/// same frame always yields the same detections and a static scene yields a stable count.
#[derive(Default)]
pub struct StubAdapter;

impl StubAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl InferenceAdapter for StubAdapter {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let digest: [u8; 32] = Sha256::digest(frame.pixels()).into();

        // Roughly half of all scenes are empty.
        if digest[0] < 128 {
            return Ok(Vec::new());
        }

        let mut detections = Vec::new();
        for (slot, class) in TargetClass::ALL.iter().enumerate() {
            let count = digest[1 + slot] % 3;
            for i in 0..count {
                let seed = digest[4 + slot * 4 + i as usize];
                detections.push(Detection {
                    class: *class,
                    confidence: 0.5 + (seed as f32 / 255.0) * 0.5,
                    bbox: BoundingBox::new(
                        0.3 * i as f32 + 0.05,
                        0.3 * slot as f32 + 0.05,
                        0.2,
                        0.2,
                    ),
                });
            }
        }
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn frame(fill: u8) -> Frame {
        Frame::new(vec![fill; 48], 4, 4, Utc::now(), 1)
    }

    #[test]
    fn stub_adapter_is_deterministic() -> Result<()> {
        let mut adapter = StubAdapter::new();
        for fill in 0..32u8 {
            let first = adapter.infer(&frame(fill))?;
            let second = adapter.infer(&frame(fill))?;
            assert_eq!(first, second);
        }
        Ok(())
    }

    #[test]
    fn stub_adapter_boxes_do_not_overlap() -> Result<()> {
        let mut adapter = StubAdapter::new();
        for fill in 0..64u8 {
            let detections = adapter.infer(&frame(fill))?;
            for (i, a) in detections.iter().enumerate() {
                assert!((0.5..=1.0).contains(&a.confidence));
                for b in detections.iter().skip(i + 1) {
                    assert_eq!(a.bbox.iou(&b.bbox), 0.0);
                }
            }
        }
        Ok(())
    }
}
