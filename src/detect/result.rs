use serde::{Deserialize, Serialize};

/// Classes the device alerts on. Everything else the model sees is dropped by the adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetClass {
    Human,
    Cat,
    Dog,
}

impl TargetClass {
    pub const ALL: [TargetClass; 3] = [TargetClass::Human, TargetClass::Cat, TargetClass::Dog];

    /// Maps a COCO class index (as emitted by YOLO-family models) to a target class.
    pub fn from_coco_id(id: usize) -> Option<Self> {
        match id {
            0 => Some(TargetClass::Human),
            15 => Some(TargetClass::Cat),
            16 => Some(TargetClass::Dog),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TargetClass::Human => "human",
            TargetClass::Cat => "cat",
            TargetClass::Dog => "dog",
        }
    }

    pub fn is_animal(self) -> bool {
        matches!(self, TargetClass::Cat | TargetClass::Dog)
    }
}

/// Axis-aligned box in normalized 0..1 image coordinates (top-left origin).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    /// Intersection over union; 0.0 for disjoint or degenerate boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.w).min(other.x + other.w);
        let bottom = (self.y + self.h).min(other.y + other.h);
        let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// One detected object in one frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: TargetClass,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coco_mapping_keeps_only_targets() {
        assert_eq!(TargetClass::from_coco_id(0), Some(TargetClass::Human));
        assert_eq!(TargetClass::from_coco_id(15), Some(TargetClass::Cat));
        assert_eq!(TargetClass::from_coco_id(16), Some(TargetClass::Dog));
        assert_eq!(TargetClass::from_coco_id(2), None);
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BoundingBox::new(0.1, 0.1, 0.2, 0.2);
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 0.1, 0.1);
        let b = BoundingBox::new(0.5, 0.5, 0.1, 0.1);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 0.2, 0.2);
        let b = BoundingBox::new(0.1, 0.0, 0.2, 0.2);
        // intersection 0.02, union 0.06
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-5);
    }
}
