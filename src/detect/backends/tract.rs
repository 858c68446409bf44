#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::InferenceAdapter;
use crate::detect::result::{BoundingBox, Detection, TargetClass};
use crate::frame::Frame;

const COCO_CLASSES: usize = 80;

/// ONNX YOLO adapter (YOLOv5 `[1, N, 85]` or YOLOv8/11 `[1, 84, N]` output layouts).
///
/// The model input size must match the camera frame size; frames are not resized here.
pub struct TractAdapter {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
    confidence_threshold: f32,
}

impl TractAdapter {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
            confidence_threshold: 0.5,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        if frame.width != self.width || frame.height != self.height {
            return Err(anyhow!(
                "frame size {}x{} does not match model input {}x{}",
                frame.width,
                frame.height,
                self.width,
                self.height
            ));
        }

        let width = self.width as usize;
        let expected_len = width
            .checked_mul(self.height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        let pixels = frame.pixels();
        if pixels.len() != expected_len {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                expected_len,
                pixels.len()
            ));
        }

        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, width),
            |(_, channel, y, x)| pixels[(y * width + x) * 3 + channel] as f32 / 255.0,
        );
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }

        // (candidates, attributes-per-candidate, has objectness column, transposed layout)
        let (candidates, transposed, objectness) = if shape[1] == 4 + COCO_CLASSES {
            (shape[2], true, false)
        } else if shape[2] == 5 + COCO_CLASSES {
            (shape[1], false, true)
        } else {
            return Err(anyhow!("unsupported YOLO output shape {:?}", shape));
        };
        let at = |candidate: usize, attr: usize| -> f32 {
            if transposed {
                view[[0, attr, candidate]]
            } else {
                view[[0, candidate, attr]]
            }
        };
        let class_offset = if objectness { 5 } else { 4 };

        let mut detections = Vec::new();
        for candidate in 0..candidates {
            let object_score = if objectness { at(candidate, 4) } else { 1.0 };
            for class_id in [0usize, 15, 16] {
                let Some(class) = TargetClass::from_coco_id(class_id) else {
                    continue;
                };
                let confidence = object_score * at(candidate, class_offset + class_id);
                if !confidence.is_finite() || confidence < self.confidence_threshold {
                    continue;
                }
                let (cx, cy, w, h) = (
                    at(candidate, 0),
                    at(candidate, 1),
                    at(candidate, 2),
                    at(candidate, 3),
                );
                detections.push(Detection {
                    class,
                    confidence: confidence.min(1.0),
                    bbox: BoundingBox::new(
                        (cx - w / 2.0) / self.width as f32,
                        (cy - h / 2.0) / self.height as f32,
                        w / self.width as f32,
                        h / self.height as f32,
                    ),
                });
            }
        }
        Ok(detections)
    }
}

impl InferenceAdapter for TractAdapter {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs)
    }
}
