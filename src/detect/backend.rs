use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Inference collaborator: the object-detection model behind a narrow interface.
///
/// Implementations must be deterministic for a given frame and model, must only report
/// `TargetClass` detections, and must not retain the frame beyond the call. Execution time
/// is bounded by `InferenceWorker`, not by the adapter itself.
pub trait InferenceAdapter: Send {
    /// Adapter identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook (model load, first-run allocation).
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
