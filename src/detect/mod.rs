mod backend;
pub mod backends;
mod result;
mod worker;

use anyhow::Result;

use crate::config::DetectionSettings;

pub use backend::InferenceAdapter;
pub use backends::StubAdapter;
#[cfg(feature = "backend-tract")]
pub use backends::TractAdapter;
pub use result::{BoundingBox, Detection, TargetClass};
pub use worker::InferenceWorker;

/// Builds the inference adapter for the configured model.
///
/// Without a model path the deterministic stub adapter is used.
pub fn open_adapter(
    settings: &DetectionSettings,
    width: u32,
    height: u32,
) -> Result<Box<dyn InferenceAdapter>> {
    let Some(model_path) = settings.model_path.as_ref() else {
        log::warn!("no model_path configured; using the stub inference adapter");
        return Ok(Box::new(StubAdapter::new()));
    };
    #[cfg(feature = "backend-tract")]
    {
        let adapter = TractAdapter::new(model_path, width, height)?
            .with_threshold(settings.confidence_threshold);
        Ok(Box::new(adapter))
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        let _ = (width, height);
        anyhow::bail!(
            "model {} requires the backend-tract feature",
            model_path.display()
        )
    }
}
