//! Camera frame sources.
//!
//! - `stub://<name>`: synthetic scene generator (development, bench tests)
//! - `/dev/videoN`: local V4L2 camera (feature: ingest-v4l2)
//!
//! Sources stamp frames with their capture time and hand them to the capture loop.
//! They never retain a frame after returning it.

#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::Result;

use crate::config::CameraSettings;
use crate::frame::FrameSource;

pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// Opens the frame source named by `settings.source`.
pub fn open_source(settings: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    if settings.source.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(
            &settings.source,
            settings.width,
            settings.height,
        )));
    }
    if settings.source.contains("://") {
        anyhow::bail!(
            "camera source '{}' is not supported (expected stub:// or a device path)",
            settings.source
        );
    }
    #[cfg(feature = "ingest-v4l2")]
    {
        let mut source = V4l2Source::new(settings.clone());
        if let Err(err) = source.connect() {
            // The capture loop reconnects on demand; a missing camera at boot is not fatal.
            log::warn!("V4l2Source: initial connect failed: {:#}", err);
        }
        Ok(Box::new(source))
    }
    #[cfg(not(feature = "ingest-v4l2"))]
    {
        anyhow::bail!("camera device sources require the ingest-v4l2 feature")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(source: &str) -> CameraSettings {
        CameraSettings {
            source: source.to_string(),
            width: 32,
            height: 24,
        }
    }

    #[test]
    fn opens_stub_source() -> Result<()> {
        let mut source = open_source(&settings("stub://bench"))?;
        let frame = source.next_frame()?;
        assert_eq!(frame.width, 32);
        assert_eq!(frame.height, 24);
        assert_eq!(source.name(), "stub://bench");
        Ok(())
    }

    #[test]
    fn rejects_network_sources() {
        assert!(open_source(&settings("rtsp://10.0.0.2/stream")).is_err());
    }
}
