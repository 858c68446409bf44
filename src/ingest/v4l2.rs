//! V4L2 camera source.
//!
//! Captures from a local device node (e.g. `/dev/video0`) through memory-mapped buffers.
//! Capture errors drop the stream and are reported as `SourceUnavailable`; the next call
//! reopens the device, so a camera that is unplugged and replugged recovers on its own.

use anyhow::{Context, Result};
use chrono::Utc;
use ouroboros::self_referencing;
use std::time::{Duration, Instant};

use super::normalize::{normalize_to_rgb, PixelFormat};
use crate::config::CameraSettings;
use crate::error::SentinelError;
use crate::frame::{Frame, FrameSource};

const CAPTURE_BUFFERS: u32 = 4;
const HEALTH_GRACE: Duration = Duration::from_secs(10);

pub struct V4l2Source {
    settings: CameraSettings,
    state: Option<DeviceState>,
    pixel_format: PixelFormat,
    active_width: u32,
    active_height: u32,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(settings: CameraSettings) -> Self {
        Self {
            active_width: settings.width,
            active_height: settings.height,
            settings,
            state: None,
            pixel_format: PixelFormat::Rgb24,
            frame_count: 0,
            last_frame_at: None,
            last_error: None,
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.settings.source)
            .with_context(|| format!("open v4l2 device {}", self.settings.source))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.settings.width;
        format.height = self.settings.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set RGB3 on {}: {}",
                    self.settings.source,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        self.pixel_format = match &format.fourcc.repr {
            b"RGB3" => PixelFormat::Rgb24,
            b"YUYV" => PixelFormat::Yuyv,
            other => anyhow::bail!(
                "v4l2 device {} negotiated unsupported pixel format {}",
                self.settings.source,
                String::from_utf8_lossy(other)
            ),
        };
        self.active_width = format.width;
        self.active_height = format.height;

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, CAPTURE_BUFFERS)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);
        self.last_error = None;

        log::info!(
            "V4l2Source: connected to {} ({}x{}, {:?})",
            self.settings.source,
            self.active_width,
            self.active_height,
            self.pixel_format
        );
        Ok(())
    }

    fn capture(&mut self) -> Result<Vec<u8>> {
        use v4l::io::traits::CaptureStream;

        if self.state.is_none() {
            self.connect()?;
        }
        let state = self.state.as_mut().context("v4l2 device not connected")?;
        let (buf, _meta) = state
            .with_mut(|fields| fields.stream.next())
            .context("capture v4l2 frame")?;
        normalize_to_rgb(buf, self.active_width, self.active_height, self.pixel_format)
    }
}

impl FrameSource for V4l2Source {
    fn name(&self) -> &str {
        &self.settings.source
    }

    fn next_frame(&mut self) -> Result<Frame, SentinelError> {
        match self.capture() {
            Ok(pixels) => {
                self.frame_count += 1;
                self.last_frame_at = Some(Instant::now());
                Ok(Frame::new(
                    pixels,
                    self.active_width,
                    self.active_height,
                    Utc::now(),
                    self.frame_count,
                ))
            }
            Err(err) => {
                self.state = None;
                let message = format!("{}: {:#}", self.settings.source, err);
                self.last_error = Some(message.clone());
                Err(SentinelError::SourceUnavailable(message))
            }
        }
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        self.last_frame_at
            .map_or(true, |at| at.elapsed() <= HEALTH_GRACE)
    }

    fn frames_captured(&self) -> u64 {
        self.frame_count
    }
}
