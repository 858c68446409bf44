//! Synthetic frame source (`stub://`).
//!
//! Generates a patterned RGB scene that changes every `SCENE_PERIOD` frames, so content-hashing
//! inference backends see a sequence of distinct "scenes" with repeats in between.

use chrono::Utc;

use crate::error::SentinelError;
use crate::frame::{Frame, FrameSource};

const SCENE_PERIOD: u64 = 5;

pub struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    frame_count: u64,
    scene_state: u8,
}

impl SyntheticSource {
    pub fn new(name: &str, width: u32, height: u32) -> Self {
        log::info!("SyntheticSource: opened {} ({}x{})", name, width, height);
        Self {
            name: name.to_string(),
            width,
            height,
            frame_count: 0,
            scene_state: 0,
        }
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.width as usize) * (self.height as usize) * 3;
        if self.frame_count % SCENE_PERIOD == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64).wrapping_mul(self.scene_state as u64 + 1) % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_frame(&mut self) -> Result<Frame, SentinelError> {
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Ok(Frame::new(
            pixels,
            self.width,
            self.height,
            Utc::now(),
            self.frame_count,
        ))
    }

    fn frames_captured(&self) -> u64 {
        self.frame_count
    }
}
