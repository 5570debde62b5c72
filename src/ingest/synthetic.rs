//! Synthetic `stub://` source.
//!
//! Produces a moving test pattern paced at the configured frame rate, so the
//! recorder can be smoke-tested end to end without a camera attached.

use anyhow::Result;
use std::time::{Duration, Instant};

use super::{FrameSource, SourceStats};
use crate::frame::{expected_len, Frame};

pub struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    fps: u32,
    frame_count: u64,
    /// Simulated scene; bumps every 50 frames.
    scene_state: u8,
    next_due: Option<Instant>,
    connected: bool,
}

impl SyntheticSource {
    pub fn new(name: &str, width: u32, height: u32, fps: u32) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            fps,
            frame_count: 0,
            scene_state: 0,
            next_due: None,
            connected: false,
        }
    }

    fn frame_interval(&self) -> Duration {
        if self.fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / self.fps
        }
    }

    fn pace(&mut self) {
        let interval = self.frame_interval();
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_due = Some(Instant::now() + interval);
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let len = expected_len(self.width, self.height).unwrap_or(0);
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; len];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("SyntheticSource: connected to {} (synthetic)", self.name);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if !self.connected {
            anyhow::bail!("synthetic source {} not connected", self.name);
        }
        self.pace();
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::new(self.frame_count, self.width, self.height, pixels).map(Some)
    }

    fn close(&mut self) {
        self.connected = false;
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            read_failures: 0,
            source: self.name.clone(),
        }
    }
}
