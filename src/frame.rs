//! Frame container.
//!
//! A `Frame` is an immutable RGB24 pixel buffer tagged with the sequence number
//! its source assigned at capture time. Frames are moved from the source into
//! whichever component processes them and are never shared mutably.

use anyhow::{anyhow, Result};
use std::time::Instant;

/// Bytes per pixel for the RGB24 layout every source produces.
pub const BYTES_PER_PIXEL: usize = 3;

/// Immutable captured frame.
pub struct Frame {
    /// Packed RGB24 pixels, row-major, no padding.
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Source-assigned sequence number (1-based, monotonic per source).
    pub seq: u64,

    /// Monotonic capture instant.
    captured_at: Instant,
}

impl Frame {
    /// Wrap a packed RGB24 buffer. Fails when the buffer length does not match
    /// `width * height * 3`.
    pub fn new(seq: u64, width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = expected_len(width, height)
            .ok_or_else(|| anyhow!("frame dimensions {}x{} overflow", width, height))?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame {} expected {} RGB bytes for {}x{}, received {}",
                seq,
                expected,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            seq,
            captured_at: Instant::now(),
        })
    }

    /// A frame filled with a single RGB colour.
    pub fn solid(seq: u64, width: u32, height: u32, rgb: [u8; 3]) -> Result<Self> {
        let len = expected_len(width, height)
            .ok_or_else(|| anyhow!("frame dimensions {}x{} overflow", width, height))?;
        let data = rgb.iter().copied().cycle().take(len).collect();
        Self::new(seq, width, height, data)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// RGB triple at `(x, y)`, or `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = ((y as usize) * (self.width as usize) + x as usize) * BYTES_PER_PIXEL;
        let px = self.data.get(idx..idx + BYTES_PER_PIXEL)?;
        Some([px[0], px[1], px[2]])
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("seq", &self.seq)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Packed RGB24 size for the given dimensions.
pub fn expected_len(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(BYTES_PER_PIXEL))
}
