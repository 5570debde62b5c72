//! Frame ingestion sources.
//!
//! This module provides the sources the recorder can sample from:
//! - Camera devices and local files through an `ffmpeg` subprocess (default)
//! - Synthetic `stub://` frames (dry runs without a camera)
//! - Scripted sources (deterministic tests)
//! - Native V4L2 devices (feature: ingest-v4l2)
//! - In-process file decoding (feature: ingest-file-ffmpeg)
//!
//! Every source yields `Frame`s at the configured resolution. A read either
//! produces a frame, reports end-of-stream (`Ok(None)`), or fails transiently
//! (`Err`), in which case the caller decides whether to retry.

pub mod device;
#[cfg(feature = "ingest-file-ffmpeg")]
pub mod file;
pub mod scripted;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::Result;

use crate::config::SourceSettings;
use crate::frame::Frame;

pub use device::DeviceSource;
#[cfg(feature = "ingest-file-ffmpeg")]
pub use file::FileSource;
pub use scripted::{ScriptedRead, ScriptedSource};
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// Capability interface for anything that yields frames.
pub trait FrameSource: Send {
    /// Human-readable identifier used in logs.
    fn describe(&self) -> String;

    /// Open the underlying device/stream. Must be called before `next_frame`.
    fn connect(&mut self) -> Result<()>;

    /// Read the next frame.
    ///
    /// `Ok(None)` means the stream is exhausted and no further frames will come.
    /// `Err` is a transient read failure.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Release the underlying device. Idempotent.
    fn close(&mut self) {}

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }

    fn stats(&self) -> SourceStats {
        (**self).stats()
    }
}

/// Frame statistics for a source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub read_failures: u64,
    pub source: String,
}

/// Build and connect the source selected by `settings`.
///
/// Input selection:
/// - `stub://<name>`: synthetic frames
/// - `v4l2://<device>`: native V4L2 (requires ingest-v4l2)
/// - `file://<path>`: in-process decode when ingest-file-ffmpeg is enabled,
///   otherwise the `ffmpeg` subprocess
/// - anything else: a device node or file path read through `ffmpeg`
///
/// Failing to connect is returned as an error; the daemon treats it as fatal.
pub fn open_source(settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    let input = settings.resolved_input();
    let mut source = build_source(&input, settings)?;
    source.connect()?;
    log::info!(
        "source {} opened at {}x{} @ {} fps",
        source.describe(),
        settings.width,
        settings.height,
        settings.fps
    );
    Ok(source)
}

fn build_source(input: &str, settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    if input.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(
            input,
            settings.width,
            settings.height,
            settings.fps,
        )));
    }
    if let Some(device) = input.strip_prefix("v4l2://") {
        #[cfg(feature = "ingest-v4l2")]
        {
            return Ok(Box::new(V4l2Source::new(v4l2::V4l2Config {
                device: device.to_string(),
                target_fps: settings.fps,
                width: settings.width,
                height: settings.height,
            })?));
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            return Err(anyhow::anyhow!(
                "native capture from {} requires the ingest-v4l2 feature",
                device
            ));
        }
    }
    if let Some(path) = input.strip_prefix("file://") {
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            return Ok(Box::new(FileSource::new(file::FileConfig {
                path: path.to_string(),
                width: settings.width,
                height: settings.height,
                target_fps: settings.fps,
            })?));
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            return Ok(Box::new(DeviceSource::new(device::DeviceConfig::from_settings(
                path, settings,
            ))));
        }
    }
    Ok(Box::new(DeviceSource::new(device::DeviceConfig::from_settings(
        input, settings,
    ))))
}
