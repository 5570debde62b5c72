//! Bounded clip capture.
//!
//! `capture` opens a media sink at the output path (primary codec first, one
//! retry with the fallback codec), copies up to `duration_frames` frames from
//! the source into it, then verifies that a non-empty artifact exists. A
//! zero-byte or partial artifact from a failed capture is removed.

use anyhow::{anyhow, Context, Result};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::subprocess::detached_command;

/// Video codec used for the raw capture container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    /// H.264 (`avc1`).
    H264,
    /// MPEG-4 Part 2 (`mp4v`).
    Mpeg4,
}

impl Codec {
    /// Codec tried first.
    pub const PRIMARY: Codec = Codec::H264;
    /// Codec tried once when the primary sink cannot be opened.
    pub const FALLBACK: Codec = Codec::Mpeg4;

    /// `ffmpeg` encoder name.
    pub fn encoder(self) -> &'static str {
        match self {
            Codec::H264 => "libx264",
            Codec::Mpeg4 => "mpeg4",
        }
    }

    pub fn fourcc(self) -> &'static str {
        match self {
            Codec::H264 => "avc1",
            Codec::Mpeg4 => "mp4v",
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.fourcc(), self.encoder())
    }
}

/// Geometry and rate of the frames written into a sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinkSpec {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// An open, writable media container.
pub trait ClipSink: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and close the container.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Opens sinks. Opening fails when the codec is unavailable.
pub trait SinkFactory: Send {
    fn open(&self, path: &Path, codec: Codec, spec: &SinkSpec) -> Result<Box<dyn ClipSink>>;
}

/// Capture parameters.
#[derive(Clone, Debug)]
pub struct CaptureRequest {
    pub output_path: PathBuf,
    pub duration_frames: u32,
    pub spec: SinkSpec,
}

/// Successful capture.
#[derive(Clone, Debug)]
pub struct CaptureResult {
    pub path: PathBuf,
    /// Frames written; may be below the requested count when the source ended early.
    pub frame_count: u32,
    pub byte_size: u64,
    pub codec: Codec,
    /// Wall-clock time spent, for diagnostics only.
    pub elapsed: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no sink could be opened at {path} (primary: {primary}; fallback: {fallback})")]
    SinkUnavailable {
        path: PathBuf,
        primary: String,
        fallback: String,
    },
    #[error("failed to finalize {path}: {reason}")]
    Finalize { path: PathBuf, reason: String },
    #[error("capture artifact {0} was not created")]
    Missing(PathBuf),
    #[error("capture artifact {0} is empty")]
    Empty(PathBuf),
    #[error("failed to inspect capture artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Record up to `request.duration_frames` frames from `source` into a new
/// container at `request.output_path`.
pub fn capture<S: FrameSource + ?Sized>(
    source: &mut S,
    sinks: &dyn SinkFactory,
    request: &CaptureRequest,
) -> Result<CaptureResult, CaptureError> {
    let path = request.output_path.as_path();
    let (mut sink, codec) = open_sink(sinks, path, &request.spec)?;

    log::info!(
        "recording {} frames to {} with {}",
        request.duration_frames,
        path.display(),
        codec
    );

    let started = Instant::now();
    let mut frames_written = 0u32;
    while frames_written < request.duration_frames {
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::warn!(
                    "source ended during recording after {} frames",
                    frames_written
                );
                break;
            }
            Err(err) => {
                log::warn!(
                    "failed to read frame during recording after {} frames: {:#}",
                    frames_written,
                    err
                );
                break;
            }
        };
        if let Err(err) = sink.write_frame(&frame) {
            log::error!(
                "sink {} rejected frame {}: {:#}",
                path.display(),
                frame.seq,
                err
            );
            break;
        }
        frames_written += 1;
    }

    if let Err(err) = sink.finish() {
        remove_artifact(path);
        return Err(CaptureError::Finalize {
            path: path.to_path_buf(),
            reason: format!("{:#}", err),
        });
    }

    let elapsed = started.elapsed();
    log::info!(
        "recorded {} frames in {:.2} seconds",
        frames_written,
        elapsed.as_secs_f64()
    );

    let byte_size = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            log::error!("video file was not created: {}", path.display());
            return Err(CaptureError::Missing(path.to_path_buf()));
        }
        Err(source) => {
            return Err(CaptureError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    log::info!("video file created: {} bytes", byte_size);

    if byte_size == 0 {
        log::error!("video file is empty: {}", path.display());
        remove_artifact(path);
        return Err(CaptureError::Empty(path.to_path_buf()));
    }

    Ok(CaptureResult {
        path: path.to_path_buf(),
        frame_count: frames_written,
        byte_size,
        codec,
        elapsed,
    })
}

fn open_sink(
    sinks: &dyn SinkFactory,
    path: &Path,
    spec: &SinkSpec,
) -> Result<(Box<dyn ClipSink>, Codec), CaptureError> {
    let primary = match sinks.open(path, Codec::PRIMARY, spec) {
        Ok(sink) => return Ok((sink, Codec::PRIMARY)),
        Err(err) => err,
    };
    log::warn!(
        "failed to open sink at {} with {}: {:#}; trying {}",
        path.display(),
        Codec::PRIMARY,
        primary,
        Codec::FALLBACK
    );
    match sinks.open(path, Codec::FALLBACK, spec) {
        Ok(sink) => Ok((sink, Codec::FALLBACK)),
        Err(fallback) => {
            log::error!(
                "failed to open sink at {} with any codec: {:#}",
                path.display(),
                fallback
            );
            remove_artifact(path);
            Err(CaptureError::SinkUnavailable {
                path: path.to_path_buf(),
                primary: format!("{:#}", primary),
                fallback: format!("{:#}", fallback),
            })
        }
    }
}

fn remove_artifact(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::info!("removed partial capture {}", path.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => log::warn!("failed to remove {}: {}", path.display(), err),
    }
}

// ----------------------------------------------------------------------------
// ffmpeg-backed sink
// ----------------------------------------------------------------------------

/// Opens sinks that pipe raw RGB24 frames into an `ffmpeg` encoder process.
pub struct FfmpegSinkFactory {
    ffmpeg_path: PathBuf,
    /// `ffmpeg -encoders` listing. Only a successful listing is kept.
    encoders: Mutex<Option<String>>,
}

impl FfmpegSinkFactory {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            encoders: Mutex::new(None),
        }
    }

    fn encoder_available(&self, codec: Codec) -> Result<()> {
        let mut cached = self
            .encoders
            .lock()
            .map_err(|_| anyhow!("encoder listing lock poisoned"))?;
        if cached.is_none() {
            *cached = list_encoders(&self.ffmpeg_path);
        }
        let listing = cached.as_deref().ok_or_else(|| {
            anyhow!(
                "could not list encoders from {}",
                self.ffmpeg_path.display()
            )
        })?;
        if encoder_listed(listing, codec.encoder()) {
            Ok(())
        } else {
            Err(anyhow!(
                "encoder {} is not available in {}",
                codec.encoder(),
                self.ffmpeg_path.display()
            ))
        }
    }
}

impl SinkFactory for FfmpegSinkFactory {
    fn open(&self, path: &Path, codec: Codec, spec: &SinkSpec) -> Result<Box<dyn ClipSink>> {
        self.encoder_available(codec)?;

        let mut child = detached_command(&self.ffmpeg_path)
            .args(encoder_args(path, codec, spec))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start {}", self.ffmpeg_path.display()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("could not get ffmpeg stdin handle"))?;

        log::debug!(
            "ffmpeg encoder started: codec={} {}x{}@{} output={}",
            codec.encoder(),
            spec.width,
            spec.height,
            spec.fps,
            path.display()
        );

        Ok(Box::new(FfmpegSink {
            child,
            stdin: Some(stdin),
            spec: *spec,
            path: path.to_path_buf(),
        }))
    }
}

struct FfmpegSink {
    child: Child,
    stdin: Option<ChildStdin>,
    spec: SinkSpec,
    path: PathBuf,
}

impl ClipSink for FfmpegSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.width != self.spec.width || frame.height != self.spec.height {
            return Err(anyhow!(
                "frame is {}x{}, sink expects {}x{}",
                frame.width,
                frame.height,
                self.spec.width,
                self.spec.height
            ));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("sink already closed"))?;
        stdin
            .write_all(frame.pixels())
            .context("write frame to ffmpeg stdin")
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let FfmpegSink {
            child, stdin, path, ..
        } = *self;
        // Closing stdin tells ffmpeg there are no more frames.
        drop(stdin);
        let output = child
            .wait_with_output()
            .context("wait for ffmpeg encoder")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "ffmpeg encoder for {} exited with {}: {}",
                path.display(),
                output.status,
                stderr.trim()
            ));
        }
        Ok(())
    }
}

fn encoder_args(path: &Path, codec: Codec, spec: &SinkSpec) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-nostats".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgb24".into(),
        "-s".into(),
        format!("{}x{}", spec.width, spec.height),
        "-r".into(),
        spec.fps.to_string(),
        "-i".into(),
        "pipe:0".into(),
        "-an".into(),
        "-c:v".into(),
        codec.encoder().into(),
        "-tag:v".into(),
        codec.fourcc().into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-y".into(),
        path.to_string_lossy().into_owned(),
    ]
}

fn list_encoders(ffmpeg_path: &Path) -> Option<String> {
    match detached_command(ffmpeg_path)
        .args(["-hide_banner", "-encoders"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
    {
        Ok(output) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(output) => {
            log::warn!("ffmpeg -encoders exited with {}", output.status);
            None
        }
        Err(err) => {
            log::warn!("failed to run {}: {}", ffmpeg_path.display(), err);
            None
        }
    }
}

/// Match an encoder name in the second column of `ffmpeg -encoders` output.
fn encoder_listed(listing: &str, encoder: &str) -> bool {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|name| name == encoder)
}
