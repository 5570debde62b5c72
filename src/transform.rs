//! Clip time-compression.
//!
//! `speed_up` rewrites a captured clip so that it plays `factor` times faster,
//! by rescaling presentation timestamps with an external transcoder. When the
//! transcoder fails for any reason the raw capture is renamed to the output
//! path instead, so a detection always leaves a playable clip behind.

use anyhow::{Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use crate::subprocess::detached_command;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("invalid speed factor {0}")]
    InvalidFactor(f64),
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("transcoder exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },
    #[error("transcoder timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to wait for transcoder: {0}")]
    Wait(#[source] std::io::Error),
    #[error("transcoder exited cleanly but produced no output at {0}")]
    MissingOutput(PathBuf),
}

/// Rewrites a video's timing.
pub trait Transcoder: Send {
    /// Write `input` to `output` with every presentation timestamp multiplied
    /// by `pts_coefficient`, dropping audio and overwriting `output`.
    fn retime(&self, input: &Path, pts_coefficient: f64, output: &Path)
        -> Result<(), TranscodeError>;
}

/// Timestamp coefficient for a speed-up `factor` (original / target duration).
pub fn pts_coefficient(factor: f64) -> Option<f64> {
    if factor.is_finite() && factor > 0.0 {
        Some(1.0 / factor)
    } else {
        None
    }
}

/// `ffmpeg` video filter expression for a timestamp coefficient.
pub fn setpts_filter(pts_coefficient: f64) -> String {
    format!("setpts={:.3}*PTS", pts_coefficient)
}

/// Terminal clip artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalClip {
    pub path: PathBuf,
    /// False when the raw capture was kept as a fallback.
    pub transformed: bool,
}

/// Speed `input` up by `factor` into `output`.
///
/// Transcoder failures never surface: the raw input is renamed to `output`
/// instead. The only error is a failed fallback rename (for example when
/// `input` no longer exists).
pub fn speed_up(
    transcoder: &dyn Transcoder,
    input: &Path,
    factor: f64,
    output: &Path,
) -> Result<FinalClip> {
    log::info!(
        "speeding up video {:.2}x: {} -> {}",
        factor,
        input.display(),
        output.display()
    );

    let attempt = match pts_coefficient(factor) {
        Some(coefficient) => transcoder
            .retime(input, coefficient, output)
            .and_then(|()| verify_output(output)),
        None => Err(TranscodeError::InvalidFactor(factor)),
    };

    match attempt {
        Ok(()) => {
            match std::fs::remove_file(input) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => log::warn!(
                    "failed to delete temporary capture {}: {}",
                    input.display(),
                    err
                ),
            }
            log::info!("video ready: {}", output.display());
            Ok(FinalClip {
                path: output.to_path_buf(),
                transformed: true,
            })
        }
        Err(err) => {
            log::error!(
                "transcode of {} failed: {}; keeping raw capture",
                input.display(),
                err
            );
            std::fs::rename(input, output).with_context(|| {
                format!(
                    "fallback rename {} -> {} failed",
                    input.display(),
                    output.display()
                )
            })?;
            log::warn!("video ready (not sped up): {}", output.display());
            Ok(FinalClip {
                path: output.to_path_buf(),
                transformed: false,
            })
        }
    }
}

fn verify_output(output: &Path) -> Result<(), TranscodeError> {
    match std::fs::metadata(output) {
        Ok(meta) if meta.len() > 0 => Ok(()),
        _ => Err(TranscodeError::MissingOutput(output.to_path_buf())),
    }
}

/// `ffmpeg` subprocess transcoder with a hard wall-clock timeout.
#[derive(Clone, Debug)]
pub struct FfmpegTranscoder {
    program: PathBuf,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn args(input: &Path, pts_coefficient: f64, output: &Path) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-nostats".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            input.to_string_lossy().into_owned(),
            "-filter:v".into(),
            setpts_filter(pts_coefficient),
            "-an".into(),
            "-y".into(),
            output.to_string_lossy().into_owned(),
        ]
    }
}

impl Transcoder for FfmpegTranscoder {
    fn retime(
        &self,
        input: &Path,
        pts_coefficient: f64,
        output: &Path,
    ) -> Result<(), TranscodeError> {
        let mut child = detached_command(&self.program)
            .args(Self::args(input, pts_coefficient, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| TranscodeError::Launch {
                program: self.program.display().to_string(),
                source,
            })?;

        // Drain stderr on a side thread so a chatty child cannot block on a full pipe.
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf);
                buf
            })
        });
        let collect_stderr = |reader: Option<std::thread::JoinHandle<String>>| {
            reader
                .and_then(|handle| handle.join().ok())
                .unwrap_or_default()
        };

        // On timeout the reader is detached rather than joined: a grandchild
        // may still hold the pipe open.
        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(TranscodeError::Timeout(self.timeout));
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(TranscodeError::Wait(err));
                }
            }
        };

        let stderr = collect_stderr(stderr_reader);
        if !status.success() {
            return Err(TranscodeError::Exit {
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}
