//! Camera/file frame source backed by an `ffmpeg` subprocess.
//!
//! The child process opens the device (e.g. `/dev/video0`) or a local file and
//! writes packed RGB24 frames to stdout at the configured resolution. Each read
//! pulls exactly one frame's worth of bytes from the pipe, so the read blocks
//! for at most one frame interval on a live device.
//!
//! A file input ends when ffmpeg closes its stdout. A device input never ends:
//! if ffmpeg exits the read fails and the next read starts a fresh child.

use anyhow::{anyhow, Context, Result};
use std::io::{BufReader, ErrorKind, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Stdio};
use std::time::{Duration, Instant};

use super::{FrameSource, SourceStats};
use crate::config::SourceSettings;
use crate::frame::{expected_len, Frame};
use crate::subprocess::detached_command;

/// Configuration for an `ffmpeg`-backed source.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Device node (`/dev/videoN`) or local file path.
    pub input: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub ffmpeg_path: PathBuf,
}

impl DeviceConfig {
    pub fn from_settings(input: &str, settings: &SourceSettings) -> Self {
        Self {
            input: input.to_string(),
            width: settings.width,
            height: settings.height,
            fps: settings.fps,
            ffmpeg_path: settings.ffmpeg_path.clone(),
        }
    }

    fn is_device(&self) -> bool {
        self.input.starts_with("/dev/")
    }

    fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostats".into(),
            "-loglevel".into(),
            "error".into(),
        ];
        if self.is_device() {
            args.extend([
                "-f".into(),
                "v4l2".into(),
                "-framerate".into(),
                self.fps.to_string(),
                "-video_size".into(),
                format!("{}x{}", self.width, self.height),
            ]);
        } else {
            // Files are replayed in real time so the loop sees live-like pacing.
            args.push("-re".into());
        }
        args.extend([
            "-i".into(),
            self.input.clone(),
            "-an".into(),
            "-vf".into(),
            format!("scale={}:{}", self.width, self.height),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "pipe:1".into(),
        ]);
        args
    }
}

struct DeviceProcess {
    child: Child,
    stdout: BufReader<ChildStdout>,
}

/// `ffmpeg` subprocess frame source.
pub struct DeviceSource {
    config: DeviceConfig,
    process: Option<DeviceProcess>,
    /// First frame, read during `connect` to prove the device works.
    pending: Option<Frame>,
    frame_size: usize,
    frame_count: u64,
    read_failures: u64,
    ended: bool,
    /// Device child exited; restart it on the next read.
    restart: bool,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
}

impl DeviceSource {
    pub fn new(config: DeviceConfig) -> Self {
        let frame_size = expected_len(config.width, config.height).unwrap_or(0);
        Self {
            config,
            process: None,
            pending: None,
            frame_size,
            frame_count: 0,
            read_failures: 0,
            ended: false,
            restart: false,
            last_frame_at: None,
            last_error: None,
        }
    }

    fn spawn(&self) -> Result<DeviceProcess> {
        let mut child = detached_command(&self.config.ffmpeg_path)
            .args(self.config.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| {
                format!(
                    "failed to start {} for {}",
                    self.config.ffmpeg_path.display(),
                    self.config.input
                )
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture ffmpeg stdout"))?;
        Ok(DeviceProcess {
            child,
            stdout: BufReader::with_capacity(self.frame_size.max(4096) * 2, stdout),
        })
    }

    fn read_raw(&mut self) -> Result<Option<Frame>> {
        let Some(process) = self.process.as_mut() else {
            return Err(anyhow!("source {} not connected", self.config.input));
        };
        let mut buf = vec![0u8; self.frame_size];
        match process.stdout.read_exact(&mut buf) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                if !self.config.is_device() {
                    self.ended = true;
                    return Ok(None);
                }
                self.reap();
                self.restart = true;
                let reason = format!("ffmpeg stopped delivering frames from {}", self.config.input);
                self.last_error = Some(reason.clone());
                return Err(anyhow!(reason));
            }
            Err(err) => {
                self.last_error = Some(err.to_string());
                return Err(anyhow::Error::new(err).context("read frame from ffmpeg"));
            }
        }
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        self.last_error = None;
        Frame::new(self.frame_count, self.config.width, self.config.height, buf).map(Some)
    }

    fn reap(&mut self) {
        if let Some(mut process) = self.process.take() {
            if let Err(err) = process.child.kill() {
                if err.kind() != ErrorKind::InvalidInput {
                    log::debug!("DeviceSource: kill {}: {}", self.config.input, err);
                }
            }
            match process.child.wait() {
                Ok(status) => log::debug!("DeviceSource: ffmpeg exited with {}", status),
                Err(err) => log::debug!("DeviceSource: wait {}: {}", self.config.input, err),
            }
        }
    }

    fn restart_process(&mut self) -> Result<()> {
        let process = self.spawn()?;
        self.process = Some(process);
        self.restart = false;
        log::warn!("DeviceSource: restarted ffmpeg for {}", self.config.input);
        Ok(())
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.config.fps == 0 {
            2_000
        } else {
            (1000 / self.config.fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }
}

impl FrameSource for DeviceSource {
    fn describe(&self) -> String {
        format!("ffmpeg:{}", self.config.input)
    }

    fn connect(&mut self) -> Result<()> {
        if self.frame_size == 0 {
            return Err(anyhow!(
                "invalid frame size {}x{}",
                self.config.width,
                self.config.height
            ));
        }
        self.close();
        self.process = Some(self.spawn()?);
        self.ended = false;

        let first = self.read_raw().map_err(|err| {
            self.close();
            err
        })?;
        match first {
            Some(frame) => {
                self.pending = Some(frame);
                log::info!(
                    "DeviceSource: connected to {} ({}x{})",
                    self.config.input,
                    self.config.width,
                    self.config.height
                );
                Ok(())
            }
            None => {
                self.close();
                Err(anyhow!(
                    "failed to open {}: ffmpeg produced no frames",
                    self.config.input
                ))
            }
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        if self.ended {
            return Ok(None);
        }
        let read = if self.restart {
            self.restart_process().and_then(|()| self.read_raw())
        } else {
            self.read_raw()
        };
        read.map_err(|err| {
            self.read_failures += 1;
            err
        })
    }

    fn close(&mut self) {
        self.pending = None;
        self.restart = false;
        if self.process.is_some() {
            self.reap();
            log::info!("DeviceSource: released {}", self.config.input);
        }
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() || self.process.is_none() {
            return false;
        }
        match self.last_frame_at {
            Some(at) => at.elapsed() <= self.health_grace(),
            None => true,
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            read_failures: self.read_failures,
            source: self.describe(),
        }
    }
}

impl Drop for DeviceSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(input: &str) -> DeviceConfig {
        DeviceConfig {
            input: input.to_string(),
            width: 640,
            height: 480,
            fps: 30,
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }

    #[test]
    fn device_args_select_v4l2_input() {
        let args = config("/dev/video0").args();
        let joined = args.join(" ");
        assert!(joined.contains("-f v4l2 -framerate 30 -video_size 640x480 -i /dev/video0"));
        assert!(joined.ends_with("-f rawvideo -pix_fmt rgb24 pipe:1"));
    }

    #[test]
    fn file_args_replay_in_real_time() {
        let args = config("/srv/clips/door.mp4").args();
        assert!(args.iter().any(|a| a == "-re"));
        assert!(!args.iter().any(|a| a == "v4l2"));
    }

    #[cfg(unix)]
    fn scripted_source(input: &str) -> Result<(tempfile::TempDir, DeviceSource)> {
        let dir = tempfile::tempdir()?;
        // Three 4x4 RGB24 frames, then exit.
        let ffmpeg = crate::subprocess::write_script(
            dir.path(),
            "ffmpeg",
            "head -c 144 /dev/zero\nexit 1",
        )?;
        let source = DeviceSource::new(DeviceConfig {
            input: input.to_string(),
            width: 4,
            height: 4,
            fps: 30,
            ffmpeg_path: ffmpeg,
        });
        Ok((dir, source))
    }

    #[cfg(unix)]
    #[test]
    fn device_exit_is_a_read_failure_and_restarts() -> Result<()> {
        let (_dir, mut source) = scripted_source("/dev/video0")?;
        source.connect()?;
        for seq in 1..=3 {
            assert_eq!(source.next_frame()?.map(|f| f.seq), Some(seq));
        }
        assert!(source.next_frame().is_err());
        assert!(!source.is_healthy());
        assert_eq!(source.stats().read_failures, 1);

        // The next read spawns a fresh child.
        assert_eq!(source.next_frame()?.map(|f| f.seq), Some(4));
        assert!(source.is_healthy());
        source.close();
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn file_input_ends_when_ffmpeg_exits() -> Result<()> {
        let (_dir, mut source) = scripted_source("/srv/clips/door.mp4")?;
        source.connect()?;
        for _ in 0..3 {
            assert!(source.next_frame()?.is_some());
        }
        assert!(source.next_frame()?.is_none());
        assert!(source.next_frame()?.is_none());
        assert_eq!(source.stats().read_failures, 0);
        Ok(())
    }

    #[test]
    fn unconnected_source_reports_error() {
        let mut source = DeviceSource::new(config("/dev/video0"));
        assert!(source.next_frame().is_err());
        assert!(!source.is_healthy());
        assert_eq!(source.stats().read_failures, 1);
    }
}
