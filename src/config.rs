use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_VIDEO_DIR: &str = "/tmp/videos";
const DEFAULT_DEVICE_INDEX: u32 = 0;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 30;
const DEFAULT_FFMPEG: &str = "ffmpeg";
const DEFAULT_READ_RETRY_MS: u64 = 100;
const DEFAULT_RECORDING_SECS: f64 = 5.0;
const DEFAULT_TARGET_SECS: f64 = 3.0;
const DEFAULT_SETTLE_MS: u64 = 2_000;
const DEFAULT_TRANSCODE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CLIP_PREFIX: &str = "person_detected";
const DEFAULT_BACKEND: &str = "tract";
const DEFAULT_MODEL_PATH: &str = "yolov7-tiny.onnx";
const DEFAULT_MODEL_INPUT: u32 = 640;
const DEFAULT_TARGET_CLASS: u32 = 0;
const DEFAULT_CONFIDENCE: f32 = 0.45;
const DEFAULT_COOLDOWN_SECS: u64 = 30;
const DEFAULT_SAMPLE_EVERY: u64 = 5;

/// Environment variables read by `RecorderConfig::load`.
pub const ENV_VARS: &[&str] = &[
    "RECORDER_CONFIG",
    "RECORDER_VIDEO_DIR",
    "VIDEO_DIR",
    "RECORDER_DEVICE_INDEX",
    "RECORDER_SOURCE",
    "RECORDER_WIDTH",
    "RECORDER_HEIGHT",
    "RECORDER_FPS",
    "RECORDER_FFMPEG",
    "RECORDER_READ_RETRY_MS",
    "RECORDER_DURATION_SECS",
    "RECORDER_TARGET_DURATION_SECS",
    "RECORDER_SETTLE_DELAY_MS",
    "RECORDER_TRANSCODE_TIMEOUT_SECS",
    "RECORDER_CLIP_PREFIX",
    "RECORDER_BACKEND",
    "RECORDER_MODEL_PATH",
    "RECORDER_MODEL_INPUT_SIZE",
    "RECORDER_TARGET_CLASS",
    "RECORDER_CONFIDENCE_THRESHOLD",
    "RECORDER_COOLDOWN_SECS",
    "RECORDER_SAMPLE_EVERY",
];

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RecorderConfigFile {
    video_dir: Option<PathBuf>,
    source: Option<SourceConfigFile>,
    recording: Option<RecordingConfigFile>,
    detection: Option<DetectionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SourceConfigFile {
    device_index: Option<u32>,
    input: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    ffmpeg_path: Option<PathBuf>,
    read_retry_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RecordingConfigFile {
    duration_secs: Option<f64>,
    target_duration_secs: Option<f64>,
    settle_delay_ms: Option<u64>,
    transcode_timeout_secs: Option<u64>,
    clip_prefix: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectionConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    model_input_size: Option<u32>,
    target_class: Option<u32>,
    confidence_threshold: Option<f32>,
    cooldown_secs: Option<u64>,
    sample_every_n_frames: Option<u64>,
}

/// Static configuration for the process lifetime.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub video_dir: PathBuf,
    pub source: SourceSettings,
    pub recording: RecordingSettings,
    pub detection: DetectionSettings,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub device_index: u32,
    /// Explicit input overriding `/dev/video<device_index>`.
    pub input: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub ffmpeg_path: PathBuf,
    /// Pause after a failed frame read.
    pub read_retry: Duration,
}

impl SourceSettings {
    /// Input string handed to `ingest::open_source`.
    pub fn resolved_input(&self) -> String {
        match &self.input {
            Some(input) => input.clone(),
            None => format!("/dev/video{}", self.device_index),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub duration_secs: f64,
    pub target_duration_secs: f64,
    pub settle_delay: Duration,
    pub transcode_timeout: Duration,
    pub clip_prefix: String,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub backend: String,
    pub model_path: PathBuf,
    pub model_input_size: u32,
    pub target_class: u32,
    pub confidence_threshold: f32,
    pub cooldown: Duration,
    pub sample_every_n_frames: u64,
}

impl RecorderConfig {
    /// Load from an optional config file (explicit path, else `RECORDER_CONFIG`),
    /// then apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("RECORDER_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let config_path = path.map(Path::to_path_buf).or(env_path);
        let file_cfg = match config_path.as_deref() {
            Some(path) => read_config_file(path)?,
            None => RecorderConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Built-in defaults, without reading the environment.
    pub fn defaults() -> Self {
        Self::from_file(RecorderConfigFile::default())
    }

    fn from_file(file: RecorderConfigFile) -> Self {
        let source = file.source.unwrap_or_default();
        let recording = file.recording.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        Self {
            video_dir: file
                .video_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_VIDEO_DIR)),
            source: SourceSettings {
                device_index: source.device_index.unwrap_or(DEFAULT_DEVICE_INDEX),
                input: source.input.filter(|i| !i.trim().is_empty()),
                width: source.width.unwrap_or(DEFAULT_WIDTH),
                height: source.height.unwrap_or(DEFAULT_HEIGHT),
                fps: source.fps.unwrap_or(DEFAULT_FPS),
                ffmpeg_path: source
                    .ffmpeg_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG)),
                read_retry: Duration::from_millis(
                    source.read_retry_ms.unwrap_or(DEFAULT_READ_RETRY_MS),
                ),
            },
            recording: RecordingSettings {
                duration_secs: recording.duration_secs.unwrap_or(DEFAULT_RECORDING_SECS),
                target_duration_secs: recording
                    .target_duration_secs
                    .unwrap_or(DEFAULT_TARGET_SECS),
                settle_delay: Duration::from_millis(
                    recording.settle_delay_ms.unwrap_or(DEFAULT_SETTLE_MS),
                ),
                transcode_timeout: Duration::from_secs(
                    recording
                        .transcode_timeout_secs
                        .unwrap_or(DEFAULT_TRANSCODE_TIMEOUT_SECS),
                ),
                clip_prefix: recording
                    .clip_prefix
                    .unwrap_or_else(|| DEFAULT_CLIP_PREFIX.to_string()),
            },
            detection: DetectionSettings {
                backend: detection
                    .backend
                    .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
                model_path: detection
                    .model_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
                model_input_size: detection.model_input_size.unwrap_or(DEFAULT_MODEL_INPUT),
                target_class: detection.target_class.unwrap_or(DEFAULT_TARGET_CLASS),
                confidence_threshold: detection
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE),
                cooldown: Duration::from_secs(
                    detection.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS),
                ),
                sample_every_n_frames: detection
                    .sample_every_n_frames
                    .unwrap_or(DEFAULT_SAMPLE_EVERY),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        // Legacy name first so the prefixed one wins when both are set.
        for key in ["VIDEO_DIR", "RECORDER_VIDEO_DIR"] {
            if let Some(dir) = env_string(key) {
                self.video_dir = PathBuf::from(dir);
            }
        }
        if let Some(index) = env_parse("RECORDER_DEVICE_INDEX")? {
            self.source.device_index = index;
        }
        if let Some(input) = env_string("RECORDER_SOURCE") {
            self.source.input = Some(input);
        }
        if let Some(width) = env_parse("RECORDER_WIDTH")? {
            self.source.width = width;
        }
        if let Some(height) = env_parse("RECORDER_HEIGHT")? {
            self.source.height = height;
        }
        if let Some(fps) = env_parse("RECORDER_FPS")? {
            self.source.fps = fps;
        }
        if let Some(path) = env_string("RECORDER_FFMPEG") {
            self.source.ffmpeg_path = PathBuf::from(path);
        }
        if let Some(ms) = env_parse("RECORDER_READ_RETRY_MS")? {
            self.source.read_retry = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse("RECORDER_DURATION_SECS")? {
            self.recording.duration_secs = secs;
        }
        if let Some(secs) = env_parse("RECORDER_TARGET_DURATION_SECS")? {
            self.recording.target_duration_secs = secs;
        }
        if let Some(ms) = env_parse("RECORDER_SETTLE_DELAY_MS")? {
            self.recording.settle_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse("RECORDER_TRANSCODE_TIMEOUT_SECS")? {
            self.recording.transcode_timeout = Duration::from_secs(secs);
        }
        if let Some(prefix) = env_string("RECORDER_CLIP_PREFIX") {
            self.recording.clip_prefix = prefix;
        }
        if let Some(backend) = env_string("RECORDER_BACKEND") {
            self.detection.backend = backend;
        }
        if let Some(path) = env_string("RECORDER_MODEL_PATH") {
            self.detection.model_path = PathBuf::from(path);
        }
        if let Some(size) = env_parse("RECORDER_MODEL_INPUT_SIZE")? {
            self.detection.model_input_size = size;
        }
        if let Some(class) = env_parse("RECORDER_TARGET_CLASS")? {
            self.detection.target_class = class;
        }
        if let Some(threshold) = env_parse("RECORDER_CONFIDENCE_THRESHOLD")? {
            self.detection.confidence_threshold = threshold;
        }
        if let Some(secs) = env_parse("RECORDER_COOLDOWN_SECS")? {
            self.detection.cooldown = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse("RECORDER_SAMPLE_EVERY")? {
            self.detection.sample_every_n_frames = n;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.video_dir.as_os_str().is_empty() {
            return Err(anyhow!("video_dir must not be empty"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!(
                "frame size must be non-zero (got {}x{})",
                self.source.width,
                self.source.height
            ));
        }
        if self.source.fps == 0 {
            return Err(anyhow!("fps must be >= 1"));
        }
        for (name, value) in [
            ("duration_secs", self.recording.duration_secs),
            ("target_duration_secs", self.recording.target_duration_secs),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(anyhow!("{} must be greater than zero (got {})", name, value));
            }
        }
        if self.capture_frames() == 0 {
            return Err(anyhow!(
                "recording of {}s at {} fps captures no frames",
                self.recording.duration_secs,
                self.source.fps
            ));
        }
        if self.recording.transcode_timeout.is_zero() {
            return Err(anyhow!("transcode timeout must be greater than zero"));
        }
        if self.recording.clip_prefix.trim().is_empty()
            || self.recording.clip_prefix.contains(std::path::MAIN_SEPARATOR)
        {
            return Err(anyhow!(
                "clip_prefix must be a non-empty file name fragment"
            ));
        }
        let threshold = self.detection.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "confidence_threshold must be within [0, 1] (got {})",
                threshold
            ));
        }
        if self.detection.sample_every_n_frames == 0 {
            return Err(anyhow!("sample_every_n_frames must be >= 1"));
        }
        if self.detection.model_input_size == 0 {
            return Err(anyhow!("model_input_size must be >= 1"));
        }
        Ok(())
    }

    /// Frames per recording: `duration_secs * fps`, truncated.
    pub fn capture_frames(&self) -> u32 {
        (self.recording.duration_secs * self.source.fps as f64) as u32
    }

    /// Ratio of recorded to target duration.
    pub fn speed_factor(&self) -> f64 {
        self.recording.duration_secs / self.recording.target_duration_secs
    }
}

fn read_config_file(path: &Path) -> Result<RecorderConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
    } else {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value '{}'", key, value)),
        None => Ok(None),
    }
}
