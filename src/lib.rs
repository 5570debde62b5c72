//! Presence recorder
//!
//! Watches a single camera, classifies a sample of its frames, and when the
//! target class is seen records a short clip, time-compresses it, and stores
//! it in the video directory. A cooldown window suppresses back-to-back
//! recordings of the same event.
//!
//! # Module Structure
//!
//! - `frame`: RGB frame buffers
//! - `ingest`: Frame sources (ffmpeg device/file pipe, V4L2, synthetic, scripted)
//! - `detect`: Classifier backends (tract ONNX, scripted)
//! - `gate`: Trigger policy and cooldown
//! - `capture`: Fixed-length clip recording with codec fallback
//! - `transform`: Clip speed-up via ffmpeg, with raw fallback
//! - `layout`: Clip naming under the video directory
//! - `pipeline`: The detection loop state machine
//! - `config`: File + environment configuration

pub mod capture;
pub mod config;
pub mod detect;
pub mod frame;
pub mod gate;
pub mod ingest;
pub mod layout;
pub mod pipeline;
mod subprocess;
pub mod transform;

pub use capture::{
    capture, CaptureError, CaptureRequest, CaptureResult, ClipSink, Codec, FfmpegSinkFactory,
    SinkFactory, SinkSpec,
};
pub use config::RecorderConfig;
pub use detect::{build_classifier, Classifier, Detection};
pub use frame::Frame;
pub use gate::{should_trigger, CooldownState, GatePolicy};
pub use ingest::{open_source, FrameSource, SourceStats};
pub use layout::ClipLayout;
pub use pipeline::{DetectionLoop, LoopSettings, LoopState, RunSummary};
pub use transform::{speed_up, FfmpegTranscoder, FinalClip, TranscodeError, Transcoder};
