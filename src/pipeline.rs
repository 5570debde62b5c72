//! Detection loop.
//!
//! A single thread of control reads frames, classifies every Nth one, and on a
//! trigger runs capture and transform synchronously before sampling again.
//!
//! States:
//! - `Idle`: sampling and classifying
//! - `Suppressed`: inside the cooldown window, sampled frames are skipped
//! - `Capturing`: capture + transform in progress; nothing is classified
//! - `Settling`: short pause after a completed sequence
//! - `Stopped`: terminal; the source has been released
//!
//! Stop requests are observed between iterations only. A sequence that has
//! started always runs to completion (including the settle pause).

use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capture::{capture, CaptureRequest, SinkFactory, SinkSpec};
use crate::config::RecorderConfig;
use crate::detect::Classifier;
use crate::gate::{qualifying_detection, should_trigger, CooldownState, GatePolicy};
use crate::ingest::FrameSource;
use crate::layout::ClipLayout;
use crate::transform::{speed_up, Transcoder};

const DEFAULT_HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Suppressed,
    Capturing,
    Settling,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct LoopSettings {
    /// Only frames whose loop counter is a multiple of this are classified.
    pub sample_every_n_frames: u64,
    pub gate: GatePolicy,
    /// Frames per recording.
    pub capture_frames: u32,
    pub sink_spec: SinkSpec,
    /// Original / target duration.
    pub speed_factor: f64,
    pub settle_delay: Duration,
    pub read_retry: Duration,
    pub health_log_interval: Duration,
}

impl LoopSettings {
    pub fn from_config(cfg: &RecorderConfig) -> Self {
        Self {
            sample_every_n_frames: cfg.detection.sample_every_n_frames,
            gate: GatePolicy {
                target_class: cfg.detection.target_class,
                confidence_threshold: cfg.detection.confidence_threshold,
                cooldown_period: cfg.detection.cooldown,
            },
            capture_frames: cfg.capture_frames(),
            sink_spec: SinkSpec {
                width: cfg.source.width,
                height: cfg.source.height,
                fps: cfg.source.fps,
            },
            speed_factor: cfg.speed_factor(),
            settle_delay: cfg.recording.settle_delay,
            read_retry: cfg.source.read_retry,
            health_log_interval: DEFAULT_HEALTH_LOG_INTERVAL,
        }
    }
}

/// Counters reported when the loop stops.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Frames read by the loop itself (frames consumed by captures excluded).
    pub frames_read: u64,
    pub read_failures: u64,
    pub frames_classified: u64,
    pub inference_failures: u64,
    pub triggers: u64,
    pub capture_failures: u64,
    /// Clips kept untransformed because the transcoder failed.
    pub transform_fallbacks: u64,
    /// Finalized clips, in order.
    pub clips: Vec<PathBuf>,
}

type TransitionObserver = Box<dyn FnMut(LoopState, LoopState) + Send>;

pub struct DetectionLoop {
    source: Box<dyn FrameSource>,
    classifier: Box<dyn Classifier>,
    sinks: Box<dyn SinkFactory>,
    transcoder: Box<dyn Transcoder>,
    layout: ClipLayout,
    settings: LoopSettings,
    cooldown: CooldownState,
    frame_counter: u64,
    state: LoopState,
    stop: Arc<AtomicBool>,
    observer: Option<TransitionObserver>,
    summary: RunSummary,
}

impl DetectionLoop {
    pub fn new(
        source: Box<dyn FrameSource>,
        classifier: Box<dyn Classifier>,
        sinks: Box<dyn SinkFactory>,
        transcoder: Box<dyn Transcoder>,
        layout: ClipLayout,
        mut settings: LoopSettings,
    ) -> Self {
        settings.sample_every_n_frames = settings.sample_every_n_frames.max(1);
        Self {
            source,
            classifier,
            sinks,
            transcoder,
            layout,
            settings,
            cooldown: CooldownState::new(),
            frame_counter: 0,
            state: LoopState::Idle,
            stop: Arc::new(AtomicBool::new(false)),
            observer: None,
            summary: RunSummary::default(),
        }
    }

    /// Share a stop flag (set from a signal handler).
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Observe every state change as `(from, to)`.
    pub fn on_transition(
        mut self,
        observer: impl FnMut(LoopState, LoopState) + Send + 'static,
    ) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn cooldown(&self) -> CooldownState {
        self.cooldown
    }

    /// Run until a stop is requested or the source reports end-of-stream.
    pub fn run(mut self) -> RunSummary {
        let mut last_health_log = Instant::now();

        while !self.stop.load(Ordering::SeqCst) {
            let frame = match self.source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    log::info!("source {} reported end of stream", self.source.describe());
                    break;
                }
                Err(err) => {
                    self.summary.read_failures += 1;
                    log::warn!("failed to read frame, retrying: {:#}", err);
                    std::thread::sleep(self.settings.read_retry);
                    continue;
                }
            };
            self.summary.frames_read += 1;
            self.frame_counter += 1;

            if last_health_log.elapsed() >= self.settings.health_log_interval {
                let stats = self.source.stats();
                log::info!(
                    "source health={} frames={} read_failures={} source={}",
                    self.source.is_healthy(),
                    stats.frames_captured,
                    stats.read_failures,
                    stats.source
                );
                last_health_log = Instant::now();
            }

            if self.frame_counter % self.settings.sample_every_n_frames != 0 {
                continue;
            }

            let now = Instant::now();
            if self
                .cooldown
                .is_cooling_down(now, self.settings.gate.cooldown_period)
            {
                self.set_state(LoopState::Suppressed);
                continue;
            }
            self.set_state(LoopState::Idle);

            let detections = match self.classifier.infer(&frame) {
                Ok(detections) => detections,
                Err(err) => {
                    self.summary.inference_failures += 1;
                    log::warn!("inference failed on frame {}: {:#}", frame.seq, err);
                    continue;
                }
            };
            self.summary.frames_classified += 1;

            if !should_trigger(&detections, now, &self.cooldown, &self.settings.gate) {
                continue;
            }
            if let Some(det) = qualifying_detection(&detections, &self.settings.gate) {
                log::info!(
                    "target class {} detected! confidence: {:.2}",
                    det.class_id,
                    det.confidence
                );
            }

            // Cooldown is anchored at detection time, whatever the capture outcome.
            self.cooldown.record_trigger(now);
            self.summary.triggers += 1;
            self.set_state(LoopState::Capturing);

            if self.run_sequence() {
                self.set_state(LoopState::Settling);
                std::thread::sleep(self.settings.settle_delay);
            }
            let next = self.resting_state(Instant::now());
            self.set_state(next);
        }

        self.shutdown()
    }

    /// Capture then transform. Returns false when the capture failed.
    fn run_sequence(&mut self) -> bool {
        let temp_path = self.layout.temp_path(Utc::now());
        let request = CaptureRequest {
            output_path: temp_path,
            duration_frames: self.settings.capture_frames,
            spec: self.settings.sink_spec,
        };

        let captured = match capture(self.source.as_mut(), self.sinks.as_ref(), &request) {
            Ok(captured) => captured,
            Err(err) => {
                self.summary.capture_failures += 1;
                log::error!("failed to record video, skipping: {}", err);
                return false;
            }
        };
        log::debug!(
            "captured {} frames ({} bytes, {}) in {:.2}s",
            captured.frame_count,
            captured.byte_size,
            captured.codec,
            captured.elapsed.as_secs_f64()
        );

        let final_path = match self.layout.final_path(&captured.path) {
            Ok(path) => path,
            Err(err) => {
                log::error!("cannot derive clip name: {:#}", err);
                return true;
            }
        };
        match speed_up(
            self.transcoder.as_ref(),
            &captured.path,
            self.settings.speed_factor,
            &final_path,
        ) {
            Ok(clip) => {
                if !clip.transformed {
                    self.summary.transform_fallbacks += 1;
                }
                log::info!("detection complete: {}", clip.path.display());
                self.summary.clips.push(clip.path);
            }
            Err(err) => log::error!("failed to finalize clip: {:#}", err),
        }
        true
    }

    fn resting_state(&self, now: Instant) -> LoopState {
        if self
            .cooldown
            .is_cooling_down(now, self.settings.gate.cooldown_period)
        {
            LoopState::Suppressed
        } else {
            LoopState::Idle
        }
    }

    fn set_state(&mut self, next: LoopState) {
        if next == self.state {
            return;
        }
        log::debug!("detection loop {:?} -> {:?}", self.state, next);
        if let Some(observer) = self.observer.as_mut() {
            observer(self.state, next);
        }
        self.state = next;
    }

    fn shutdown(mut self) -> RunSummary {
        self.set_state(LoopState::Stopped);
        self.source.close();
        log::info!(
            "detection loop stopped: frames={} classified={} triggers={} clips={} capture_failures={} fallbacks={}",
            self.summary.frames_read,
            self.summary.frames_classified,
            self.summary.triggers,
            self.summary.clips.len(),
            self.summary.capture_failures,
            self.summary.transform_fallbacks
        );
        self.summary
    }
}
