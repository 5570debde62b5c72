use anyhow::{anyhow, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use presence_recorder::detect::ScriptedClassifier;
use presence_recorder::gate::GatePolicy;
use presence_recorder::ingest::{FrameSource, ScriptedSource, SourceStats};
use presence_recorder::layout::is_temp_artifact;
use presence_recorder::{
    Classifier, ClipLayout, ClipSink, Codec, Detection, DetectionLoop, Frame, LoopSettings,
    LoopState, SinkFactory, SinkSpec, TranscodeError, Transcoder,
};

const WIDTH: u32 = 4;
const HEIGHT: u32 = 4;
const FRAME_BYTES: u64 = (WIDTH * HEIGHT * 3) as u64;

struct FileSinks;

struct FileSink(File);

impl ClipSink for FileSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.0.write_all(frame.pixels())?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.0.sync_all()?;
        Ok(())
    }
}

impl SinkFactory for FileSinks {
    fn open(&self, path: &Path, _codec: Codec, _spec: &SinkSpec) -> Result<Box<dyn ClipSink>> {
        Ok(Box::new(FileSink(File::create(path)?)))
    }
}

struct BrokenSinks;

impl SinkFactory for BrokenSinks {
    fn open(&self, _path: &Path, codec: Codec, _spec: &SinkSpec) -> Result<Box<dyn ClipSink>> {
        Err(anyhow!("{} unavailable", codec))
    }
}

/// Keeps every other byte, standing in for a shorter re-encoded clip.
struct HalvingTranscoder {
    coefficients: Arc<Mutex<Vec<f64>>>,
}

impl Transcoder for HalvingTranscoder {
    fn retime(&self, input: &Path, coefficient: f64, output: &Path) -> Result<(), TranscodeError> {
        self.coefficients.lock().unwrap().push(coefficient);
        let raw = fs::read(input).map_err(TranscodeError::Wait)?;
        let halved: Vec<u8> = raw.iter().step_by(2).copied().collect();
        fs::write(output, halved).map_err(TranscodeError::Wait)?;
        Ok(())
    }
}

struct FailingTranscoder;

impl Transcoder for FailingTranscoder {
    fn retime(&self, _input: &Path, _coef: f64, _output: &Path) -> Result<(), TranscodeError> {
        Err(TranscodeError::Timeout(Duration::from_secs(30)))
    }
}

fn settings(capture_frames: u32, cooldown: Duration) -> LoopSettings {
    LoopSettings {
        sample_every_n_frames: 5,
        gate: GatePolicy {
            target_class: 0,
            confidence_threshold: 0.45,
            cooldown_period: cooldown,
        },
        capture_frames,
        sink_spec: SinkSpec {
            width: WIDTH,
            height: HEIGHT,
            fps: 30,
        },
        speed_factor: 5.0 / 3.0,
        settle_delay: Duration::ZERO,
        read_retry: Duration::ZERO,
        health_log_interval: Duration::from_secs(3600),
    }
}

fn clips_in(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .expect("read video dir")
        .map(|entry| entry.expect("dir entry").path())
        .collect();
    paths.sort();
    paths
}

#[test]
fn single_detection_produces_one_sped_up_clip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let classifier =
        ScriptedClassifier::new().with_detections(30, vec![Detection::new(0, 0.8)]);
    let calls = classifier.calls_handle();
    let coefficients = Arc::new(Mutex::new(Vec::new()));
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&transitions);

    let summary = DetectionLoop::new(
        Box::new(ScriptedSource::frames(150, WIDTH, HEIGHT)),
        Box::new(classifier),
        Box::new(FileSinks),
        Box::new(HalvingTranscoder {
            coefficients: Arc::clone(&coefficients),
        }),
        ClipLayout::new(dir.path(), "person_detected"),
        settings(50, Duration::from_secs(30)),
    )
    .on_transition(move |from, to| seen.lock().unwrap().push((from, to)))
    .run();

    // Frames 31..=80 go to the clip; the loop reads the remaining 70.
    assert_eq!(summary.frames_read, 100);
    assert_eq!(summary.triggers, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(summary.transform_fallbacks, 0);
    assert_eq!(summary.clips.len(), 1);

    let on_disk = clips_in(dir.path());
    assert_eq!(on_disk, summary.clips);
    let clip = &on_disk[0];
    assert!(!is_temp_artifact(clip));
    let name = clip.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    assert!(name.starts_with("person_detected_"), "{name}");
    assert!(name.ends_with(".mp4"), "{name}");
    assert_eq!(fs::metadata(clip)?.len(), 50 * FRAME_BYTES / 2);

    let coefficients = coefficients.lock().unwrap();
    assert_eq!(coefficients.len(), 1);
    assert!((coefficients[0] - 0.6).abs() < 1e-9);

    assert_eq!(
        *transitions.lock().unwrap(),
        vec![
            (LoopState::Idle, LoopState::Capturing),
            (LoopState::Capturing, LoopState::Settling),
            (LoopState::Settling, LoopState::Suppressed),
            (LoopState::Suppressed, LoopState::Stopped),
        ]
    );
    Ok(())
}

#[test]
fn transcoder_failure_keeps_raw_capture() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let classifier = ScriptedClassifier::new().with_detections(5, vec![Detection::new(0, 0.9)]);

    let summary = DetectionLoop::new(
        Box::new(ScriptedSource::frames(40, WIDTH, HEIGHT)),
        Box::new(classifier),
        Box::new(FileSinks),
        Box::new(FailingTranscoder),
        ClipLayout::new(dir.path(), "person_detected"),
        settings(20, Duration::from_secs(30)),
    )
    .run();

    assert_eq!(summary.transform_fallbacks, 1);
    let on_disk = clips_in(dir.path());
    assert_eq!(on_disk, summary.clips);
    assert!(!is_temp_artifact(&on_disk[0]));
    assert_eq!(fs::metadata(&on_disk[0])?.len(), 20 * FRAME_BYTES);
    Ok(())
}

#[test]
fn failed_capture_skips_transform_and_cools_down() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let classifier = ScriptedClassifier::new()
        .with_detections(5, vec![Detection::new(0, 0.9)])
        .with_detections(10, vec![Detection::new(0, 0.9)]);
    let calls = classifier.calls_handle();
    let coefficients = Arc::new(Mutex::new(Vec::new()));

    let summary = DetectionLoop::new(
        Box::new(ScriptedSource::frames(30, WIDTH, HEIGHT)),
        Box::new(classifier),
        Box::new(BrokenSinks),
        Box::new(HalvingTranscoder {
            coefficients: Arc::clone(&coefficients),
        }),
        ClipLayout::new(dir.path(), "person_detected"),
        settings(10, Duration::from_secs(30)),
    )
    .run();

    assert_eq!(summary.triggers, 1);
    assert_eq!(summary.capture_failures, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(coefficients.lock().unwrap().is_empty());
    assert!(clips_in(dir.path()).is_empty());
    Ok(())
}

#[test]
fn low_confidence_and_other_classes_never_trigger() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let classifier = ScriptedClassifier::new()
        .with_detections(5, vec![Detection::new(0, 0.3)])
        .with_detections(10, vec![Detection::new(2, 0.99)])
        .with_detections(15, vec![Detection::new(0, 0.44)]);

    let summary = DetectionLoop::new(
        Box::new(ScriptedSource::frames(20, WIDTH, HEIGHT)),
        Box::new(classifier),
        Box::new(FileSinks),
        Box::new(FailingTranscoder),
        ClipLayout::new(dir.path(), "person_detected"),
        settings(10, Duration::ZERO),
    )
    .run();

    assert_eq!(summary.frames_classified, 4);
    assert_eq!(summary.triggers, 0);
    assert!(clips_in(dir.path()).is_empty());
    Ok(())
}

#[test]
fn stop_during_detection_finishes_the_clip_first() -> Result<()> {
    struct StopOnDetect {
        inner: ScriptedClassifier,
        stop: Arc<AtomicBool>,
    }

    impl Classifier for StopOnDetect {
        fn name(&self) -> &'static str {
            "stop-on-detect"
        }

        fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
            let detections = self.inner.infer(frame)?;
            if !detections.is_empty() {
                self.stop.store(true, Ordering::SeqCst);
            }
            Ok(detections)
        }
    }

    let dir = tempfile::tempdir()?;
    let stop = Arc::new(AtomicBool::new(false));
    let source = ScriptedSource::frames(100, WIDTH, HEIGHT);
    let closed = source.closed_flag();

    let summary = DetectionLoop::new(
        Box::new(source),
        Box::new(StopOnDetect {
            inner: ScriptedClassifier::new().with_detections(10, vec![Detection::new(0, 0.7)]),
            stop: Arc::clone(&stop),
        }),
        Box::new(FileSinks),
        Box::new(FailingTranscoder),
        ClipLayout::new(dir.path(), "person_detected"),
        settings(15, Duration::from_secs(30)),
    )
    .with_stop_flag(stop)
    .run();

    assert_eq!(summary.frames_read, 10);
    assert_eq!(summary.clips.len(), 1);
    assert_eq!(fs::metadata(&summary.clips[0])?.len(), 15 * FRAME_BYTES);
    assert!(closed.load(Ordering::SeqCst));
    Ok(())
}

/// Delays every read, so wall-clock time passes while frames flow.
struct PacedSource {
    inner: ScriptedSource,
    interval: Duration,
}

impl FrameSource for PacedSource {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    fn connect(&mut self) -> Result<()> {
        self.inner.connect()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        std::thread::sleep(self.interval);
        self.inner.next_frame()
    }

    fn stats(&self) -> SourceStats {
        self.inner.stats()
    }
}

/// Reports a confident target detection on its first `positives` calls.
struct FirstCallsPositive {
    positives: u64,
    calls: u64,
}

impl Classifier for FirstCallsPositive {
    fn name(&self) -> &'static str {
        "first-calls-positive"
    }

    fn infer(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        self.calls += 1;
        if self.calls <= self.positives {
            Ok(vec![Detection::new(0, 0.9)])
        } else {
            Ok(Vec::new())
        }
    }
}

#[test]
fn detection_after_cooldown_records_a_second_clip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&transitions);

    let summary = DetectionLoop::new(
        Box::new(PacedSource {
            inner: ScriptedSource::frames(400, WIDTH, HEIGHT),
            interval: Duration::from_millis(5),
        }),
        Box::new(FirstCallsPositive {
            positives: 2,
            calls: 0,
        }),
        Box::new(FileSinks),
        Box::new(FailingTranscoder),
        ClipLayout::new(dir.path(), "person_detected"),
        settings(5, Duration::from_millis(300)),
    )
    .on_transition(move |from, to| seen.lock().unwrap().push((from, to)))
    .run();

    assert_eq!(summary.triggers, 2);
    assert_eq!(summary.clips.len(), 2);
    assert_ne!(summary.clips[0], summary.clips[1]);
    assert_eq!(clips_in(dir.path()).len(), 2);

    use LoopState::*;
    assert_eq!(
        *transitions.lock().unwrap(),
        vec![
            (Idle, Capturing),
            (Capturing, Settling),
            (Settling, Suppressed),
            (Suppressed, Idle),
            (Idle, Capturing),
            (Capturing, Settling),
            (Settling, Suppressed),
            (Suppressed, Idle),
            (Idle, Stopped),
        ]
    );
    Ok(())
}

#[cfg(unix)]
#[test]
fn camera_process_exit_is_retried_not_fatal() -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    struct StopAfter {
        calls: u64,
        limit: u64,
        stop: Arc<AtomicBool>,
    }

    impl Classifier for StopAfter {
        fn name(&self) -> &'static str {
            "stop-after"
        }

        fn infer(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            self.calls += 1;
            if self.calls >= self.limit {
                self.stop.store(true, Ordering::SeqCst);
            }
            Ok(Vec::new())
        }
    }

    let dir = tempfile::tempdir()?;
    // Three 4x4 frames per run, then a non-zero exit.
    let ffmpeg = dir.path().join("ffmpeg");
    fs::write(&ffmpeg, "#!/bin/sh\nhead -c 144 /dev/zero\nexit 1\n")?;
    fs::set_permissions(&ffmpeg, fs::Permissions::from_mode(0o755))?;

    let mut source_settings = presence_recorder::RecorderConfig::defaults().source;
    source_settings.input = Some("/dev/video0".to_string());
    source_settings.width = WIDTH;
    source_settings.height = HEIGHT;
    source_settings.ffmpeg_path = ffmpeg;
    source_settings.read_retry = Duration::ZERO;
    let source = presence_recorder::open_source(&source_settings)?;

    let stop = Arc::new(AtomicBool::new(false));
    let mut loop_settings = settings(10, Duration::from_secs(30));
    loop_settings.sample_every_n_frames = 1;
    let summary = DetectionLoop::new(
        source,
        Box::new(StopAfter {
            calls: 0,
            limit: 7,
            stop: Arc::clone(&stop),
        }),
        Box::new(FileSinks),
        Box::new(FailingTranscoder),
        ClipLayout::new(dir.path(), "person_detected"),
        loop_settings,
    )
    .with_stop_flag(stop)
    .run();

    // 3 + 3 + 1 frames across three ffmpeg runs, with a failed read between runs.
    assert_eq!(summary.frames_read, 7);
    assert_eq!(summary.read_failures, 2);
    Ok(())
}
