use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use presence_recorder::config::{self, RecorderConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in config::ENV_VARS {
        std::env::remove_var(key);
    }
}

fn config_file(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_toml_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".toml",
        r#"
video_dir = "/srv/clips"

[source]
device_index = 2
width = 800
height = 600
fps = 15

[recording]
duration_secs = 4.0
target_duration_secs = 2.0
clip_prefix = "porch"

[detection]
backend = "stub"
confidence_threshold = 0.6
cooldown_secs = 10
"#,
    );

    std::env::set_var("RECORDER_CONFIG", file.path());
    std::env::set_var("RECORDER_FPS", "20");
    std::env::set_var("RECORDER_SAMPLE_EVERY", "3");

    let cfg = RecorderConfig::load(None).expect("load config");

    assert_eq!(cfg.video_dir, PathBuf::from("/srv/clips"));
    assert_eq!(cfg.source.resolved_input(), "/dev/video2");
    assert_eq!((cfg.source.width, cfg.source.height), (800, 600));
    assert_eq!(cfg.source.fps, 20);
    assert_eq!(cfg.capture_frames(), 80);
    assert!((cfg.speed_factor() - 2.0).abs() < 1e-12);
    assert_eq!(cfg.recording.clip_prefix, "porch");
    assert_eq!(cfg.detection.backend, "stub");
    assert_eq!(cfg.detection.confidence_threshold, 0.6);
    assert_eq!(cfg.detection.cooldown, Duration::from_secs(10));
    assert_eq!(cfg.detection.sample_every_n_frames, 3);
    // Untouched keys keep their defaults.
    assert_eq!(cfg.detection.target_class, 0);

    clear_env();
}

#[test]
fn loads_json_file_from_explicit_path() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".json",
        r#"{
            "video_dir": "/data/videos",
            "source": { "input": "stub://bench", "fps": 10 },
            "detection": { "target_class": 2 }
        }"#,
    );

    let cfg = RecorderConfig::load(Some(file.path())).expect("load config");
    assert_eq!(cfg.video_dir, PathBuf::from("/data/videos"));
    assert_eq!(cfg.source.resolved_input(), "stub://bench");
    assert_eq!(cfg.source.fps, 10);
    assert_eq!(cfg.capture_frames(), 50);
    assert_eq!(cfg.detection.target_class, 2);

    clear_env();
}

#[test]
fn prefixed_video_dir_wins_over_legacy_name() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VIDEO_DIR", "/legacy");
    let cfg = RecorderConfig::load(None).expect("load config");
    assert_eq!(cfg.video_dir, PathBuf::from("/legacy"));

    std::env::set_var("RECORDER_VIDEO_DIR", "/preferred");
    let cfg = RecorderConfig::load(None).expect("load config");
    assert_eq!(cfg.video_dir, PathBuf::from("/preferred"));

    clear_env();
}

#[test]
fn rejects_unparseable_env_value() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("RECORDER_COOLDOWN_SECS", "half a minute");
    let err = RecorderConfig::load(None).unwrap_err();
    assert!(err.to_string().contains("RECORDER_COOLDOWN_SECS"), "{err}");

    clear_env();
}

#[test]
fn rejects_unknown_file_keys_and_bad_threshold() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(".toml", "[detection]\nthreshold = 0.5\n");
    assert!(RecorderConfig::load(Some(file.path())).is_err());

    let file = config_file(".toml", "[detection]\nconfidence_threshold = 1.5\n");
    assert!(RecorderConfig::load(Some(file.path())).is_err());

    clear_env();
}
