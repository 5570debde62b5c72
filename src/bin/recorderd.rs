//! recorderd - presence recorder daemon
//!
//! This daemon:
//! 1. Opens the configured camera (fatal if it cannot deliver a frame)
//! 2. Loads the classifier (fatal if the model is missing)
//! 3. Classifies every Nth frame for the target class
//! 4. Records, speeds up, and stores a clip on each trigger
//! 5. Stops cleanly on Ctrl-C once any in-flight clip is finished

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use presence_recorder::{
    build_classifier, open_source, ClipLayout, DetectionLoop, FfmpegSinkFactory,
    FfmpegTranscoder, LoopSettings, RecorderConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Record time-compressed clips when a person is detected")]
struct Args {
    /// Config file (TOML, or JSON with a .json extension).
    #[arg(long, env = "RECORDER_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = RecorderConfig::load(args.config.as_deref())?;

    log::info!("recorderd v{} starting", env!("CARGO_PKG_VERSION"));
    log::info!(
        "source={} {}x{}@{}fps, clip {}s -> {}s, cooldown {}s, sampling every {} frames",
        cfg.source.resolved_input(),
        cfg.source.width,
        cfg.source.height,
        cfg.source.fps,
        cfg.recording.duration_secs,
        cfg.recording.target_duration_secs,
        cfg.detection.cooldown.as_secs(),
        cfg.detection.sample_every_n_frames
    );

    let layout = ClipLayout::new(&cfg.video_dir, cfg.recording.clip_prefix.clone());
    layout.ensure_dir()?;
    log::info!("saving clips to {}", layout.dir().display());

    let classifier = build_classifier(&cfg.detection)?;
    let source = open_source(&cfg.source)?;

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        handler_stop.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let detection_loop = DetectionLoop::new(
        source,
        classifier,
        Box::new(FfmpegSinkFactory::new(&cfg.source.ffmpeg_path)),
        Box::new(FfmpegTranscoder::new(
            &cfg.source.ffmpeg_path,
            cfg.recording.transcode_timeout,
        )),
        layout,
        LoopSettings::from_config(&cfg),
    )
    .with_stop_flag(stop);

    log::info!("monitoring for target class {}... (Ctrl-C to stop)", cfg.detection.target_class);
    let summary = detection_loop.run();

    log::info!(
        "recorderd stopped: {} clips recorded, {} triggers, {} capture failures",
        summary.clips.len(),
        summary.triggers,
        summary.capture_failures
    );
    for clip in &summary.clips {
        log::info!("  {}", clip.display());
    }
    Ok(())
}
