//! Local file frame source using FFmpeg in-process.
//!
//! Decodes the best video stream of a local file and rescales every frame to
//! the configured RGB24 resolution. The end of the file is reported as
//! end-of-stream.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use std::time::Instant;

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

/// Configuration for a local file source.
#[derive(Clone, Debug)]
pub struct FileConfig {
    /// Local file path (e.g., "/var/lib/recorder/replay.mp4").
    pub path: String,
    pub width: u32,
    pub height: u32,
    /// Nominal frame rate, used only for logging.
    pub target_fps: u32,
}

struct FileDecoder {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
}

pub struct FileSource {
    config: FileConfig,
    decoder: Option<FileDecoder>,
    frame_count: u64,
    read_failures: u64,
    eof_sent: bool,
    ended: bool,
    last_frame_at: Option<Instant>,
}

impl FileSource {
    pub fn new(config: FileConfig) -> Result<Self> {
        if config.path.trim().is_empty() || config.path.contains("://") {
            return Err(anyhow!(
                "file ingestion only supports local paths (got '{}')",
                config.path
            ));
        }
        Ok(Self {
            config,
            decoder: None,
            frame_count: 0,
            read_failures: 0,
            eof_sent: false,
            ended: false,
            last_frame_at: None,
        })
    }

    fn open_decoder(&self) -> Result<FileDecoder> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&self.config.path).with_context(|| {
            format!("failed to open file input '{}' with ffmpeg", self.config.path)
        })?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            self.config.width,
            self.config.height,
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(FileDecoder {
            input,
            stream_index,
            decoder,
            scaler,
        })
    }

    fn emit(&mut self, rgb_frame: &ffmpeg::frame::Video) -> Result<Option<Frame>> {
        let pixels = frame_to_pixels(rgb_frame)?;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Frame::new(
            self.frame_count,
            rgb_frame.width(),
            rgb_frame.height(),
            pixels,
        )
        .map(Some)
    }

    fn decode_next(&mut self) -> Result<Option<Frame>> {
        let Some(state) = self.decoder.as_mut() else {
            return Err(anyhow!("file source {} not connected", self.config.path));
        };
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb_frame = ffmpeg::frame::Video::empty();

        loop {
            if state.decoder.receive_frame(&mut decoded).is_ok() {
                state
                    .scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                return self.emit(&rgb_frame);
            }
            if self.eof_sent {
                self.ended = true;
                return Ok(None);
            }
            let next_packet = state
                .input
                .packets()
                .find(|(stream, _)| stream.index() == state.stream_index)
                .map(|(_, packet)| packet);
            match next_packet {
                Some(packet) => state
                    .decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?,
                None => {
                    state
                        .decoder
                        .send_eof()
                        .context("flush ffmpeg decoder")?;
                    self.eof_sent = true;
                }
            }
        }
    }
}

impl FrameSource for FileSource {
    fn describe(&self) -> String {
        format!("file:{}", self.config.path)
    }

    fn connect(&mut self) -> Result<()> {
        self.decoder = Some(self.open_decoder()?);
        self.eof_sent = false;
        self.ended = false;
        log::info!(
            "FileSource: connected to {} (ffmpeg, nominal {} fps)",
            self.config.path,
            self.config.target_fps
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.ended {
            return Ok(None);
        }
        self.decode_next().map_err(|err| {
            self.read_failures += 1;
            err
        })
    }

    fn close(&mut self) {
        if self.decoder.take().is_some() {
            log::info!("FileSource: released {}", self.config.path);
        }
    }

    fn is_healthy(&self) -> bool {
        self.decoder.is_some() && !self.ended
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            read_failures: self.read_failures,
            source: self.describe(),
        }
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<Vec<u8>> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return data
            .get(..row_bytes * height as usize)
            .map(|px| px.to_vec())
            .context("ffmpeg frame is shorter than its dimensions");
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok(pixels)
}
