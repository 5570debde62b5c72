//! Scripted frame source for deterministic runs.
//!
//! Replays a fixed sequence of reads: frames, transient failures, and an
//! optional end-of-stream. Once the script is exhausted the source reports
//! end-of-stream.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

/// One scripted read outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptedRead {
    /// Produce the next frame.
    Frame,
    /// Fail this read with a transient error.
    Fail,
}

pub struct ScriptedSource {
    name: String,
    width: u32,
    height: u32,
    script: VecDeque<ScriptedRead>,
    frame_count: u64,
    read_failures: u64,
    closed: Arc<AtomicBool>,
}

impl ScriptedSource {
    pub fn new(width: u32, height: u32, script: impl IntoIterator<Item = ScriptedRead>) -> Self {
        Self {
            name: "scripted".to_string(),
            width,
            height,
            script: script.into_iter().collect(),
            frame_count: 0,
            read_failures: 0,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A source that yields `count` frames and then ends.
    pub fn frames(count: usize, width: u32, height: u32) -> Self {
        Self::new(width, height, std::iter::repeat(ScriptedRead::Frame).take(count))
    }

    /// Flag set once `close` has been called; survives boxing the source.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl FrameSource for ScriptedSource {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("scripted source closed"));
        }
        match self.script.pop_front() {
            Some(ScriptedRead::Frame) => {
                self.frame_count += 1;
                // Vary the fill so consecutive frames differ.
                let shade = (self.frame_count % 256) as u8;
                Frame::solid(self.frame_count, self.width, self.height, [shade, 64, 128]).map(Some)
            }
            Some(ScriptedRead::Fail) => {
                self.read_failures += 1;
                Err(anyhow!("scripted read failure"))
            }
            None => Ok(None),
        }
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            read_failures: self.read_failures,
            source: self.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_script_then_ends() -> Result<()> {
        let mut source = ScriptedSource::new(
            4,
            4,
            [ScriptedRead::Frame, ScriptedRead::Fail, ScriptedRead::Frame],
        );
        assert_eq!(source.next_frame()?.map(|f| f.seq), Some(1));
        assert!(source.next_frame().is_err());
        assert_eq!(source.next_frame()?.map(|f| f.seq), Some(2));
        assert!(source.next_frame()?.is_none());
        assert_eq!(source.stats().read_failures, 1);
        Ok(())
    }

    #[test]
    fn close_is_observable_through_flag() {
        let mut source = ScriptedSource::frames(1, 2, 2);
        let flag = source.closed_flag();
        source.close();
        assert!(flag.load(Ordering::SeqCst));
        assert!(source.next_frame().is_err());
    }
}
