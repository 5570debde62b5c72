use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::detect::backend::Classifier;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Scripted classifier. Returns preset detections keyed by frame sequence
/// number and nothing for every other frame.
///
/// Used for `stub` dry runs (empty script) and deterministic tests.
#[derive(Default)]
pub struct ScriptedClassifier {
    script: HashMap<u64, Vec<Detection>>,
    failures: HashSet<u64>,
    calls: Arc<AtomicU64>,
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `detections` when frame `seq` is classified.
    pub fn with_detections(mut self, seq: u64, detections: Vec<Detection>) -> Self {
        self.script.insert(seq, detections);
        self
    }

    /// Fail inference for frame `seq`.
    pub fn with_failure(mut self, seq: u64) -> Self {
        self.failures.insert(seq);
        self
    }

    /// Shared counter of `infer` calls; survives boxing the classifier.
    pub fn calls_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.calls)
    }
}

impl Classifier for ScriptedClassifier {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failures.contains(&frame.seq) {
            return Err(anyhow!("scripted inference failure on frame {}", frame.seq));
        }
        Ok(self.script.get(&frame.seq).cloned().unwrap_or_default())
    }
}
