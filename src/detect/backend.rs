use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Frame classifier capability.
///
/// Implementations are synchronous and CPU-bound. A frame may yield zero or
/// many detections; the caller decides what qualifies as a trigger.
pub trait Classifier: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run inference on a frame.
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once at startup.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
