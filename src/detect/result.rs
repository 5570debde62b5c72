/// One classifier output for a frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    /// Model class identifier (COCO index for the bundled YOLO exports; 0 = person).
    pub class_id: u32,
    /// Score in `0.0..=1.0`.
    pub confidence: f32,
}

impl Detection {
    pub fn new(class_id: u32, confidence: f32) -> Self {
        Self {
            class_id,
            confidence,
        }
    }

    /// True when this detection is for `class_id` and scores at least `threshold`.
    pub fn qualifies(&self, class_id: u32, threshold: f32) -> bool {
        self.class_id == class_id && self.confidence >= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualifies_at_threshold_boundary() {
        let det = Detection::new(0, 0.45);
        assert!(det.qualifies(0, 0.45));
        assert!(!det.qualifies(0, 0.46));
        assert!(!det.qualifies(2, 0.1));
    }
}
