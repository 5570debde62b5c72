#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::Classifier;
use crate::detect::result::Detection;
use crate::frame::{Frame, BYTES_PER_PIXEL};

/// Rows scoring below this are dropped before they reach the gate.
const MIN_REPORTED_CONFIDENCE: f32 = 0.05;

/// Tract-based YOLO classifier for ONNX exports.
///
/// Expects a single `[1, N, 5 + classes]` output: `cx, cy, w, h, objectness`
/// followed by per-class scores. Each row becomes one `Detection` whose
/// confidence is `objectness * best class score`.
pub struct TractClassifier {
    model: TypedRunnableModel<TypedModel>,
    input_width: u32,
    input_height: u32,
}

impl TractClassifier {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_width: u32, input_height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        if !model_path.exists() {
            return Err(anyhow!(
                "model file not found: {} (export YOLOv7-tiny weights to ONNX, e.g. \
                 `python export.py --weights yolov7-tiny.pt --img-size {}`)",
                model_path.display(),
                input_width
            ));
        }
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_height as usize, input_width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        log::info!(
            "TractClassifier: loaded {} ({}x{} input)",
            model_path.display(),
            input_width,
            input_height
        );

        Ok(Self {
            model,
            input_width,
            input_height,
        })
    }

    /// Nearest-neighbour resize into a normalized NCHW tensor.
    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        if frame.width == 0 || frame.height == 0 {
            return Err(anyhow!("cannot classify an empty frame"));
        }
        let pixels = frame.pixels();
        let src_w = frame.width as usize;
        let src_h = frame.height as usize;
        let dst_w = self.input_width as usize;
        let dst_h = self.input_height as usize;

        let input = tract_ndarray::Array4::from_shape_fn((1, 3, dst_h, dst_w), |(_, c, y, x)| {
            let sx = x * src_w / dst_w;
            let sy = y * src_h / dst_h;
            let idx = (sy * src_w + sx) * BYTES_PER_PIXEL + c;
            pixels.get(idx).copied().unwrap_or(0) as f32 / 255.0
        });

        Ok(input.into_tensor())
    }

    fn extract_detections(&self, outputs: TVec<TValue>) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[2] < 6 {
            return Err(anyhow!(
                "unexpected model output shape {:?} (want [1, N, 5 + classes])",
                shape
            ));
        }
        let cols = shape[2];
        let flat: Vec<f32> = view.iter().copied().collect();
        Ok(decode_rows(&flat, cols))
    }
}

/// Decode raw YOLO head rows into detections.
fn decode_rows(flat: &[f32], cols: usize) -> Vec<Detection> {
    flat.chunks_exact(cols)
        .filter_map(|row| {
            let objectness = row[4];
            let (class_id, class_score) = row[5..]
                .iter()
                .copied()
                .enumerate()
                .fold((0usize, f32::NEG_INFINITY), |best, (idx, score)| {
                    if score > best.1 {
                        (idx, score)
                    } else {
                        best
                    }
                });
            let confidence = objectness * class_score;
            if confidence.is_finite() && confidence >= MIN_REPORTED_CONFIDENCE {
                Some(Detection::new(class_id as u32, confidence.min(1.0)))
            } else {
                None
            }
        })
        .collect()
}

impl Classifier for TractClassifier {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.extract_detections(outputs)
    }
}
