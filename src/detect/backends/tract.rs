#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::result::Detection;
use crate::frame::{FrameView, PixelFormat};
use crate::metadata::{BoundingBox, ObjectClass};
use crate::stage::convert::nv12_to_rgb;

/// Tract-based ONNX detector.
///
/// Expects a model taking `[1, 3, H, W]` RGB input in 0..1 and producing
/// `[1, N, 6]` rows of `x1, y1, x2, y2, score, class` in input pixel coordinates.
/// Rows with an unknown class id are skipped.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    width: u32,
    height: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
        })
    }

    fn build_input(&self, frame: &FrameView<'_>) -> Result<Tensor> {
        if frame.width() != self.width || frame.height() != self.height {
            return Err(anyhow!(
                "frame size {}x{} does not match model input {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            ));
        }
        let expected = frame.format().buffer_len(frame.width(), frame.height());
        let pixels = frame.pixels();
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} bytes of {:?}, received {}",
                expected,
                frame.format(),
                pixels.len()
            ));
        }

        let width = self.width as usize;
        let height = self.height as usize;
        let format = frame.format();
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, height, width), |(_, c, y, x)| {
            let rgb = match format {
                PixelFormat::Rgba => {
                    let idx = (y * width + x) * 4;
                    [pixels[idx], pixels[idx + 1], pixels[idx + 2]]
                }
                PixelFormat::Nv12 => {
                    let luma = pixels[y * width + x];
                    let chroma = width * height + (y / 2) * width + (x / 2) * 2;
                    nv12_to_rgb(luma, pixels[chroma], pixels[chroma + 1])
                }
            };
            rgb[c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn extract_detections(&self, outputs: TVec<TValue>) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let rows = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = rows.shape().to_vec();
        if shape.len() != 3 || shape[2] < 6 {
            return Err(anyhow!("unexpected detector output shape {:?}", shape));
        }
        let mut detections = Vec::new();
        for n in 0..shape[1] {
            let v = |i: usize| rows[&[0, n, i][..]];
            let Some(class) = ObjectClass::from_id(v(5).max(0.0) as u32) else {
                continue;
            };
            let bbox = BoundingBox::new(v(0), v(1), v(2) - v(0), v(3) - v(1))
                .clamp_to(self.width, self.height);
            detections.push(Detection {
                class,
                bbox,
                confidence: v(4),
            });
        }
        Ok(detections)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::ObjectDetection)
    }

    fn detect(&mut self, frame: &FrameView<'_>) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.extract_detections(outputs)
    }
}
