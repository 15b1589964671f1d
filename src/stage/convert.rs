//! Pixel-format conversion stage: NV12 to RGBA ahead of the overlay.

use anyhow::{bail, Result};

use crate::frame::{Payload, PixelFormat, PortKind};
use crate::stage::{Outbox, Stage};

/// BT.601 limited-range YUV to RGB.
pub fn nv12_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let clip = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clip(298 * c + 409 * e),
        clip(298 * c - 100 * d - 208 * e),
        clip(298 * c + 516 * d),
    ]
}

/// Convert a full NV12 buffer to RGBA with opaque alpha.
pub fn nv12_to_rgba(width: u32, height: u32, nv12: &[u8]) -> Result<Vec<u8>> {
    if width % 2 != 0 || height % 2 != 0 {
        bail!("NV12 needs even dimensions, got {}x{}", width, height);
    }
    let expected = PixelFormat::Nv12.buffer_len(width, height);
    if nv12.len() != expected {
        bail!("expected {} NV12 bytes, got {}", expected, nv12.len());
    }
    let (w, h) = (width as usize, height as usize);
    let (luma, chroma) = nv12.split_at(w * h);
    let mut rgba = Vec::with_capacity(PixelFormat::Rgba.buffer_len(width, height));
    for y in 0..h {
        let chroma_row = &chroma[(y / 2) * w..(y / 2 + 1) * w];
        for x in 0..w {
            let pair = (x / 2) * 2;
            let [r, g, b] = nv12_to_rgb(luma[y * w + x], chroma_row[pair], chroma_row[pair + 1]);
            rgba.extend_from_slice(&[r, g, b, 255]);
        }
    }
    Ok(rgba)
}

pub struct ConvertStage {
    name: String,
    converted: u64,
}

impl ConvertStage {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            converted: 0,
        }
    }
}

impl Stage for ConvertStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&self) -> Option<PortKind> {
        Some(PortKind::Batches)
    }

    fn output(&self) -> Option<PortKind> {
        Some(PortKind::Batches)
    }

    fn stop(&mut self) -> Result<()> {
        log::debug!("{}: converted {} frame(s)", self.name, self.converted);
        Ok(())
    }

    fn process(&mut self, input: Payload, out: &mut Outbox) -> Result<()> {
        let Payload::Batch(mut batch) = input else {
            bail!("{} accepts batches only", self.name);
        };
        for frame in batch.frames_mut() {
            if frame.format() == PixelFormat::Rgba {
                continue;
            }
            let rgba = nv12_to_rgba(frame.width(), frame.height(), frame.pixels())?;
            frame.replace_pixels(PixelFormat::Rgba, rgba);
            self.converted += 1;
        }
        out.push(Payload::Batch(batch));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Batch, Frame};
    use crate::metadata::{BoundingBox, DetectionRecord, ObjectClass};
    use std::time::Duration;

    #[test]
    fn reference_colours() {
        assert_eq!(nv12_to_rgb(16, 128, 128), [0, 0, 0]);
        assert_eq!(nv12_to_rgb(235, 128, 128), [255, 255, 255]);
        let [r, g, b] = nv12_to_rgb(81, 90, 240);
        assert!(r > 240 && g < 10 && b < 10);
    }

    #[test]
    fn odd_dimensions_are_rejected() {
        assert!(nv12_to_rgba(3, 2, &[0u8; 9]).is_err());
        assert!(nv12_to_rgba(4, 2, &[0u8; 5]).is_err());
    }

    #[test]
    fn conversion_keeps_metadata() {
        let mut frame = Frame::new(
            0,
            0,
            Duration::ZERO,
            4,
            2,
            PixelFormat::Nv12,
            vec![128u8; PixelFormat::Nv12.buffer_len(4, 2)],
        );
        frame.metadata_mut().push_detection(DetectionRecord::new(
            ObjectClass::Person,
            BoundingBox::new(0.0, 0.0, 2.0, 2.0),
            0.8,
            "pgie",
        ));
        let mut stage = ConvertStage::new("convert");
        let mut out = Outbox::new();
        stage
            .process(Payload::Batch(Batch::new(0, 0, 4, 2, vec![frame])), &mut out)
            .unwrap();
        let Some(Payload::Batch(batch)) = out.drain().next() else {
            panic!("no batch emitted");
        };
        let frame = &batch.frames()[0];
        assert_eq!(frame.format(), PixelFormat::Rgba);
        assert_eq!(frame.pixels().len(), 32);
        assert_eq!(frame.metadata().record_count(), 1);
    }
}
