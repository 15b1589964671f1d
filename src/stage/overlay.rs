//! On-screen display stage: draws detection outlines into RGBA frames.

use anyhow::Result;

use crate::frame::{Frame, Payload, PixelFormat, PortKind};
use crate::metadata::{BoundingBox, ObjectClass};
use crate::probe::OVERLAY_TEXT_KEY;
use crate::stage::{Fault, Outbox, Stage, StageOptions};

const DEFAULT_THICKNESS: u32 = 2;

pub fn class_colour(class: ObjectClass) -> [u8; 4] {
    match class {
        ObjectClass::Vehicle => [255, 0, 0, 255],
        ObjectClass::Bicycle => [255, 255, 0, 255],
        ObjectClass::Person => [0, 255, 0, 255],
        ObjectClass::Roadsign => [0, 0, 255, 255],
    }
}

pub struct OverlayStage {
    name: String,
    thickness: u32,
    drawn: u64,
    captions: u64,
}

impl OverlayStage {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            thickness: DEFAULT_THICKNESS,
            drawn: 0,
            captions: 0,
        }
    }

    pub fn thickness(&self) -> u32 {
        self.thickness
    }

    fn draw(&mut self, frame: &mut Frame) {
        let boxes: Vec<(BoundingBox, [u8; 4])> = frame
            .metadata()
            .detections()
            .iter()
            .map(|record| (record.bbox, class_colour(record.class)))
            .collect();
        if frame
            .metadata()
            .annotations()
            .iter()
            .any(|a| a.key == OVERLAY_TEXT_KEY)
        {
            self.captions += 1;
        }
        let (width, height) = (frame.width(), frame.height());
        let pixels = frame.pixels_mut();
        for (bbox, colour) in boxes {
            draw_outline(pixels, width, height, &bbox, self.thickness, colour);
            self.drawn += 1;
        }
    }
}

/// Paint a `thickness`-pixel rectangle outline, clipped to the frame.
pub fn draw_outline(
    pixels: &mut [u8],
    width: u32,
    height: u32,
    bbox: &BoundingBox,
    thickness: u32,
    colour: [u8; 4],
) {
    let bbox = bbox.clamp_to(width, height);
    if bbox.area() <= 0.0 || thickness == 0 {
        return;
    }
    let x0 = bbox.left as u32;
    let y0 = bbox.top as u32;
    let x1 = (bbox.right().ceil() as u32).min(width);
    let y1 = (bbox.bottom().ceil() as u32).min(height);
    for y in y0..y1 {
        for x in x0..x1 {
            let edge = x < x0 + thickness
                || x + thickness >= x1
                || y < y0 + thickness
                || y + thickness >= y1;
            if edge {
                let idx = (y as usize * width as usize + x as usize) * 4;
                if let Some(px) = pixels.get_mut(idx..idx + 4) {
                    px.copy_from_slice(&colour);
                }
            }
        }
    }
}

impl Stage for OverlayStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&self) -> Option<PortKind> {
        Some(PortKind::Batches)
    }

    fn output(&self) -> Option<PortKind> {
        Some(PortKind::Batches)
    }

    fn configure(&mut self, options: &StageOptions) -> Result<()> {
        options.reject_unknown(&self.name, &["thickness"])?;
        if let Some(thickness) = options.get::<u32>("thickness")? {
            self.thickness = thickness;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        log::info!(
            "{}: drew {} outline(s), {} captioned frame(s)",
            self.name,
            self.drawn,
            self.captions
        );
        Ok(())
    }

    fn process(&mut self, input: Payload, out: &mut Outbox) -> Result<()> {
        let Payload::Batch(mut batch) = input else {
            anyhow::bail!("{} accepts batches only", self.name);
        };
        let mut skipped = 0;
        for frame in batch.frames_mut() {
            if frame.format() == PixelFormat::Rgba {
                self.draw(frame);
            } else {
                skipped += 1;
            }
        }
        out.push(Payload::Batch(batch));
        if skipped > 0 {
            return Err(Fault::warning(format!(
                "{} frame(s) not RGBA; passed through undrawn",
                skipped
            ))
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Severity;
    use crate::frame::Batch;
    use crate::metadata::DetectionRecord;
    use crate::stage::fault_severity;
    use std::time::Duration;

    fn frame(format: PixelFormat) -> Frame {
        let mut frame = Frame::new(
            0,
            0,
            Duration::ZERO,
            16,
            16,
            format,
            vec![0u8; format.buffer_len(16, 16)],
        );
        frame.metadata_mut().push_detection(DetectionRecord::new(
            ObjectClass::Person,
            BoundingBox::new(2.0, 2.0, 8.0, 8.0),
            0.9,
            "pgie",
        ));
        frame
    }

    fn pixel(frame: &Frame, x: usize, y: usize) -> &[u8] {
        let idx = (y * 16 + x) * 4;
        &frame.pixels()[idx..idx + 4]
    }

    #[test]
    fn outlines_use_class_colour() {
        let mut stage = OverlayStage::new("overlay");
        let mut out = Outbox::new();
        let batch = Batch::new(0, 0, 16, 16, vec![frame(PixelFormat::Rgba)]);
        stage.process(Payload::Batch(batch), &mut out).unwrap();
        let Some(Payload::Batch(batch)) = out.drain().next() else {
            panic!("no batch emitted");
        };
        let frame = &batch.frames()[0];
        assert_eq!(pixel(frame, 2, 2), &[0, 255, 0, 255]);
        assert_eq!(pixel(frame, 9, 5), &[0, 255, 0, 255]);
        assert_eq!(pixel(frame, 5, 5), &[0, 0, 0, 0]);
        assert_eq!(pixel(frame, 12, 12), &[0, 0, 0, 0]);
    }

    #[test]
    fn non_rgba_frames_pass_with_warning() {
        let mut stage = OverlayStage::new("overlay");
        let mut out = Outbox::new();
        let batch = Batch::new(0, 0, 16, 16, vec![frame(PixelFormat::Nv12)]);
        let err = stage.process(Payload::Batch(batch), &mut out).unwrap_err();
        assert_eq!(fault_severity(&err), Severity::Warning);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn thickness_option() {
        let mut stage = OverlayStage::new("overlay");
        stage
            .configure(&StageOptions::new().with("thickness", 4))
            .unwrap();
        assert_eq!(stage.thickness(), 4);
        assert!(stage
            .configure(&StageOptions::new().with("font", "sans"))
            .is_err());
    }
}
