use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::{ClassifierBackend, DetectionCapability, DetectorBackend};
use crate::detect::result::{Classification, Detection};
use crate::frame::FrameView;
use crate::metadata::{BoundingBox, DetectionRecord, ObjectClass};

/// Object scripted into the synthetic scene. Geometry is relative to the frame size
/// and velocity is per frame.
struct Actor {
    class: ObjectClass,
    x: f32,
    y: f32,
    w: f32,
    h: f32,
    dx: f32,
}

const SCENE: [Actor; 5] = [
    Actor { class: ObjectClass::Vehicle, x: 0.05, y: 0.55, w: 0.18, h: 0.14, dx: 0.004 },
    Actor { class: ObjectClass::Vehicle, x: 0.70, y: 0.62, w: 0.20, h: 0.15, dx: -0.003 },
    Actor { class: ObjectClass::Person, x: 0.30, y: 0.40, w: 0.05, h: 0.15, dx: 0.0015 },
    Actor { class: ObjectClass::Bicycle, x: 0.10, y: 0.45, w: 0.08, h: 0.10, dx: 0.0025 },
    Actor { class: ObjectClass::Roadsign, x: 0.85, y: 0.20, w: 0.05, h: 0.08, dx: 0.0 },
];

/// Every actor sits out one window of this many frames in five.
const ABSENCE_WINDOW: u64 = 90;

/// Deterministic detector for tests and demos.
///
/// Reports the scripted scene above: objects move linearly with the frame sequence
/// number and wrap around the frame edges. Confidence jitter comes from a digest of
/// source, sequence and actor so repeated runs see identical output.
#[derive(Default)]
pub struct StubDetector {
    frames_seen: u64,
}

impl StubDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }
}

impl DetectorBackend for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::ObjectDetection)
    }

    fn detect(&mut self, frame: &FrameView<'_>) -> Result<Vec<Detection>> {
        self.frames_seen += 1;
        let seq = frame.sequence();
        let (width, height) = (frame.width() as f32, frame.height() as f32);
        let mut detections = Vec::new();
        for (k, actor) in SCENE.iter().enumerate() {
            if (seq / ABSENCE_WINDOW + k as u64) % 5 == 0 {
                continue;
            }
            let span = 1.0 + actor.w;
            let x = (actor.x + actor.dx * seq as f32).rem_euclid(span) - actor.w;
            let bbox = BoundingBox::new(
                x * width,
                actor.y * height,
                actor.w * width,
                actor.h * height,
            )
            .clamp_to(frame.width(), frame.height());
            if bbox.area() < 4.0 {
                continue;
            }
            let digest = Sha256::new()
                .chain_update(frame.source().to_le_bytes())
                .chain_update(seq.to_le_bytes())
                .chain_update((k as u32).to_le_bytes())
                .finalize();
            let confidence = 0.6 + 0.35 * (digest[0] as f32 / 255.0);
            detections.push(Detection {
                class: actor.class,
                bbox,
                confidence,
            });
        }
        Ok(detections)
    }
}

/// Deterministic classifier. Objects keep their label for as long as they keep
/// their tracking id.
pub struct StubClassifier {
    name: &'static str,
    labels: &'static [&'static str],
}

impl StubClassifier {
    pub const CATALOG: [(&'static str, &'static [&'static str]); 3] = [
        (
            "vehicle-color",
            &["black", "blue", "gray", "red", "silver", "white"],
        ),
        (
            "vehicle-make",
            &["acura", "bmw", "ford", "honda", "nissan", "toyota"],
        ),
        ("vehicle-type", &["coupe", "sedan", "suv", "truck", "van"]),
    ];

    pub fn new(name: &'static str, labels: &'static [&'static str]) -> Self {
        Self { name, labels }
    }
}

impl ClassifierBackend for StubClassifier {
    fn name(&self) -> &str {
        self.name
    }

    fn classify(
        &mut self,
        _frame: &FrameView<'_>,
        record: &DetectionRecord,
    ) -> Result<Option<Classification>> {
        // Untracked objects have no stable identity to classify against.
        let Some(track) = record.tracking_id() else {
            return Ok(None);
        };
        if self.labels.is_empty() {
            return Ok(None);
        }
        let digest = Sha256::new()
            .chain_update(self.name.as_bytes())
            .chain_update(track.to_le_bytes())
            .finalize();
        let label = self.labels[digest[0] as usize % self.labels.len()];
        Ok(Some(Classification {
            label: label.to_string(),
            confidence: 0.5 + digest[1] as f32 / 510.0,
        }))
    }
}
