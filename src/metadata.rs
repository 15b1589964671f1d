//! Per-frame analytics metadata.
//!
//! `Metadata` is append-only: stages push detection records, classifier outputs and
//! derived annotations, but nothing can be removed or reordered once attached. The
//! single permitted mutation of an existing record is giving it a tracking id when
//! it does not have one yet.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of object classes produced by the primary detector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectClass {
    Vehicle = 0,
    Bicycle = 1,
    Person = 2,
    Roadsign = 3,
}

impl ObjectClass {
    pub const ALL: [ObjectClass; 4] = [
        ObjectClass::Vehicle,
        ObjectClass::Bicycle,
        ObjectClass::Person,
        ObjectClass::Roadsign,
    ];

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn label(self) -> &'static str {
        match self {
            ObjectClass::Vehicle => "Vehicle",
            ObjectClass::Bicycle => "Bicycle",
            ObjectClass::Person => "Person",
            ObjectClass::Roadsign => "Roadsign",
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Axis-aligned box in frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn right(&self) -> f32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.top + self.height
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union, 0.0 for disjoint or degenerate boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix = (self.right().min(other.right()) - self.left.max(other.left)).max(0.0);
        let iy = (self.bottom().min(other.bottom()) - self.top.max(other.top)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Clip the box to a `width` x `height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> BoundingBox {
        let (w, h) = (width as f32, height as f32);
        let left = self.left.clamp(0.0, w);
        let top = self.top.clamp(0.0, h);
        BoundingBox {
            left,
            top,
            width: (self.right().clamp(0.0, w) - left).max(0.0),
            height: (self.bottom().clamp(0.0, h) - top).max(0.0),
        }
    }
}

/// One detected object instance.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionRecord {
    pub class: ObjectClass,
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Name of the stage that attached the record.
    pub producer: String,
    tracking_id: Option<u64>,
}

impl DetectionRecord {
    pub fn new(
        class: ObjectClass,
        bbox: BoundingBox,
        confidence: f32,
        producer: impl Into<String>,
    ) -> Self {
        Self {
            class,
            bbox,
            confidence,
            producer: producer.into(),
            tracking_id: None,
        }
    }

    pub fn tracking_id(&self) -> Option<u64> {
        self.tracking_id
    }
}

/// Output of a secondary classifier, refining the primary record at `target`.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassifierOutput {
    pub target: usize,
    pub classifier: String,
    pub label: String,
    pub confidence: f32,
}

/// Free-form derived value, e.g. overlay text written by a probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Annotation {
    pub author: String,
    pub key: String,
    pub value: String,
}

impl Annotation {
    pub fn new(author: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Metadata {
    detections: Vec<DetectionRecord>,
    classifications: Vec<ClassifierOutput>,
    annotations: Vec<Annotation>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn detections(&self) -> &[DetectionRecord] {
        &self.detections
    }

    /// Append a detection record, returning its index.
    pub fn push_detection(&mut self, record: DetectionRecord) -> usize {
        self.detections.push(record);
        self.detections.len() - 1
    }

    /// Give the record at `index` a tracking id.
    ///
    /// Re-assigning the same id is accepted (the tracker retains it); replacing a
    /// different id is rejected.
    pub fn assign_tracking_id(&mut self, index: usize, id: u64) -> Result<()> {
        let record = self
            .detections
            .get_mut(index)
            .ok_or_else(|| anyhow!("no detection record at index {}", index))?;
        match record.tracking_id {
            None => {
                record.tracking_id = Some(id);
                Ok(())
            }
            Some(existing) if existing == id => Ok(()),
            Some(existing) => Err(anyhow!(
                "detection {} already tracked as {} (refusing {})",
                index,
                existing,
                id
            )),
        }
    }

    pub fn push_classification(&mut self, output: ClassifierOutput) -> Result<()> {
        if output.target >= self.detections.len() {
            return Err(anyhow!(
                "classifier {} refers to missing detection {}",
                output.classifier,
                output.target
            ));
        }
        self.classifications.push(output);
        Ok(())
    }

    pub fn classifications(&self) -> &[ClassifierOutput] {
        &self.classifications
    }

    pub fn classifications_for(&self, target: usize) -> impl Iterator<Item = &ClassifierOutput> {
        self.classifications
            .iter()
            .filter(move |output| output.target == target)
    }

    pub fn push_annotation(&mut self, annotation: Annotation) {
        self.annotations.push(annotation);
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    /// Total number of attached entries. Never decreases along the pipeline.
    pub fn record_count(&self) -> usize {
        self.detections.len() + self.classifications.len() + self.annotations.len()
    }

    pub fn class_counts(&self) -> ClassCounts {
        let mut counts = ClassCounts::default();
        for record in &self.detections {
            counts.add(record.class, 1);
        }
        counts
    }
}

/// Object counts indexed by `ObjectClass`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClassCounts([u64; 4]);

impl ClassCounts {
    pub fn get(&self, class: ObjectClass) -> u64 {
        self.0[class as usize]
    }

    pub fn add(&mut self, class: ObjectClass, n: u64) {
        self.0[class as usize] += n;
    }

    pub fn merge(&mut self, other: &ClassCounts) {
        for class in ObjectClass::ALL {
            self.add(class, other.get(class));
        }
    }

    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }
}

impl fmt::Display for ClassCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for class in ObjectClass::ALL {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", class, self.get(class))?;
            first = false;
        }
        Ok(())
    }
}
