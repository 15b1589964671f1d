//! Inference stages: the primary detector and secondary classifiers.

use anyhow::{Context, Result};

use crate::detect::{ClassifierBackend, DetectionCapability, DetectorBackend};
use crate::frame::{Payload, PortKind};
use crate::metadata::{ClassifierOutput, DetectionRecord, ObjectClass};
use crate::stage::{Outbox, Stage, StageOptions};

// ----------------------------------------------------------------------------
// Primary detector
// ----------------------------------------------------------------------------

/// Runs the object detector over every frame of a batch and attaches one
/// `DetectionRecord` per detection at or above the confidence threshold.
pub struct PrimaryInferStage {
    name: String,
    backend: Box<dyn DetectorBackend>,
    threshold: f32,
    frames: u64,
    records: u64,
}

impl PrimaryInferStage {
    pub fn new(name: &str, backend: Box<dyn DetectorBackend>, threshold: f32) -> Self {
        Self {
            name: name.to_string(),
            backend,
            threshold,
            frames: 0,
            records: 0,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Stage for PrimaryInferStage {
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
        options.reject_unknown(&self.name, &["threshold"])?;
        if let Some(threshold) = options.get::<f32>("threshold")? {
            if !(0.0..=1.0).contains(&threshold) {
                anyhow::bail!("threshold {} is outside 0..=1", threshold);
            }
            self.threshold = threshold;
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if !self.backend.supports(DetectionCapability::ObjectDetection) {
            anyhow::bail!("backend {} cannot detect objects", self.backend.name());
        }
        self.backend
            .warm_up()
            .with_context(|| format!("warm up detector {}", self.backend.name()))?;
        log::info!(
            "{}: detector {} ready (threshold {:.2})",
            self.name,
            self.backend.name(),
            self.threshold
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        log::info!(
            "{}: {} frame(s), {} detection(s)",
            self.name,
            self.frames,
            self.records
        );
        Ok(())
    }

    fn process(&mut self, input: Payload, out: &mut Outbox) -> Result<()> {
        let Payload::Batch(mut batch) = input else {
            anyhow::bail!("{} accepts batches only", self.name);
        };
        for frame in batch.frames_mut() {
            let detections = self
                .backend
                .detect(&frame.view())
                .with_context(|| format!("detector failed on frame {}", frame.sequence()))?;
            self.frames += 1;
            let metadata = frame.metadata_mut();
            for det in detections
                .into_iter()
                .filter(|det| det.confidence >= self.threshold)
            {
                metadata.push_detection(DetectionRecord::new(
                    det.class,
                    det.bbox,
                    det.confidence,
                    self.name.as_str(),
                ));
                self.records += 1;
            }
        }
        out.push(Payload::Batch(batch));
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Secondary classifier
// ----------------------------------------------------------------------------

/// Refines detections of the target classes with one classifier's label.
pub struct SecondaryInferStage {
    name: String,
    backend: Box<dyn ClassifierBackend>,
    targets: Vec<ObjectClass>,
    outputs: u64,
}

impl SecondaryInferStage {
    pub fn new(name: &str, backend: Box<dyn ClassifierBackend>, targets: Vec<ObjectClass>) -> Self {
        Self {
            name: name.to_string(),
            backend,
            targets,
            outputs: 0,
        }
    }

    pub fn targets(&self) -> &[ObjectClass] {
        &self.targets
    }
}

impl Stage for SecondaryInferStage {
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
        log::info!(
            "{}: {} label(s) from {}",
            self.name,
            self.outputs,
            self.backend.name()
        );
        Ok(())
    }

    fn process(&mut self, input: Payload, out: &mut Outbox) -> Result<()> {
        let Payload::Batch(mut batch) = input else {
            anyhow::bail!("{} accepts batches only", self.name);
        };
        for frame in batch.frames_mut() {
            let mut labels = Vec::new();
            {
                let view = frame.view();
                for (target, record) in view.metadata().detections().iter().enumerate() {
                    if !self.targets.contains(&record.class) {
                        continue;
                    }
                    if let Some(label) = self.backend.classify(&view, record)? {
                        labels.push(ClassifierOutput {
                            target,
                            classifier: self.backend.name().to_string(),
                            label: label.label,
                            confidence: label.confidence,
                        });
                    }
                }
            }
            let metadata = frame.metadata_mut();
            for output in labels {
                metadata.push_classification(output)?;
                self.outputs += 1;
            }
        }
        out.push(Payload::Batch(batch));
        Ok(())
    }
}
