use anyhow::Result;

use crate::detect::result::{Classification, Detection};
use crate::frame::FrameView;
use crate::metadata::DetectionRecord;

/// What a detector backend can be asked to do.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionCapability {
    ObjectDetection,
    Classification,
}

/// Primary detector.
///
/// Implementations get a read-only view of the frame for the duration of the call
/// and must not keep the pixel slice.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend supports a capability.
    fn supports(&self, capability: DetectionCapability) -> bool;

    /// Detect objects in `frame`. Detections are returned in the backend's order,
    /// which the inference stage preserves.
    fn detect(&mut self, frame: &FrameView<'_>) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run when the inference stage starts.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Secondary classifier refining one primary detection.
pub trait ClassifierBackend: Send {
    fn name(&self) -> &str;

    /// `Ok(None)` when the classifier has nothing to say about this object.
    fn classify(
        &mut self,
        frame: &FrameView<'_>,
        record: &DetectionRecord,
    ) -> Result<Option<Classification>>;
}
