//! Inference backends used by the primary and secondary inference stages.

mod backend;
mod backends;
mod registry;
mod result;

pub use backend::{ClassifierBackend, DetectionCapability, DetectorBackend};
pub use backends::{StubClassifier, StubDetector};
pub use registry::{BackendRegistry, DetectorParams};
pub use result::{Classification, Detection};

#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
