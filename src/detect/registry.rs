use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Result};

use super::backend::{ClassifierBackend, DetectorBackend};
use super::backends::{StubClassifier, StubDetector};

/// Construction parameters handed to detector factories.
#[derive(Clone, Debug, Default)]
pub struct DetectorParams {
    pub model_path: Option<PathBuf>,
    /// Frame size the detector will see.
    pub width: u32,
    pub height: u32,
}

type DetectorFactory = Box<dyn Fn(&DetectorParams) -> Result<Box<dyn DetectorBackend>> + Send + Sync>;
type ClassifierFactory = Box<dyn Fn() -> Box<dyn ClassifierBackend> + Send + Sync>;

/// Named factories for detector and classifier backends.
///
/// Every inference stage owns its backend instance, so the registry hands out fresh
/// boxes instead of shared handles.
pub struct BackendRegistry {
    detectors: HashMap<String, DetectorFactory>,
    classifiers: HashMap<String, ClassifierFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            detectors: HashMap::new(),
            classifiers: HashMap::new(),
        }
    }

    /// Registry with the built-in backends: the `stub` detector, the stub vehicle
    /// classifiers and, when compiled in, the `tract` ONNX detector.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_detector("stub", |_| {
            Ok(Box::new(StubDetector::new()) as Box<dyn DetectorBackend>)
        });
        #[cfg(feature = "backend-tract")]
        registry.register_detector("tract", |params| {
            let path = params
                .model_path
                .as_ref()
                .ok_or_else(|| anyhow!("tract backend requires inference.model_path"))?;
            let backend = super::backends::TractBackend::new(path, params.width, params.height)?;
            Ok(Box::new(backend) as Box<dyn DetectorBackend>)
        });
        for (name, labels) in StubClassifier::CATALOG {
            registry.register_classifier(name, move || {
                Box::new(StubClassifier::new(name, labels)) as Box<dyn ClassifierBackend>
            });
        }
        registry
    }

    pub fn register_detector<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&DetectorParams) -> Result<Box<dyn DetectorBackend>> + Send + Sync + 'static,
    {
        self.detectors.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_classifier<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn ClassifierBackend> + Send + Sync + 'static,
    {
        self.classifiers.insert(name.to_string(), Box::new(factory));
    }

    pub fn create_detector(
        &self,
        name: &str,
        params: &DetectorParams,
    ) -> Result<Box<dyn DetectorBackend>> {
        let factory = self.detectors.get(name).ok_or_else(|| {
            anyhow!(
                "detector backend '{}' not available (registered: {})",
                name,
                sorted(self.detectors.keys()).join(", ")
            )
        })?;
        factory(params)
    }

    pub fn create_classifier(&self, name: &str) -> Result<Box<dyn ClassifierBackend>> {
        let factory = self.classifiers.get(name).ok_or_else(|| {
            anyhow!(
                "classifier '{}' not available (registered: {})",
                name,
                sorted(self.classifiers.keys()).join(", ")
            )
        })?;
        Ok(factory())
    }

    /// Registered detector names, sorted.
    pub fn detectors(&self) -> Vec<String> {
        sorted(self.detectors.keys())
    }

    pub fn classifiers(&self) -> Vec<String> {
        sorted(self.classifiers.keys())
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted<'a>(names: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut names: Vec<String> = names.cloned().collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_include_stub_backends() {
        let registry = BackendRegistry::with_defaults();
        assert!(registry.detectors().contains(&"stub".to_string()));
        assert_eq!(
            registry.classifiers(),
            vec!["vehicle-color", "vehicle-make", "vehicle-type"]
        );
        let detector = registry
            .create_detector("stub", &DetectorParams::default())
            .unwrap();
        assert_eq!(detector.name(), "stub");
        assert_eq!(
            registry.create_classifier("vehicle-type").unwrap().name(),
            "vehicle-type"
        );
    }

    #[test]
    fn unknown_backend_lists_alternatives() {
        let registry = BackendRegistry::with_defaults();
        let err = registry
            .create_detector("yolo", &DetectorParams::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("stub"));
        assert!(registry.create_classifier("license-plate").is_err());
    }
}
