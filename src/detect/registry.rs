use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backend::{DetectorBackend, SharedDetector};

/// Registry of detector backends selectable by name.
pub struct BackendRegistry {
    backends: HashMap<String, SharedDetector>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        self.register_shared(Arc::new(backend));
    }

    pub fn register_shared(&mut self, backend: SharedDetector) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, backend);
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// Get backend by name.
    pub fn get(&self, name: &str) -> Option<SharedDetector> {
        self.backends.get(name).cloned()
    }

    /// Get default backend.
    pub fn default_backend(&self) -> Option<SharedDetector> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// List registered backends, sorted by name.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a configured backend name, or the default when `name` is empty.
    pub fn select(&self, name: &str) -> Result<SharedDetector> {
        if name.trim().is_empty() {
            return self
                .default_backend()
                .ok_or_else(|| anyhow!("no detector backends registered"));
        }
        self.get(name).ok_or_else(|| {
            anyhow!(
                "detector backend '{}' not available (registered: {})",
                name,
                self.list().join(", ")
            )
        })
    }
}

/// Registry of the built-in backends, with `backend` resolved and warmed up.
///
/// Model-backed backends are only loaded when selected.
pub fn build_detector(backend: &str, model_path: &Path) -> Result<SharedDetector> {
    let mut registry = BackendRegistry::new();
    registry.register(super::StubBackend::new());
    #[cfg(feature = "backend-tract")]
    if backend == "tract" {
        registry.register(super::TractBackend::new(model_path)?);
    }
    #[cfg(not(feature = "backend-tract"))]
    if backend == "tract" {
        return Err(anyhow!(
            "backend 'tract' for {} requires the backend-tract feature",
            model_path.display()
        ));
    }
    let detector = registry.select(backend)?;
    detector.warm_up()?;
    log::info!("detector backend: {}", detector.name());
    Ok(detector)
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubBackend;

    #[test]
    fn first_registered_backend_is_default() {
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::new());
        assert_eq!(registry.default_backend().unwrap().name(), "stub");
        assert_eq!(registry.select("").unwrap().name(), "stub");
    }

    #[test]
    fn select_unknown_backend_fails() {
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::new());
        let err = registry.select("tract").err().expect("unknown backend");
        assert!(err.to_string().contains("stub"));
        assert!(registry.set_default("tract").is_err());
    }

    #[test]
    fn build_detector_resolves_stub() {
        let detector = build_detector("stub", Path::new("unused.onnx")).unwrap();
        assert_eq!(detector.name(), "stub");
        assert!(build_detector("yolo-nas", Path::new("unused.onnx")).is_err());
    }
}
