//! In-process model registry loaded from a directory of JSON artifacts.

use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::{Calibration, ModelArtifact, ModelError, ModelId, ModelOutput, ModelService};

/// All artifacts the pipeline needs, loaded once at process start.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    artifacts: HashMap<ModelId, ModelArtifact>,
}

impl ModelRegistry {
    /// Load every artifact in `ModelId::ALL` from `dir`.
    ///
    /// Any missing, unreadable or invalid artifact aborts the load.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self, ModelError> {
        let dir = dir.as_ref();
        let mut artifacts = HashMap::new();

        for model in ModelId::ALL {
            let path = dir.join(model.file_name());
            let contents = std::fs::read_to_string(&path).map_err(|e| ModelError::Unavailable {
                model,
                reason: format!("{}: {}", path.display(), e),
            })?;
            let artifact: ModelArtifact =
                serde_json::from_str(&contents).map_err(|e| ModelError::Unavailable {
                    model,
                    reason: format!("{}: {}", path.display(), e),
                })?;
            artifacts.insert(model, artifact);
        }

        let registry = Self::from_artifacts(artifacts)?;
        info!(dir = %dir.display(), models = registry.artifacts.len(), "Model artifacts loaded");
        Ok(registry)
    }

    /// Build from already-parsed artifacts. All models must be present.
    pub fn from_artifacts(artifacts: HashMap<ModelId, ModelArtifact>) -> Result<Self, ModelError> {
        for model in ModelId::ALL {
            let artifact = artifacts.get(&model).ok_or_else(|| ModelError::Unavailable {
                model,
                reason: "artifact not provided".to_string(),
            })?;
            artifact
                .validate()
                .map_err(|reason| ModelError::Unavailable { model, reason })?;
        }
        Ok(Self { artifacts })
    }

    fn artifact(&self, model: ModelId) -> Result<&ModelArtifact, ModelError> {
        self.artifacts.get(&model).ok_or_else(|| ModelError::Unavailable {
            model,
            reason: "artifact not loaded".to_string(),
        })
    }
}

impl ModelService for ModelRegistry {
    fn feature_order(&self, model: ModelId) -> Result<Vec<String>, ModelError> {
        Ok(self.artifact(model)?.feature_order.clone())
    }

    fn predict(&self, model: ModelId, features: &[f64]) -> Result<ModelOutput, ModelError> {
        let artifact = self.artifact(model)?;
        if features.len() != artifact.feature_order.len() {
            return Err(ModelError::FeatureCount {
                model,
                expected: artifact.feature_order.len(),
                got: features.len(),
            });
        }
        let output = artifact.evaluate(features);
        if !output.value.is_finite() {
            return Err(ModelError::NonFinite { model });
        }
        Ok(output)
    }

    fn calibration(&self, model: ModelId) -> Result<Calibration, ModelError> {
        Ok(self.artifact(model)?.calibration)
    }

    fn threshold(&self, model: ModelId) -> Result<f64, ModelError> {
        self.artifact(model)?
            .threshold
            .ok_or(ModelError::NoThreshold { model })
    }
}
