//! Predictive Model Service
//!
//! The engines never see model internals. They ask the service for:
//! - the feature order a trained artifact expects (`feature_order`)
//! - a point prediction plus per-feature attribution (`predict`)
//! - the calibration residual used for intervals (`calibration`)
//! - the decision threshold of a classifier (`threshold`)
//!
//! `ModelRegistry` is the in-process implementation backed by JSON
//! artifacts loaded once at startup. Loading is fail-fast: a missing or
//! malformed artifact is `ModelError::Unavailable`.

mod artifact;
mod registry;

pub use artifact::{ArtifactKind, Calibration, ModelArtifact, Scaler};
pub use registry::ModelRegistry;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifies one trained artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelId {
    PreLime,
    PostLime,
    Classification,
    NormalRegression,
    AdvanceRegression,
}

impl ModelId {
    pub const ALL: [Self; 5] = [
        Self::PreLime,
        Self::PostLime,
        Self::Classification,
        Self::NormalRegression,
        Self::AdvanceRegression,
    ];

    /// Artifact file name inside the models directory.
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::PreLime => "pre_lime.json",
            Self::PostLime => "post_lime.json",
            Self::Classification => "classification.json",
            Self::NormalRegression => "normal_regression.json",
            Self::AdvanceRegression => "advance_regression.json",
        }
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreLime => write!(f, "pre_lime"),
            Self::PostLime => write!(f, "post_lime"),
            Self::Classification => write!(f, "classification"),
            Self::NormalRegression => write!(f, "normal_regression"),
            Self::AdvanceRegression => write!(f, "advance_regression"),
        }
    }
}

/// Point prediction with attribution.
///
/// For classifiers `value` is the positive-class probability and the
/// attribution is expressed in log-odds relative to `base_value`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    pub value: f64,
    pub attribution: Vec<f64>,
    pub base_value: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model {model} unavailable: {reason}")]
    Unavailable { model: ModelId, reason: String },
    #[error("model {model} expects {expected} features, got {got}")]
    FeatureCount {
        model: ModelId,
        expected: usize,
        got: usize,
    },
    #[error("model {model} requires feature '{feature}' which the caller did not provide")]
    MissingFeature { model: ModelId, feature: String },
    #[error("model {model} has no decision threshold")]
    NoThreshold { model: ModelId },
    #[error("model {model} produced a non-finite prediction")]
    NonFinite { model: ModelId },
}

/// Consumed interface of the predictive models.
///
/// Implementations must be thread-safe (Send + Sync) for shared access
/// across the backfill workers and HTTP handlers.
pub trait ModelService: Send + Sync {
    /// Feature names in the order `predict` expects them.
    fn feature_order(&self, model: ModelId) -> Result<Vec<String>, ModelError>;

    fn predict(&self, model: ModelId, features: &[f64]) -> Result<ModelOutput, ModelError>;

    fn calibration(&self, model: ModelId) -> Result<Calibration, ModelError>;

    fn threshold(&self, model: ModelId) -> Result<f64, ModelError>;
}

/// Arrange named inputs in the order declared by the model.
///
/// Returns the declared names alongside the values so attribution can be
/// reported against the same ordering.
pub fn ordered_features(
    service: &dyn ModelService,
    model: ModelId,
    inputs: &HashMap<&str, f64>,
) -> Result<(Vec<String>, Vec<f64>), ModelError> {
    let order = service.feature_order(model)?;
    let values = order
        .iter()
        .map(|name| {
            inputs
                .get(name.as_str())
                .copied()
                .ok_or_else(|| ModelError::MissingFeature {
                    model,
                    feature: name.clone(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((order, values))
}
