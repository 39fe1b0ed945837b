//! JSON model artifacts: linear regressors and logistic classifiers.
//!
//! ```json
//! {
//!   "kind": "regressor",
//!   "feature_order": ["raw_water_ph", "raw_water_turbidity"],
//!   "scaler": { "mean": [7.2, 15.0], "scale": [0.5, 10.0] },
//!   "coefficients": [0.4, -0.1],
//!   "intercept": 6.46,
//!   "calibration": { "q_hat": 0.18 }
//! }
//! ```
//!
//! Attribution is exact for these models: feature `i` contributes
//! `coefficients[i] * z[i]`, where `z` is the (optionally standardised)
//! input, against a base value equal to `intercept`. For classifiers the
//! contributions are in log-odds.

use serde::{Deserialize, Serialize};

use super::ModelOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Regressor,
    Classifier,
}

/// Standard scaler fitted at training time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

/// Pre-computed calibration residual for fixed-width intervals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub q_hat: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub kind: ArtifactKind,
    pub feature_order: Vec<String>,
    #[serde(default)]
    pub scaler: Option<Scaler>,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    pub calibration: Calibration,
    /// Positive-class decision threshold (classifiers only).
    #[serde(default)]
    pub threshold: Option<f64>,
}

impl ModelArtifact {
    /// Structural checks run once at load time.
    pub fn validate(&self) -> Result<(), String> {
        let n = self.feature_order.len();
        if n == 0 {
            return Err("feature_order is empty".to_string());
        }
        if self.coefficients.len() != n {
            return Err(format!(
                "{} coefficients for {} features",
                self.coefficients.len(),
                n
            ));
        }
        if let Some(scaler) = &self.scaler {
            if scaler.mean.len() != n || scaler.scale.len() != n {
                return Err(format!("scaler dimensions do not match {n} features"));
            }
            if scaler.scale.iter().any(|s| *s == 0.0 || !s.is_finite()) {
                return Err("scaler.scale must be finite and non-zero".to_string());
            }
        }
        if !self.calibration.q_hat.is_finite() || self.calibration.q_hat < 0.0 {
            return Err("calibration.q_hat must be a non-negative number".to_string());
        }
        match (self.kind, self.threshold) {
            (ArtifactKind::Classifier, None) => {
                return Err("classifier artifact has no threshold".to_string())
            }
            (ArtifactKind::Classifier, Some(t)) if !(0.0..=1.0).contains(&t) => {
                return Err(format!("threshold {t} outside [0, 1]"))
            }
            _ => {}
        }
        Ok(())
    }

    /// Evaluate on an already-ordered feature vector of the right length.
    pub fn evaluate(&self, features: &[f64]) -> ModelOutput {
        let attribution: Vec<f64> = features
            .iter()
            .enumerate()
            .map(|(i, x)| self.coefficients[i] * self.transform(i, *x))
            .collect();
        let raw = self.intercept + attribution.iter().sum::<f64>();
        let value = match self.kind {
            ArtifactKind::Regressor => raw,
            ArtifactKind::Classifier => sigmoid(raw),
        };

        ModelOutput {
            value,
            attribution,
            base_value: self.intercept,
        }
    }

    fn transform(&self, index: usize, x: f64) -> f64 {
        match &self.scaler {
            Some(s) => (x - s.mean[index]) / s.scale[index],
            None => x,
        }
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}
