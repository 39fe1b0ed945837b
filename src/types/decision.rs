//! Decision payloads produced by the engines.

use serde::{Deserialize, Serialize};

/// Conformal-style prediction interval around a point prediction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    /// Fixed-width interval `[point - q_hat, point + q_hat]`.
    pub fn around(point: f64, q_hat: f64) -> Self {
        Self {
            lower: point - q_hat,
            upper: point + q_hat,
        }
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Per-feature signed contributions relative to `base_value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribution {
    pub feature_names: Vec<String>,
    pub feature_values: Vec<f64>,
    pub attribution_values: Vec<f64>,
    pub base_value: f64,
}

/// What the engine recommends.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recommendation {
    /// Chemical dose in ppm.
    Dose { ppm: f64 },
    /// Water safety class.
    Class { label: WaterStatus },
}

impl Recommendation {
    pub fn dose_ppm(&self) -> Option<f64> {
        match self {
            Self::Dose { ppm } => Some(*ppm),
            Self::Class { .. } => None,
        }
    }
}

/// Common decision envelope shared by every engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionResult {
    pub recommended_value: Recommendation,
    /// Point prediction the interval is centred on (pH, NTU, ppm or probability).
    pub predicted_value: f64,
    pub confidence_interval: ConfidenceInterval,
    pub attribution: Attribution,
    pub explanation_text: String,
}

// ============================================================================
// Dose optimizers
// ============================================================================

/// Inclusive acceptable pH range targeted by a dose optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafeBand {
    pub lower: f64,
    pub upper: f64,
}

impl SafeBand {
    pub const fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    pub fn contains(&self, ph: f64) -> bool {
        self.lower <= ph && ph <= self.upper
    }

    /// Distance to the nearest band edge.
    pub fn edge_distance(&self, ph: f64) -> f64 {
        (ph - self.lower).abs().min((ph - self.upper).abs())
    }

    pub fn position(&self, ph: f64) -> BandPosition {
        if ph < self.lower {
            BandPosition::Below
        } else if ph > self.upper {
            BandPosition::Above
        } else {
            BandPosition::Inside
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandPosition {
    Below,
    Inside,
    Above,
}

impl std::fmt::Display for BandPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Below => write!(f, "below"),
            Self::Inside => write!(f, "inside"),
            Self::Above => write!(f, "above"),
        }
    }
}

/// One evaluated candidate dose.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoseCandidate {
    pub dose_ppm: f64,
    /// Resulting pH for lime stages, settled turbidity for coagulant.
    pub predicted: f64,
    /// Raw model output when it is a delta (Post-Lime ΔpH).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
}

/// Pre-Lime / Post-Lime decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoseDecision {
    #[serde(flatten)]
    pub decision: DecisionResult,
    pub safe_band: SafeBand,
    pub band_position: BandPosition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted_delta_ph: Option<f64>,
    pub candidates: Vec<DoseCandidate>,
}

impl DoseDecision {
    pub fn recommended_dose_ppm(&self) -> f64 {
        self.decision.recommended_value.dose_ppm().unwrap_or_default()
    }

    /// Resulting pH at the recommended dose.
    pub fn predicted_ph(&self) -> f64 {
        self.decision.predicted_value
    }
}

// ============================================================================
// Classification
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaterStatus {
    Normal,
    Abnormal,
}

impl std::fmt::Display for WaterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "NORMAL"),
            Self::Abnormal => write!(f, "ABNORMAL"),
        }
    }
}

/// Routing hint for downstream consumers. The backfill does not branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NextAction {
    NormalRegression,
    AdvanceRegression,
}

impl From<WaterStatus> for NextAction {
    fn from(status: WaterStatus) -> Self {
        match status {
            WaterStatus::Abnormal => Self::AdvanceRegression,
            WaterStatus::Normal => Self::NormalRegression,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationDecision {
    #[serde(flatten)]
    pub decision: DecisionResult,
    pub status: WaterStatus,
    pub abnormal_probability: f64,
    pub threshold: f64,
    pub next_action: NextAction,
}

// ============================================================================
// Regression
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalRegressionDecision {
    #[serde(flatten)]
    pub decision: DecisionResult,
    pub candidates: Vec<DoseCandidate>,
}

/// Regression stage payload: Normal always, Advance when flow readings exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegressionDecision {
    pub normal: NormalRegressionDecision,
    pub advance: Option<DecisionResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_is_symmetric() {
        let ci = ConfidenceInterval::around(6.3, 0.25);
        assert_eq!(ci.lower, 6.3 - 0.25);
        assert_eq!(ci.upper, 6.3 + 0.25);
    }

    #[test]
    fn test_band_position() {
        let band = SafeBand::new(6.8, 7.2);
        assert_eq!(band.position(6.8), BandPosition::Inside);
        assert_eq!(band.position(7.2), BandPosition::Inside);
        assert_eq!(band.position(6.79), BandPosition::Below);
        assert_eq!(band.position(7.3), BandPosition::Above);
        assert!((band.edge_distance(7.3) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_next_action_follows_status() {
        assert_eq!(NextAction::from(WaterStatus::Abnormal), NextAction::AdvanceRegression);
        assert_eq!(NextAction::from(WaterStatus::Normal), NextAction::NormalRegression);
    }

    #[test]
    fn test_status_serializes_upper_case() {
        let json = serde_json::to_string(&NextAction::AdvanceRegression).unwrap();
        assert_eq!(json, "\"ADVANCE_REGRESSION\"");
    }
}
