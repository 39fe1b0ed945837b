//! Predictions requested through the API.
//!
//! Unlike backfill predictions these are not keyed by sensor reading:
//! every request is its own document with a fresh `record_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{ClassificationDecision, DecisionResult, DoseDecision, NormalRegressionDecision};

/// Which manual prediction endpoint produced a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualKind {
    PreLime,
    PostLime,
    Classification,
    NormalRegression,
    AdvanceRegression,
}

impl ManualKind {
    pub const ALL: [Self; 5] = [
        Self::PreLime,
        Self::PostLime,
        Self::Classification,
        Self::NormalRegression,
        Self::AdvanceRegression,
    ];

    pub const fn collection(self) -> &'static str {
        match self {
            Self::PreLime => "pre_lime_predictions",
            Self::PostLime => "post_lime_predictions",
            Self::Classification => "classification_predictions",
            Self::NormalRegression => "normal_regression_predictions",
            Self::AdvanceRegression => "advance_regression_predictions",
        }
    }

    /// URL slug for `/api/v1/history/:kind`.
    pub const fn slug(self) -> &'static str {
        match self {
            Self::PreLime => "pre-lime",
            Self::PostLime => "post-lime",
            Self::Classification => "classification",
            Self::NormalRegression => "normal-regression",
            Self::AdvanceRegression => "advance-regression",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.slug() == slug)
    }
}

impl std::fmt::Display for ManualKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "decision", rename_all = "snake_case")]
pub enum ManualResult {
    PreLime(DoseDecision),
    PostLime(DoseDecision),
    Classification(ClassificationDecision),
    NormalRegression(NormalRegressionDecision),
    AdvanceRegression(DecisionResult),
}

impl ManualResult {
    pub const fn kind(&self) -> ManualKind {
        match self {
            Self::PreLime(_) => ManualKind::PreLime,
            Self::PostLime(_) => ManualKind::PostLime,
            Self::Classification(_) => ManualKind::Classification,
            Self::NormalRegression(_) => ManualKind::NormalRegression,
            Self::AdvanceRegression(_) => ManualKind::AdvanceRegression,
        }
    }
}

/// One stored manual prediction: the request inputs and the decision returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualPrediction {
    pub record_id: String,
    /// Request fields by their API names (`raw_ph`, `turbidity`, ...).
    pub raw_inputs: BTreeMap<String, f64>,
    pub result: ManualResult,
    pub created_at: DateTime<Utc>,
}

impl ManualPrediction {
    pub fn new(raw_inputs: BTreeMap<String, f64>, result: ManualResult, now: DateTime<Utc>) -> Self {
        Self {
            record_id: uuid::Uuid::new_v4().to_string(),
            raw_inputs,
            result,
            created_at: now,
        }
    }

    pub const fn kind(&self) -> ManualKind {
        self.result.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugs_and_collections_are_unique() {
        for kind in ManualKind::ALL {
            assert_eq!(ManualKind::from_slug(kind.slug()), Some(kind));
        }
        let mut collections: Vec<_> = ManualKind::ALL.iter().map(|k| k.collection()).collect();
        collections.sort_unstable();
        collections.dedup();
        assert_eq!(collections.len(), 5);
        assert_eq!(ManualKind::from_slug("regression"), None);
    }
}
