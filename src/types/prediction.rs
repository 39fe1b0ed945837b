//! Persisted per-stage predictions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{ClassificationDecision, DoseDecision, RegressionDecision};

/// One decision computation in the backfill pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PreLime,
    PostLime,
    Classification,
    Regression,
}

impl Stage {
    /// Execution order within a record. Post-Lime follows Pre-Lime.
    pub const ALL: [Self; 4] = [
        Self::PreLime,
        Self::PostLime,
        Self::Classification,
        Self::Regression,
    ];

    /// Store collection holding this stage's predictions.
    pub const fn collection(self) -> &'static str {
        match self {
            Self::PreLime => "pre_lime_auto_predictions",
            Self::PostLime => "post_lime_auto_predictions",
            Self::Classification => "classification_auto_predictions",
            Self::Regression => "regression_auto_predictions",
        }
    }

    /// URL slug used by the history API.
    pub const fn slug(self) -> &'static str {
        match self {
            Self::PreLime => "pre-lime",
            Self::PostLime => "post-lime",
            Self::Classification => "classification",
            Self::Regression => "regression",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.slug() == slug)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreLime => write!(f, "PreLime"),
            Self::PostLime => write!(f, "PostLime"),
            Self::Classification => write!(f, "Classification"),
            Self::Regression => write!(f, "Regression"),
        }
    }
}

/// Stage-specific decision payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "decision", rename_all = "snake_case")]
pub enum StageResult {
    PreLime(DoseDecision),
    PostLime(DoseDecision),
    Classification(ClassificationDecision),
    Regression(RegressionDecision),
}

impl StageResult {
    pub const fn stage(&self) -> Stage {
        match self {
            Self::PreLime(_) => Stage::PreLime,
            Self::PostLime(_) => Stage::PostLime,
            Self::Classification(_) => Stage::Classification,
            Self::Regression(_) => Stage::Regression,
        }
    }
}

/// The single persisted result of one stage for one sensor record.
///
/// Written once; `(stage, sensor_record_id)` is unique in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagePrediction {
    pub sensor_record_id: String,
    pub sensor_created_at: DateTime<Utc>,
    /// Feature snapshot the engine was given, keyed by input name.
    pub raw_inputs: BTreeMap<String, f64>,
    pub result: StageResult,
    pub predicted_at: DateTime<Utc>,
}

impl StagePrediction {
    pub const fn stage(&self) -> Stage {
        self.result.stage()
    }
}

/// History filter used by the API layer. Bounds are inclusive on `predicted_at`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl HistoryQuery {
    pub fn latest(limit: usize) -> Self {
        Self {
            start: None,
            end: None,
            limit,
        }
    }

    /// `start` after `end`: nothing can match.
    pub fn is_inverted(&self) -> bool {
        matches!((self.start, self.end), (Some(s), Some(e)) if s > e)
    }

    pub fn matches(&self, predicted_at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| predicted_at >= s) && self.end.map_or(true, |e| predicted_at <= e)
    }
}
