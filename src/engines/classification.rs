//! Water safety classification.
//!
//! A probability at or above the model's threshold is ABNORMAL and routes
//! to Advance Regression; anything below is NORMAL.

use std::collections::HashMap;

use super::{explain, EngineError};
use crate::model_service::{ordered_features, ModelId, ModelService};
use crate::types::{
    ClassificationDecision, DecisionResult, NextAction, Recommendation, WaterSample, WaterStatus,
};

pub fn decide_status(abnormal_probability: f64, threshold: f64) -> WaterStatus {
    if abnormal_probability >= threshold {
        WaterStatus::Abnormal
    } else {
        WaterStatus::Normal
    }
}

/// Feature names as the classifier was trained on them.
pub fn classification_inputs(sample: &WaterSample) -> HashMap<&'static str, f64> {
    HashMap::from([
        ("Raw_Water_PH", sample.ph()),
        ("Raw_Water_Turbidity", sample.turbidity()),
        ("Raw_Water_Conductivity", sample.conductivity()),
    ])
}

pub fn classify(
    models: &dyn ModelService,
    sample: &WaterSample,
) -> Result<ClassificationDecision, EngineError> {
    let model = ModelId::Classification;
    let (names, values) = ordered_features(models, model, &classification_inputs(sample))?;
    let output = models.predict(model, &values)?;
    let threshold = models.threshold(model)?;

    let probability = output.value;
    let status = decide_status(probability, threshold);
    let next_action = NextAction::from(status);

    // Interval is on the probability scale and left unclamped.
    let confidence_interval = explain::interval(probability, models.calibration(model)?);
    let attribution = explain::attribution(names, values, &output);

    let explanation_text = format!(
        "Water is classified {status}: abnormal probability {:.3} is {} the threshold {:.3}. \
         Next step is {}. Contributions are in log-odds. {}",
        probability,
        if status == WaterStatus::Abnormal {
            "at or above"
        } else {
            "below"
        },
        threshold,
        match next_action {
            NextAction::AdvanceRegression => "advance regression",
            NextAction::NormalRegression => "normal regression",
        },
        explain::describe_contributions(&attribution),
    );

    Ok(ClassificationDecision {
        decision: DecisionResult {
            recommended_value: Recommendation::Class { label: status },
            predicted_value: probability,
            confidence_interval,
            attribution,
            explanation_text,
        },
        status,
        abnormal_probability: probability,
        threshold,
        next_action,
    })
}
