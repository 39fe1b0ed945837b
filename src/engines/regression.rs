//! Coagulant regression.
//!
//! - Normal: scores alum doses 9 and 10 ppm against the settled-turbidity
//!   model and keeps the dose with the lower predicted turbidity.
//! - Advance: predicts the alum dosage directly from water quality plus
//!   plant flow readings.

use std::collections::HashMap;

use super::{explain, EngineError};
use crate::model_service::{ordered_features, ModelId, ModelService};
use crate::types::{
    DecisionResult, DoseCandidate, NormalRegressionDecision, PlantFlows, Recommendation,
    WaterSample,
};

/// Alum doses (ppm) evaluated by Normal Regression, in preference order.
pub const NORMAL_CANDIDATE_DOSES: [f64; 2] = [9.0, 10.0];

/// Settled turbidity the plant aims to stay under.
pub const TARGET_SETTLED_TURBIDITY_NTU: f64 = 5.0;

/// Engineered feature set for the settled-turbidity model.
///
/// No rolling window exists for a single reading, so `Turb_roll37` is the
/// reading itself.
pub fn normal_features(sample: &WaterSample, dose: f64) -> HashMap<&'static str, f64> {
    let turb = sample.turbidity();
    let ph = sample.ph();
    let cond = sample.conductivity();
    HashMap::from([
        ("Raw_Water_Turbidity", turb),
        ("Turb_roll37", turb),
        ("Turb_sq", turb * turb),
        ("Raw_Water_PH", ph),
        ("Raw_Water_Conductivity", cond),
        ("pH_Cond", ph * cond),
        ("Alum_Dosage_ppm", dose),
        ("Dose_Turb", dose * turb),
    ])
}

pub fn advance_features(sample: &WaterSample, flows: &PlantFlows) -> HashMap<&'static str, f64> {
    HashMap::from([
        ("ph", sample.ph()),
        ("turbidity", sample.turbidity()),
        ("conductivity", sample.conductivity()),
        ("raw_water_flow", flows.raw_water_flow),
        ("d_chamber_flow", flows.d_chamber_flow),
        ("aerator_flow", flows.aerator_flow),
    ])
}

/// Lowest predicted turbidity wins; equal predictions keep the lower dose.
pub fn select_lowest_turbidity(candidates: &[DoseCandidate]) -> Option<DoseCandidate> {
    candidates.iter().copied().reduce(|best, c| {
        if c.predicted < best.predicted
            || (c.predicted == best.predicted && c.dose_ppm < best.dose_ppm)
        {
            c
        } else {
            best
        }
    })
}

pub fn predict_normal(
    models: &dyn ModelService,
    sample: &WaterSample,
) -> Result<NormalRegressionDecision, EngineError> {
    let model = ModelId::NormalRegression;

    let mut candidates = Vec::with_capacity(NORMAL_CANDIDATE_DOSES.len());
    for dose in NORMAL_CANDIDATE_DOSES {
        let (_, features) = ordered_features(models, model, &normal_features(sample, dose))?;
        let output = models.predict(model, &features)?;
        candidates.push(DoseCandidate {
            dose_ppm: dose,
            predicted: output.value,
            delta: None,
        });
    }

    let best = select_lowest_turbidity(&candidates).ok_or(EngineError::NoCandidates)?;

    let (names, values) = ordered_features(models, model, &normal_features(sample, best.dose_ppm))?;
    let output = models.predict(model, &values)?;
    let attribution = explain::attribution(names, values, &output);
    let confidence_interval = explain::interval(best.predicted, models.calibration(model)?);

    let target = if best.predicted <= TARGET_SETTLED_TURBIDITY_NTU {
        "within"
    } else {
        "above"
    };
    let explanation_text = format!(
        "Recommended alum dose is {:.0} ppm with predicted settled turbidity {:.3} NTU, \
         {target} the {:.1} NTU target. {}",
        best.dose_ppm,
        best.predicted,
        TARGET_SETTLED_TURBIDITY_NTU,
        explain::describe_contributions(&attribution),
    );

    Ok(NormalRegressionDecision {
        decision: DecisionResult {
            recommended_value: Recommendation::Dose { ppm: best.dose_ppm },
            predicted_value: best.predicted,
            confidence_interval,
            attribution,
            explanation_text,
        },
        candidates,
    })
}

pub fn predict_advance(
    models: &dyn ModelService,
    sample: &WaterSample,
    flows: &PlantFlows,
) -> Result<DecisionResult, EngineError> {
    flows.validate()?;
    let model = ModelId::AdvanceRegression;

    let (names, values) = ordered_features(models, model, &advance_features(sample, flows))?;
    let output = models.predict(model, &values)?;
    let dosage = output.value;
    let attribution = explain::attribution(names, values, &output);
    let confidence_interval = explain::interval(dosage, models.calibration(model)?);

    let explanation_text = format!(
        "Predicted alum dosage is {:.2} ppm (interval {:.2} to {:.2}). {}",
        dosage,
        confidence_interval.lower,
        confidence_interval.upper,
        explain::describe_contributions(&attribution),
    );

    Ok(DecisionResult {
        recommended_value: Recommendation::Dose { ppm: dosage },
        predicted_value: dosage,
        confidence_interval,
        attribution,
        explanation_text,
    })
}
