//! Safe-band dose optimizer shared by Pre-Lime and Post-Lime.
//!
//! Each candidate dose is scored by the model; the lowest dose whose
//! resulting pH lies inside the band wins. When no candidate is inside,
//! the one closest to either band edge wins, lower dose on ties.

use std::collections::HashMap;

use super::{explain, EngineError};
use crate::model_service::{ordered_features, ModelId, ModelService};
use crate::types::{DecisionResult, DoseCandidate, DoseDecision, Recommendation, SafeBand, WaterSample};

/// Distances closer than this are treated as equal when tie-breaking.
const DISTANCE_EPSILON: f64 = 1e-9;

/// How the model output maps to the resulting pH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoseResponse {
    /// Model predicts the resulting pH directly.
    Absolute,
    /// Model predicts ΔpH; resulting pH = input pH + ΔpH.
    DeltaFromInput,
}

#[derive(Debug, Clone, Copy)]
pub struct DoseOptimizer {
    pub model: ModelId,
    pub band: SafeBand,
    pub candidates: &'static [f64],
    pub dose_feature: &'static str,
    pub response: DoseResponse,
    /// Human label used in explanation text, e.g. "pre-lime".
    pub label: &'static str,
    /// What the resulting pH is called, e.g. "settled pH".
    pub outcome: &'static str,
}

/// Only 0 ppm appears in the historical pre-lime data.
pub const PRE_LIME: DoseOptimizer = DoseOptimizer {
    model: ModelId::PreLime,
    band: SafeBand::new(6.0, 6.6),
    candidates: &[0.0],
    dose_feature: "pre_lime_dose_ppm",
    response: DoseResponse::Absolute,
    label: "pre-lime",
    outcome: "settled pH",
};

pub const POST_LIME: DoseOptimizer = DoseOptimizer {
    model: ModelId::PostLime,
    band: SafeBand::new(6.8, 7.2),
    candidates: &[4.0, 5.0],
    dose_feature: "post_lime_dose_ppm",
    response: DoseResponse::DeltaFromInput,
    label: "post-lime",
    outcome: "final treated pH",
};

impl DoseOptimizer {
    fn inputs(&self, sample: &WaterSample, dose: f64) -> HashMap<&'static str, f64> {
        HashMap::from([
            ("raw_water_ph", sample.ph()),
            ("raw_water_turbidity", sample.turbidity()),
            ("raw_water_conductivity", sample.conductivity()),
            (self.dose_feature, dose),
        ])
    }

    /// Evaluate every candidate dose and build the full decision.
    pub fn recommend(
        &self,
        models: &dyn ModelService,
        sample: &WaterSample,
    ) -> Result<DoseDecision, EngineError> {
        let mut candidates = Vec::with_capacity(self.candidates.len());
        for &dose in self.candidates {
            let (_, features) = ordered_features(models, self.model, &self.inputs(sample, dose))?;
            let output = models.predict(self.model, &features)?;
            candidates.push(match self.response {
                DoseResponse::Absolute => DoseCandidate {
                    dose_ppm: dose,
                    predicted: output.value,
                    delta: None,
                },
                DoseResponse::DeltaFromInput => DoseCandidate {
                    dose_ppm: dose,
                    predicted: sample.ph() + output.value,
                    delta: Some(output.value),
                },
            });
        }

        let best = select_dose(&candidates, &self.band).ok_or(EngineError::NoCandidates)?;

        // Attribution is taken at the chosen dose.
        let (names, values) =
            ordered_features(models, self.model, &self.inputs(sample, best.dose_ppm))?;
        let output = models.predict(self.model, &values)?;
        let attribution = explain::attribution(names, values, &output);
        let confidence_interval = explain::interval(best.predicted, models.calibration(self.model)?);
        let band_position = self.band.position(best.predicted);

        let explanation_text = format!(
            "Recommended {} dose is {:.1} ppm for raw water at pH {:.2}, turbidity {:.2} NTU and \
             conductivity {:.1} µS/cm. The predicted {} of {:.2} is {} the safe band [{:.2}, {:.2}]. {}",
            self.label,
            best.dose_ppm,
            sample.ph(),
            sample.turbidity(),
            sample.conductivity(),
            self.outcome,
            best.predicted,
            band_position,
            self.band.lower,
            self.band.upper,
            explain::describe_contributions(&attribution),
        );

        Ok(DoseDecision {
            decision: DecisionResult {
                recommended_value: Recommendation::Dose { ppm: best.dose_ppm },
                predicted_value: best.predicted,
                confidence_interval,
                attribution,
                explanation_text,
            },
            safe_band: self.band,
            band_position,
            predicted_delta_ph: best.delta,
            candidates,
        })
    }
}

/// Band selection over evaluated candidates.
pub fn select_dose(candidates: &[DoseCandidate], band: &SafeBand) -> Option<DoseCandidate> {
    let lowest_inside = candidates
        .iter()
        .filter(|c| band.contains(c.predicted))
        .min_by(|a, b| a.dose_ppm.total_cmp(&b.dose_ppm));
    if let Some(best) = lowest_inside {
        return Some(*best);
    }

    candidates.iter().copied().reduce(|best, c| {
        let d_best = band.edge_distance(best.predicted);
        let d_c = band.edge_distance(c.predicted);
        if (d_c - d_best).abs() <= DISTANCE_EPSILON {
            if c.dose_ppm < best.dose_ppm {
                c
            } else {
                best
            }
        } else if d_c < d_best {
            c
        } else {
            best
        }
    })
}
