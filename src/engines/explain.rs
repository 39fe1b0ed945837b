//! Interval construction and deterministic attribution text.

use crate::model_service::{Calibration, ModelOutput};
use crate::types::{Attribution, ConfidenceInterval};

/// Conformal interval: the calibration residual is applied as-is, never re-estimated.
pub fn interval(point: f64, calibration: Calibration) -> ConfidenceInterval {
    ConfidenceInterval::around(point, calibration.q_hat)
}

pub fn attribution(names: Vec<String>, values: Vec<f64>, output: &ModelOutput) -> Attribution {
    Attribution {
        feature_names: names,
        feature_values: values,
        attribution_values: output.attribution.clone(),
        base_value: output.base_value,
    }
}

/// Render each feature's contribution, largest magnitude first.
///
/// Ties in magnitude are ordered by feature name so the text is stable
/// across runs.
pub fn describe_contributions(attribution: &Attribution) -> String {
    let mut items: Vec<(&str, f64, f64)> = attribution
        .feature_names
        .iter()
        .zip(&attribution.feature_values)
        .zip(&attribution.attribution_values)
        .map(|((name, value), contrib)| (name.as_str(), *value, *contrib))
        .collect();

    items.sort_by(|a, b| {
        b.2.abs()
            .partial_cmp(&a.2.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });

    let parts: Vec<String> = items
        .iter()
        .map(|(name, value, contrib)| {
            let direction = if *contrib > 0.0 {
                "increases"
            } else if *contrib < 0.0 {
                "decreases"
            } else {
                "does not change"
            };
            if *contrib == 0.0 {
                format!("{name} ({value:.3}) {direction} the prediction")
            } else {
                format!("{name} ({value:.3}) {direction} the prediction by {:.3}", contrib.abs())
            }
        })
        .collect();

    format!(
        "Relative to a base value of {:.3}, {}.",
        attribution.base_value,
        parts.join("; ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_attribution() -> Attribution {
        Attribution {
            feature_names: vec!["b".into(), "a".into(), "c".into()],
            feature_values: vec![2.0, 1.0, 3.0],
            attribution_values: vec![-0.5, 0.5, 0.0],
            base_value: 6.0,
        }
    }

    #[test]
    fn test_interval_matches_q_hat() {
        let ci = interval(4.2, Calibration { q_hat: 0.6 });
        assert_eq!(ci.lower, 4.2 - 0.6);
        assert_eq!(ci.upper, 4.2 + 0.6);
    }

    #[test]
    fn test_description_is_ordered_and_directional() {
        let text = describe_contributions(&sample_attribution());
        assert_eq!(
            text,
            "Relative to a base value of 6.000, a (1.000) increases the prediction by 0.500; \
             b (2.000) decreases the prediction by 0.500; c (3.000) does not change the prediction."
        );
    }

    #[test]
    fn test_description_is_deterministic() {
        let a = describe_contributions(&sample_attribution());
        let b = describe_contributions(&sample_attribution());
        assert_eq!(a, b);
    }
}
