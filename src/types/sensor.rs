//! Raw-water sensor readings and their validated engine input form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// pH scale bounds accepted from sensors and manual requests.
pub const PH_MIN: f64 = 0.0;
pub const PH_MAX: f64 = 14.0;

/// A raw reading produced by the plant's sensor ingestion device.
///
/// Read-only to the pipeline. `id` is assigned by the store (or by the
/// `ingest` subcommand) and never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub ph: f64,
    pub turbidity: f64,
    pub conductivity: f64,
    /// Plant flow readings (m³/h). Only some installations report these;
    /// Advance Regression runs when all three are present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_water_flow: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d_chamber_flow: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aerator_flow: Option<f64>,
}

impl SensorRecord {
    /// Reading with only the three water-quality channels populated.
    pub fn new(
        id: impl Into<String>,
        created_at: DateTime<Utc>,
        ph: f64,
        turbidity: f64,
        conductivity: f64,
    ) -> Self {
        Self {
            id: id.into(),
            created_at,
            ph,
            turbidity,
            conductivity,
            raw_water_flow: None,
            d_chamber_flow: None,
            aerator_flow: None,
        }
    }

    /// Validated water-quality sample for the decision engines.
    pub fn sample(&self) -> Result<WaterSample, ValidationError> {
        WaterSample::new(self.ph, self.turbidity, self.conductivity)
    }

    /// Flow readings, if the record carries all of them.
    pub fn flows(&self) -> Option<PlantFlows> {
        Some(PlantFlows {
            raw_water_flow: self.raw_water_flow?,
            d_chamber_flow: self.d_chamber_flow?,
            aerator_flow: self.aerator_flow?,
        })
    }
}

/// A reading as delivered to `clearwell ingest`: one JSON object per line.
///
/// `id` and `createdAt` are filled in when absent. Values are stored as
/// given; range checks happen per stage in the pipeline.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingReading {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    pub ph: f64,
    pub turbidity: f64,
    pub conductivity: f64,
    #[serde(default)]
    pub raw_water_flow: Option<f64>,
    #[serde(default)]
    pub d_chamber_flow: Option<f64>,
    #[serde(default)]
    pub aerator_flow: Option<f64>,
}

impl IncomingReading {
    pub fn into_record(self, now: DateTime<Utc>) -> SensorRecord {
        SensorRecord {
            id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            created_at: self.created_at.unwrap_or(now),
            ph: self.ph,
            turbidity: self.turbidity,
            conductivity: self.conductivity,
            raw_water_flow: self.raw_water_flow,
            d_chamber_flow: self.d_chamber_flow,
            aerator_flow: self.aerator_flow,
        }
    }
}

/// Plant flow readings consumed by Advance Regression.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlantFlows {
    pub raw_water_flow: f64,
    pub d_chamber_flow: f64,
    pub aerator_flow: f64,
}

impl PlantFlows {
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_non_negative("raw_water_flow", self.raw_water_flow)?;
        check_non_negative("d_chamber_flow", self.d_chamber_flow)?;
        check_non_negative("aerator_flow", self.aerator_flow)
    }
}

/// Range-checked water-quality inputs.
///
/// Constructing one is the only validation gate in front of the engines,
/// so a `WaterSample` in hand is always within physical bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaterSample {
    ph: f64,
    turbidity: f64,
    conductivity: f64,
}

impl WaterSample {
    pub fn new(ph: f64, turbidity: f64, conductivity: f64) -> Result<Self, ValidationError> {
        if !ph.is_finite() {
            return Err(ValidationError::NotFinite { field: "ph" });
        }
        if !(PH_MIN..=PH_MAX).contains(&ph) {
            return Err(ValidationError::PhOutOfRange(ph));
        }
        check_non_negative("turbidity", turbidity)?;
        check_non_negative("conductivity", conductivity)?;
        Ok(Self {
            ph,
            turbidity,
            conductivity,
        })
    }

    pub fn ph(&self) -> f64 {
        self.ph
    }

    pub fn turbidity(&self) -> f64 {
        self.turbidity
    }

    pub fn conductivity(&self) -> f64 {
        self.conductivity
    }

    /// Same turbidity/conductivity with a different pH, e.g. the settled pH
    /// handed from Pre-Lime to Post-Lime.
    pub fn with_ph(&self, ph: f64) -> Result<Self, ValidationError> {
        Self::new(ph, self.turbidity, self.conductivity)
    }
}

fn check_non_negative(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NotFinite { field });
    }
    if value < 0.0 {
        return Err(ValidationError::Negative { field, value });
    }
    Ok(())
}

/// Malformed or out-of-range sensor fields.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("ph must be between 0 and 14 (got {0})")]
    PhOutOfRange(f64),
    #[error("{field} must be >= 0 (got {value})")]
    Negative { field: &'static str, value: f64 },
    #[error("{field} must be a finite number")]
    NotFinite { field: &'static str },
    #[error("Missing required fields: {0}")]
    MissingFields(String),
    #[error("{0} must be a numeric value")]
    NotNumeric(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_accepts_valid_reading() {
        let sample = WaterSample::new(7.0, 12.0, 450.0).unwrap();
        assert_eq!(sample.ph(), 7.0);
        assert_eq!(sample.turbidity(), 12.0);
        assert_eq!(sample.conductivity(), 450.0);
    }

    #[test]
    fn test_ph_bounds_are_inclusive() {
        assert!(WaterSample::new(0.0, 1.0, 1.0).is_ok());
        assert!(WaterSample::new(14.0, 1.0, 1.0).is_ok());
        assert_eq!(
            WaterSample::new(14.5, 1.0, 1.0),
            Err(ValidationError::PhOutOfRange(14.5))
        );
    }

    #[test]
    fn test_negative_and_nan_rejected() {
        assert!(matches!(
            WaterSample::new(7.0, -1.0, 1.0),
            Err(ValidationError::Negative { field: "turbidity", .. })
        ));
        assert!(matches!(
            WaterSample::new(f64::NAN, 1.0, 1.0),
            Err(ValidationError::NotFinite { field: "ph" })
        ));
    }

    #[test]
    fn test_incoming_reading_fills_id_and_timestamp() {
        let now = Utc::now();
        let reading: IncomingReading =
            serde_json::from_str(r#"{"ph": 7.1, "turbidity": 10, "conductivity": 400}"#).unwrap();
        let record = reading.into_record(now);
        assert_eq!(record.created_at, now);
        assert_eq!(record.id.len(), 36);

        let reading: IncomingReading = serde_json::from_str(
            r#"{"id": "dev-1", "createdAt": "2024-03-01T08:00:00Z", "ph": 7.1, "turbidity": 10,
                "conductivity": 400, "aeratorFlow": 250}"#,
        )
        .unwrap();
        let record = reading.into_record(now);
        assert_eq!(record.id, "dev-1");
        assert_eq!(record.created_at.to_rfc3339(), "2024-03-01T08:00:00+00:00");
        assert_eq!(record.aerator_flow, Some(250.0));
    }

    #[test]
    fn test_flows_require_all_three() {
        let mut record = SensorRecord::new("r1", Utc::now(), 7.0, 12.0, 450.0);
        assert!(record.flows().is_none());
        record.raw_water_flow = Some(1200.0);
        record.d_chamber_flow = Some(600.0);
        assert!(record.flows().is_none());
        record.aerator_flow = Some(300.0);
        assert_eq!(record.flows().map(|f| f.aerator_flow), Some(300.0));
    }

    #[test]
    fn test_record_json_uses_camel_case() {
        let record = SensorRecord::new("r1", Utc::now(), 7.0, 12.0, 450.0);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("createdAt").is_some());
        assert!(json.get("rawWaterFlow").is_none());
    }
}
