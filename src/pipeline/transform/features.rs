//! Derived columns: severity score, AQI category, risk level.
//!
//! The weights and thresholds are tuning values, so they live in
//! configuration with the historical numbers as defaults.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{AqiCategory, Measurements, Pollutant, RiskLevel};

/// Weight applied to each pollutant in the severity score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub pm10: f64,
    pub pm2_5: f64,
    pub carbon_monoxide: f64,
    pub nitrogen_dioxide: f64,
    pub sulphur_dioxide: f64,
    pub ozone: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            pm10: 3.0,
            pm2_5: 5.0,
            carbon_monoxide: 2.0,
            nitrogen_dioxide: 4.0,
            sulphur_dioxide: 4.0,
            ozone: 3.0,
        }
    }
}

impl ScoreWeights {
    pub fn weight(&self, pollutant: Pollutant) -> f64 {
        match pollutant {
            Pollutant::Pm10 => self.pm10,
            Pollutant::Pm2_5 => self.pm2_5,
            Pollutant::CarbonMonoxide => self.carbon_monoxide,
            Pollutant::NitrogenDioxide => self.nitrogen_dioxide,
            Pollutant::SulphurDioxide => self.sulphur_dioxide,
            Pollutant::Ozone => self.ozone,
        }
    }
}

/// Inclusive upper bounds for the PM2.5 ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AqiThresholds {
    pub good: f64,
    pub moderate: f64,
    pub unhealthy: f64,
    pub very_unhealthy: f64,
}

impl Default for AqiThresholds {
    fn default() -> Self {
        Self {
            good: 50.0,
            moderate: 100.0,
            unhealthy: 200.0,
            very_unhealthy: 300.0,
        }
    }
}

/// Inclusive upper bounds for the severity score ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    pub low: f64,
    pub moderate: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            low: 200.0,
            moderate: 400.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub weights: ScoreWeights,
    pub aqi_thresholds: AqiThresholds,
    pub risk_thresholds: RiskThresholds,
}

impl FeatureConfig {
    pub fn validate(&self) -> Result<(), String> {
        let weights_ok = Pollutant::ALL
            .iter()
            .all(|p| self.weights.weight(*p).is_finite() && self.weights.weight(*p) >= 0.0);
        if !weights_ok {
            return Err("features.weights must be finite and non-negative".into());
        }
        self.aqi_ladder().check().map_err(|e| format!("features.aqi_thresholds: {}", e))?;
        self.risk_ladder().check().map_err(|e| format!("features.risk_thresholds: {}", e))?;
        Ok(())
    }

    pub fn aqi_ladder(&self) -> Ladder<AqiCategory> {
        let t = &self.aqi_thresholds;
        Ladder {
            steps: vec![
                (t.good, AqiCategory::Good),
                (t.moderate, AqiCategory::Moderate),
                (t.unhealthy, AqiCategory::Unhealthy),
                (t.very_unhealthy, AqiCategory::VeryUnhealthy),
            ],
            above: AqiCategory::Hazardous,
            missing: AqiCategory::Unknown,
        }
    }

    pub fn risk_ladder(&self) -> Ladder<RiskLevel> {
        let t = &self.risk_thresholds;
        Ladder {
            steps: vec![(t.low, RiskLevel::Low), (t.moderate, RiskLevel::Moderate)],
            above: RiskLevel::High,
            missing: RiskLevel::Unknown,
        }
    }

    /// Weighted sum of whatever pollutants are present; `None` when all are
    /// missing or the sum overflows
    pub fn severity_score(&self, m: &Measurements) -> Option<f64> {
        let score = Pollutant::ALL
            .iter()
            .filter_map(|p| m.get(*p).map(|v| v * self.weights.weight(*p)))
            .fold(None, |acc, term| Some(acc.unwrap_or(0.0) + term))?;
        if !score.is_finite() {
            warn!(?m, "severity score out of range, treating as missing");
            return None;
        }
        Some(score)
    }
}

/// Ordered inclusive-upper-bound thresholds mapping a value to a bucket
#[derive(Debug, Clone)]
pub struct Ladder<T> {
    steps: Vec<(f64, T)>,
    above: T,
    missing: T,
}

impl<T: Copy> Ladder<T> {
    pub fn classify(&self, value: Option<f64>) -> T {
        let Some(v) = value else {
            return self.missing;
        };
        self.steps
            .iter()
            .find(|(upper, _)| v <= *upper)
            .map_or(self.above, |(_, bucket)| *bucket)
    }

    fn check(&self) -> Result<(), String> {
        let bounds: Vec<f64> = self.steps.iter().map(|(b, _)| *b).collect();
        if bounds.iter().any(|b| !b.is_finite()) {
            return Err("thresholds must be finite".into());
        }
        if bounds.windows(2).any(|w| w[0] >= w[1]) {
            return Err("thresholds must be strictly increasing".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurements(pm2_5: Option<f64>, pm10: Option<f64>) -> Measurements {
        Measurements {
            pm2_5,
            pm10,
            ..Measurements::default()
        }
    }

    #[test]
    fn test_score_uses_available_fields_only() {
        let features = FeatureConfig::default();
        let m = measurements(None, Some(40.0));
        assert_eq!(features.severity_score(&m), Some(120.0));
        assert_eq!(features.aqi_ladder().classify(m.pm2_5), AqiCategory::Unknown);
    }

    #[test]
    fn test_score_missing_iff_all_missing() {
        let features = FeatureConfig::default();
        assert_eq!(features.severity_score(&Measurements::default()), None);

        let zero = Measurements {
            ozone: Some(0.0),
            ..Measurements::default()
        };
        assert_eq!(features.severity_score(&zero), Some(0.0));
    }

    #[test]
    fn test_overflowing_score_is_missing() {
        let features = FeatureConfig::default();
        let m = measurements(Some(1e308), Some(1e308));
        assert_eq!(features.severity_score(&m), None);
        assert_eq!(features.risk_ladder().classify(features.severity_score(&m)), RiskLevel::Unknown);
    }

    #[test]
    fn test_full_weighting() {
        let features = FeatureConfig::default();
        let m = Measurements {
            pm10: Some(1.0),
            pm2_5: Some(1.0),
            carbon_monoxide: Some(1.0),
            nitrogen_dioxide: Some(1.0),
            sulphur_dioxide: Some(1.0),
            ozone: Some(1.0),
        };
        assert_eq!(features.severity_score(&m), Some(21.0));
    }

    #[test]
    fn test_ladders_are_inclusive() {
        let features = FeatureConfig::default();
        let aqi = features.aqi_ladder();
        assert_eq!(aqi.classify(Some(50.0)), AqiCategory::Good);
        assert_eq!(aqi.classify(Some(50.1)), AqiCategory::Moderate);
        assert_eq!(aqi.classify(Some(300.0)), AqiCategory::VeryUnhealthy);
        assert_eq!(aqi.classify(Some(301.0)), AqiCategory::Hazardous);

        let risk = features.risk_ladder();
        assert_eq!(risk.classify(Some(200.0)), RiskLevel::Low);
        assert_eq!(risk.classify(Some(400.0)), RiskLevel::Moderate);
        assert_eq!(risk.classify(Some(400.5)), RiskLevel::High);
        assert_eq!(risk.classify(None), RiskLevel::Unknown);
    }

    #[test]
    fn test_validate_rejects_unordered_thresholds() {
        let mut features = FeatureConfig::default();
        features.risk_thresholds.moderate = 100.0;
        assert!(features.validate().is_err());

        let mut features = FeatureConfig::default();
        features.weights.pm10 = -1.0;
        assert!(features.validate().is_err());
    }
}
