//! Scan plan value types: the angle sequence and acquisition settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Immutable description of the waveplate angle sequence.
///
/// The generated sequence starts at `start_deg`, advances by exactly
/// `step_deg` per point and is monotonic in the direction of `step_deg`.
/// The last point is clipped to `end_deg` if floating-point accumulation
/// would carry it past the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnglePlan {
    /// First waveplate angle in degrees.
    pub start_deg: f64,
    /// Final waveplate angle in degrees.
    pub end_deg: f64,
    /// Angle increment in degrees; sign must match the direction of travel.
    pub step_deg: f64,
}

impl AnglePlan {
    /// Build a validated plan.
    pub fn new(start_deg: f64, end_deg: f64, step_deg: f64) -> Result<Self, ConfigError> {
        let plan = Self {
            start_deg,
            end_deg,
            step_deg,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Check plan invariants without touching hardware.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.start_deg.is_finite() || !self.end_deg.is_finite() || !self.step_deg.is_finite() {
            return Err(ConfigError::NonFiniteAngle);
        }
        if self.step_deg == 0.0 {
            return Err(ConfigError::ZeroStep);
        }
        if (self.end_deg - self.start_deg) * self.step_deg < 0.0 {
            return Err(ConfigError::StepDirection {
                start_deg: self.start_deg,
                end_deg: self.end_deg,
                step_deg: self.step_deg,
            });
        }
        Ok(())
    }

    /// Number of target angles: `floor((end - start) / step) + 1`.
    ///
    /// The quotient is nudged before flooring so float drift that lands it
    /// just below an integer (0.3 / 0.1 < 3) cannot drop the endpoint.
    pub fn len(&self) -> usize {
        let quotient = (self.end_deg - self.start_deg) / self.step_deg;
        (quotient + 1e-9).floor() as usize + 1
    }

    /// Always false for a validated plan (it contains at least `start_deg`).
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Lazy, restartable iterator over the target angles in plan order.
    pub fn angles(&self) -> impl Iterator<Item = f64> {
        let plan = *self;
        (0..plan.len()).map(move |i| {
            let angle = plan.start_deg + i as f64 * plan.step_deg;
            // Clip the endpoint against float drift.
            if (plan.step_deg > 0.0 && angle > plan.end_deg)
                || (plan.step_deg < 0.0 && angle < plan.end_deg)
            {
                plan.end_deg
            } else {
                angle
            }
        })
    }
}

/// Spectrometer acquisition settings, immutable once a scan starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Exposure time per accumulation.
    #[serde(with = "humantime_serde")]
    pub exposure: Duration,
    /// Number of exposures summed per acquisition.
    pub accumulations: u32,
}

impl AcquisitionSettings {
    /// Build validated settings.
    pub fn new(exposure: Duration, accumulations: u32) -> Result<Self, ConfigError> {
        let settings = Self {
            exposure,
            accumulations,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Check settings invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exposure.is_zero() {
            return Err(ConfigError::NonPositiveExposure);
        }
        if self.accumulations == 0 {
            return Err(ConfigError::ZeroAccumulations);
        }
        Ok(())
    }

    /// Total integration time per acquisition (exposure × accumulations).
    pub fn total_integration(&self) -> Duration {
        self.exposure * self.accumulations
    }
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            exposure: Duration::from_millis(10),
            accumulations: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_plan_generates_expected_sequence() {
        let plan = AnglePlan::new(0.0, 180.0, 30.0).unwrap();
        let angles: Vec<f64> = plan.angles().collect();
        assert_eq!(angles, vec![0.0, 30.0, 60.0, 90.0, 120.0, 150.0, 180.0]);
        assert_eq!(plan.len(), 7);
    }

    #[test]
    fn reverse_plan_is_monotonic_decreasing() {
        let plan = AnglePlan::new(90.0, 0.0, -45.0).unwrap();
        let angles: Vec<f64> = plan.angles().collect();
        assert_eq!(angles, vec![90.0, 45.0, 0.0]);
    }

    #[test]
    fn non_divisible_span_clips_short_of_end() {
        let plan = AnglePlan::new(0.0, 100.0, 30.0).unwrap();
        let angles: Vec<f64> = plan.angles().collect();
        // floor(100/30) + 1 = 4 points; 100 is never reached.
        assert_eq!(angles, vec![0.0, 30.0, 60.0, 90.0]);
    }

    #[test]
    fn single_point_plan() {
        let plan = AnglePlan::new(15.0, 15.0, 5.0).unwrap();
        let angles: Vec<f64> = plan.angles().collect();
        assert_eq!(angles, vec![15.0]);
    }

    #[test]
    fn fractional_step_reaches_clipped_endpoint() {
        let plan = AnglePlan::new(0.0, 1.0, 0.1).unwrap();
        let angles: Vec<f64> = plan.angles().collect();
        assert_eq!(angles.len(), 11);
        assert_eq!(*angles.last().unwrap(), 1.0);
        // Consecutive points differ by the step.
        for pair in angles.windows(2) {
            assert!((pair[1] - pair[0] - 0.1).abs() < 1e-9);
        }
    }

    #[test]
    fn float_drift_below_integer_quotient_keeps_endpoint() {
        // 0.3 / 0.1 computes to just under 3; the plan still has 4 points.
        let plan = AnglePlan::new(0.0, 0.3, 0.1).unwrap();
        assert_eq!(plan.len(), 4);
        let angles: Vec<f64> = plan.angles().collect();
        assert_eq!(angles.len(), 4);
        assert_eq!(*angles.last().unwrap(), 0.3);
    }

    #[test]
    fn angles_iterator_is_restartable() {
        let plan = AnglePlan::new(0.0, 60.0, 20.0).unwrap();
        let first: Vec<f64> = plan.angles().collect();
        let second: Vec<f64> = plan.angles().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_plans_rejected() {
        assert_eq!(
            AnglePlan::new(0.0, 90.0, 0.0).unwrap_err(),
            ConfigError::ZeroStep
        );
        assert!(matches!(
            AnglePlan::new(0.0, 90.0, -10.0).unwrap_err(),
            ConfigError::StepDirection { .. }
        ));
        assert_eq!(
            AnglePlan::new(f64::NAN, 90.0, 10.0).unwrap_err(),
            ConfigError::NonFiniteAngle
        );
    }

    #[test]
    fn invalid_settings_rejected() {
        assert_eq!(
            AcquisitionSettings::new(Duration::ZERO, 1).unwrap_err(),
            ConfigError::NonPositiveExposure
        );
        assert_eq!(
            AcquisitionSettings::new(Duration::from_millis(10), 0).unwrap_err(),
            ConfigError::ZeroAccumulations
        );
    }

    #[test]
    fn total_integration_scales_with_accumulations() {
        let settings = AcquisitionSettings::new(Duration::from_millis(50), 4).unwrap();
        assert_eq!(settings.total_integration(), Duration::from_millis(200));
    }
}
