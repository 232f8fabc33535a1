//! Live analysis: spectral windowing, the per-point metric series and the
//! cos² polarization fit.

pub mod feed;
pub mod fit;

pub use feed::LiveAnalysisFeed;
pub use fit::{fit_cos_squared, FitResult};

use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, ConfigError};
use crate::hardware::Spectrum;

/// Closed wavelength interval used to reduce a spectrum to one number.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectralWindow {
    low_nm: f64,
    high_nm: f64,
}

impl SpectralWindow {
    /// Build a validated window; the lower edge must sit strictly below the
    /// upper edge.
    pub fn new(low_nm: f64, high_nm: f64) -> Result<Self, ConfigError> {
        if !low_nm.is_finite() || !high_nm.is_finite() || low_nm >= high_nm {
            return Err(ConfigError::InvalidWindow { low_nm, high_nm });
        }
        Ok(Self { low_nm, high_nm })
    }

    /// Lower edge in nanometres.
    pub fn low_nm(&self) -> f64 {
        self.low_nm
    }

    /// Upper edge in nanometres.
    pub fn high_nm(&self) -> f64 {
        self.high_nm
    }

    /// Whether a wavelength falls inside the window (edges included).
    pub fn contains(&self, wavelength_nm: f64) -> bool {
        (self.low_nm..=self.high_nm).contains(&wavelength_nm)
    }

    /// Maximum intensity among the samples inside the window.
    pub fn peak_metric(&self, spectrum: &Spectrum) -> Result<f64, AnalysisError> {
        spectrum
            .samples()
            .filter(|(nm, _)| self.contains(*nm))
            .map(|(_, counts)| counts)
            .fold(None, |best: Option<f64>, counts| {
                Some(best.map_or(counts, |b| b.max(counts)))
            })
            .ok_or(AnalysisError::EmptyWindow {
                low_nm: self.low_nm,
                high_nm: self.high_nm,
            })
    }
}

/// One reduced measurement: the metric extracted from one scan point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AnalysisPoint {
    /// Plan index of the source point.
    pub index: usize,
    /// Stage-reported waveplate angle in degrees.
    pub angle_deg: f64,
    /// Peak intensity inside the window; `None` when the window held no
    /// samples for this spectrum.
    pub metric: Option<f64>,
}
