//! Hardware capability traits, spectrum data type and mock devices.

pub mod capabilities;
pub mod mock;

pub use capabilities::{RotationStage, Spectrometer};

use serde::Serialize;

/// One acquired spectrum: ordered wavelength/count arrays of equal length.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Spectrum {
    wavelengths_nm: Vec<f64>,
    counts: Vec<f64>,
}

impl Spectrum {
    /// Build a spectrum from parallel wavelength and count arrays.
    ///
    /// The arrays are truncated to the shorter length if they disagree;
    /// adapters are expected to hand over equal-length arrays.
    pub fn new(mut wavelengths_nm: Vec<f64>, mut counts: Vec<f64>) -> Self {
        let len = wavelengths_nm.len().min(counts.len());
        wavelengths_nm.truncate(len);
        counts.truncate(len);
        Self {
            wavelengths_nm,
            counts,
        }
    }

    /// Number of spectral samples.
    pub fn len(&self) -> usize {
        self.wavelengths_nm.len()
    }

    /// True when the spectrum holds no samples.
    pub fn is_empty(&self) -> bool {
        self.wavelengths_nm.is_empty()
    }

    /// Wavelength axis in nanometres.
    pub fn wavelengths_nm(&self) -> &[f64] {
        &self.wavelengths_nm
    }

    /// Intensity counts, parallel to the wavelength axis.
    pub fn counts(&self) -> &[f64] {
        &self.counts
    }

    /// Iterate over `(wavelength_nm, counts)` sample pairs in order.
    pub fn samples(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.wavelengths_nm
            .iter()
            .copied()
            .zip(self.counts.iter().copied())
    }
}
