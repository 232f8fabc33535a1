//! Hardware capability traits.
//!
//! Devices are consumed through narrow capability interfaces rather than
//! monolithic instrument types: the scan orchestrator only knows about a
//! [`RotationStage`] and a [`Spectrometer`]. Real device bindings and the
//! deterministic mocks in [`super::mock`] are interchangeable behind these
//! traits, selected at startup by the `hardware.backend` configuration flag.
//!
//! # Contract
//!
//! - All methods are async and take `&self`; implementations use interior
//!   mutability for device state.
//! - Implementations are `Send + Sync` so a single `Arc<dyn _>` handle can
//!   be owned by the scan worker.
//! - Errors are the concrete adapter types from [`crate::error`], which is
//!   what lets the orchestrator distinguish transient timeouts from hard
//!   faults.

use async_trait::async_trait;

use crate::error::{AcqError, MotionError};
use crate::hardware::Spectrum;
use crate::scan::AcquisitionSettings;

/// Capability: motorized rotation stage (waveplate mount).
///
/// Moves block until the stage reports settled at the target within
/// tolerance, or fail. The one real-world, non-reversible side effect in
/// the system lives here, so callers must never issue overlapping move
/// commands to the same device instance.
#[async_trait]
pub trait RotationStage: Send + Sync {
    /// Home the stage. Blocks until homing completes or fails.
    async fn home(&self) -> Result<(), MotionError>;

    /// Move to an absolute angle in degrees and settle.
    async fn move_to(&self, angle_deg: f64) -> Result<(), MotionError>;

    /// Move by a relative offset in degrees and settle.
    async fn move_relative(&self, delta_deg: f64) -> Result<(), MotionError>;

    /// Best-effort, non-blocking position readback in degrees.
    ///
    /// Fails with [`MotionError::NotConnected`] when the reading is
    /// unavailable; callers fall back to the commanded target.
    async fn position(&self) -> Result<f64, MotionError>;

    /// Whether the stage currently reports motion in progress.
    async fn is_moving(&self) -> Result<bool, MotionError> {
        Ok(false)
    }
}

/// Capability: spectral acquisition instrument (spectrometer/camera).
///
/// `acquire_single` blocks for roughly exposure × accumulations plus
/// instrument overhead and must not be invoked concurrently with another
/// acquisition on the same instrument.
#[async_trait]
pub trait Spectrometer: Send + Sync {
    /// Apply exposure and accumulation settings for subsequent acquisitions.
    async fn configure(&self, settings: &AcquisitionSettings) -> Result<(), AcqError>;

    /// Acquire one spectrum with the configured settings.
    async fn acquire_single(&self) -> Result<Spectrum, AcqError>;

    /// Whether an acquisition is currently in flight.
    async fn is_busy(&self) -> Result<bool, AcqError> {
        Ok(false)
    }
}
