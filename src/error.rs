//! Custom error types for the application.
//!
//! This module defines the full error taxonomy for the scan system using the
//! `thiserror` crate. Errors are split by origin:
//!
//! - **`ConfigError`**: semantic problems with a scan plan, acquisition
//!   settings, spectral window or configuration file. These are always raised
//!   before any hardware is touched.
//! - **`MotionError`** / **`AcqError`**: raised by the rotation-stage and
//!   spectrometer adapters. Timeout-class variants are retried locally by the
//!   orchestrator; fault-class variants escalate immediately.
//! - **`AnalysisError`**: non-fatal per-point analysis failures. A scan never
//!   aborts because of one.
//! - **`FitError`**: raised by the fitting collaborator, never by the core.
//! - **`ScanError`**: the umbrella error surfaced by the orchestrator and its
//!   handle. Every session that ends in `Failed` records one.
//!
//! All variants are `Clone` and `Serialize` so they can travel inside
//! broadcast events and be written into the session record on disk.

use serde::Serialize;
use thiserror::Error;

/// Semantic validation errors, rejected before any hardware is touched.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
pub enum ConfigError {
    #[error("angle step must be non-zero")]
    ZeroStep,

    #[error("step {step_deg}° points away from end {end_deg}° (start {start_deg}°)")]
    StepDirection {
        start_deg: f64,
        end_deg: f64,
        step_deg: f64,
    },

    #[error("angles must be finite")]
    NonFiniteAngle,

    #[error("exposure time must be positive")]
    NonPositiveExposure,

    #[error("accumulation count must be at least 1")]
    ZeroAccumulations,

    #[error("spectral window [{low_nm}, {high_nm}] nm is not a valid range")]
    InvalidWindow { low_nm: f64, high_nm: f64 },

    #[error("unknown hardware backend '{0}' (available: mock)")]
    UnknownBackend(String),
}

/// Failures reported by a rotation-stage adapter.
///
/// `Timeout` is transient-retryable; the rest escalate immediately.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
pub enum MotionError {
    #[error("motion command timed out")]
    Timeout,

    #[error("target {target_deg}° is outside the stage travel range")]
    OutOfRange { target_deg: f64 },

    #[error("stage fault: {0}")]
    DeviceFault(String),

    #[error("stage not connected")]
    NotConnected,
}

/// Failures reported by a spectrometer adapter.
///
/// `Timeout` and `DeviceBusy` are transient-retryable; `DeviceFault`
/// escalates immediately.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
pub enum AcqError {
    #[error("acquisition timed out")]
    Timeout,

    #[error("instrument busy with another acquisition")]
    DeviceBusy,

    #[error("instrument fault: {0}")]
    DeviceFault(String),
}

/// Per-point analysis failures. Never fatal to a scan.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
pub enum AnalysisError {
    #[error("no spectral samples inside window [{low_nm}, {high_nm}] nm")]
    EmptyWindow { low_nm: f64, high_nm: f64 },
}

/// Failures from the cos² fitting collaborator.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
pub enum FitError {
    #[error("fit did not converge (degenerate angle set)")]
    NonConvergence,

    #[error("insufficient points for fit: need {needed}, got {got}")]
    InsufficientPoints { needed: usize, got: usize },
}

/// Umbrella error surfaced by the scan orchestrator.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
pub enum ScanError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("motion error: {0}")]
    Motion(#[from] MotionError),

    #[error("acquisition error: {0}")]
    Acquisition(#[from] AcqError),

    #[error("scan step stalled beyond the {ceiling_secs}s watchdog ceiling")]
    BoundaryStall { ceiling_secs: u64 },

    #[error("a scan session is active; command rejected")]
    Busy,

    #[error("'{command}' is not valid in the {state} state")]
    InvalidTransition {
        command: &'static str,
        state: crate::scan::ScanState,
    },

    #[error("scan worker is no longer running")]
    WorkerGone,
}
