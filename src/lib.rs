//! Polarization-resolved scan orchestration.
//!
//! `polscan` drives a motorized half-waveplate and a spectrometer through a
//! stepped angle scan, publishing progress events and a live angle/metric
//! series while the scan runs, and fitting the cos² polarization response
//! once it finishes.
//!
//! Architecture in brief:
//!
//! - [`hardware`] defines the [`hardware::RotationStage`] and
//!   [`hardware::Spectrometer`] capability traits plus mock devices for
//!   development and tests.
//! - [`scan`] holds the angle plan, the session record and the
//!   orchestrator worker that owns the devices and executes the loop.
//! - [`analysis`] reduces each spectrum to a windowed peak metric and fits
//!   `I(θ) = A·cos²(θ − φ) + C` in closed form.
//! - [`storage`] persists finished sessions as JSON replay records and CSV
//!   analysis tables.
//! - [`config`] layers TOML files and `POLSCAN_`-prefixed environment
//!   variables over built-in defaults.

pub mod analysis;
pub mod config;
pub mod error;
pub mod hardware;
pub mod scan;
pub mod storage;
pub mod tracing_setup;
