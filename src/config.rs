//! Layered configuration loading via Figment.
//!
//! Configuration is resolved in three layers, later layers overriding
//! earlier ones:
//!
//! 1. Built-in defaults (`AppConfig::default()`)
//! 2. A TOML file (`config/polscan.toml` by default)
//! 3. Environment variables prefixed with `POLSCAN_` (nested fields
//!    separated by `__`, e.g. `POLSCAN_APPLICATION__LOG_LEVEL=debug`)
//!
//! Adapter construction parameters (mock timing, fault knobs) live here
//! rather than in process-wide state, so tests and the CLI can build
//! differently configured hardware side by side.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scan::{AcquisitionSettings, AnglePlan, OrchestratorConfig};
use crate::analysis::SpectralWindow;
use crate::error::ConfigError;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "POLSCAN_";

/// Default configuration file path, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/polscan.toml";

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application-level settings (name, log level).
    pub application: ApplicationConfig,
    /// Hardware backend selection and mock parameters.
    pub hardware: HardwareConfig,
    /// Scan defaults and orchestrator tuning.
    pub scan: ScanConfig,
    /// Live analysis window.
    pub analysis: AnalysisConfig,
    /// Result sink settings.
    pub storage: StorageConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            hardware: HardwareConfig::default(),
            scan: ScanConfig::default(),
            analysis: AnalysisConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Application-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name, used in log output.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "polscan".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Hardware backend selection.
///
/// The `backend` flag picks which concrete adapters are bound behind the
/// capability traits at startup. Only the deterministic `mock` backend is
/// bound in this build; unknown values are rejected before any hardware
/// is touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Adapter backend: `mock` for simulated devices.
    pub backend: String,
    /// Timing and simulation parameters for the mock devices.
    pub mock: MockHardwareConfig,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            backend: "mock".to_string(),
            mock: MockHardwareConfig::default(),
        }
    }
}

impl HardwareConfig {
    /// Reject unknown backend names with a `ConfigError`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.backend.as_str() {
            "mock" => Ok(()),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

/// Simulation parameters for the mock rotation stage and spectrometer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockHardwareConfig {
    /// Simulated stage speed in degrees per second.
    pub speed_deg_per_sec: f64,
    /// Peak-to-peak position readback jitter in degrees.
    pub jitter_deg: f64,
    /// Fixed instrument readout overhead per acquisition.
    #[serde(with = "humantime_serde")]
    pub readout: Duration,
    /// Simulated crystal axis angle; the mock spectrum amplitude follows
    /// cos²(waveplate − axis).
    pub crystal_axis_deg: f64,
}

impl Default for MockHardwareConfig {
    fn default() -> Self {
        Self {
            speed_deg_per_sec: 50.0,
            jitter_deg: 0.005,
            readout: Duration::from_millis(20),
            crystal_axis_deg: 30.0,
        }
    }
}

/// Scan configuration: default plan/settings plus orchestrator tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Default angle plan and acquisition settings for CLI scans.
    pub defaults: ScanDefaults,
    /// Orchestrator retry/settle/watchdog tuning.
    pub orchestrator: OrchestratorConfig,
}

/// Default scan parameters used when the CLI does not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanDefaults {
    /// First waveplate angle in degrees.
    pub start_deg: f64,
    /// Final waveplate angle in degrees.
    pub end_deg: f64,
    /// Angle increment in degrees.
    pub step_deg: f64,
    /// Exposure time per accumulation.
    #[serde(with = "humantime_serde")]
    pub exposure: Duration,
    /// Number of accumulations summed per acquisition.
    pub accumulations: u32,
}

impl Default for ScanDefaults {
    fn default() -> Self {
        Self {
            start_deg: 0.0,
            end_deg: 180.0,
            step_deg: 10.0,
            exposure: Duration::from_millis(100),
            accumulations: 1,
        }
    }
}

impl ScanDefaults {
    /// Build a validated angle plan from the defaults.
    pub fn plan(&self) -> Result<AnglePlan, ConfigError> {
        AnglePlan::new(self.start_deg, self.end_deg, self.step_deg)
    }

    /// Build validated acquisition settings from the defaults.
    pub fn settings(&self) -> Result<AcquisitionSettings, ConfigError> {
        AcquisitionSettings::new(self.exposure, self.accumulations)
    }
}

/// Live analysis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Lower edge of the spectral window in nanometres.
    pub window_low_nm: f64,
    /// Upper edge of the spectral window in nanometres.
    pub window_high_nm: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            window_low_nm: 600.0,
            window_high_nm: 660.0,
        }
    }
}

impl AnalysisConfig {
    /// Build a validated spectral window.
    pub fn window(&self) -> Result<SpectralWindow, ConfigError> {
        SpectralWindow::new(self.window_low_nm, self.window_high_nm)
    }
}

/// Result sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory where session records and analysis tables are written.
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default file path and environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific TOML file, with environment
    /// overrides applied on top. A missing file falls back to defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }
}
