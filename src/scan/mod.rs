//! Scan domain: angle plans, sessions and the orchestration core.

pub mod orchestrator;
pub mod plan;
pub mod session;

pub use orchestrator::{
    OrchestratorConfig, ScanCommand, ScanEvent, ScanHandle, ScanOrchestrator, ScanStatus,
};
pub use plan::{AcquisitionSettings, AnglePlan};
pub use session::{ScanPoint, ScanSession, ScanState};
