//! Scan session state: lifecycle state machine, measured points and the
//! session aggregate.
//!
//! A [`ScanSession`] is created on Start, mutated only by the orchestrator
//! worker, observed by everyone else through snapshots and events, and
//! serialized as the on-disk replay record when it reaches a terminal state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ScanError;
use crate::hardware::Spectrum;
use crate::scan::plan::{AcquisitionSettings, AnglePlan};

/// Scan lifecycle state.
///
/// ```text
/// Idle ──Start──> Running ──plan exhausted──> Completed
///                   │  ▲                 ──Abort──> Aborted
///               Pause│  │Resume          ──fault──> Failed
///                   ▼  │
///                 Paused ──Abort──> Aborted
/// ```
///
/// `Completed`, `Aborted` and `Failed` are terminal; a new Start creates a
/// fresh session and returns to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanState {
    /// No scan has run yet.
    Idle,
    /// The worker is stepping through the angle plan.
    Running,
    /// Paused at a boundary; resumable.
    Paused,
    /// Every planned angle was measured.
    Completed,
    /// Stopped on request; collected points retained.
    Aborted,
    /// Stopped on a hardware fault; collected points retained.
    Failed,
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScanState::Idle => "Idle",
            ScanState::Running => "Running",
            ScanState::Paused => "Paused",
            ScanState::Completed => "Completed",
            ScanState::Aborted => "Aborted",
            ScanState::Failed => "Failed",
        };
        write!(f, "{name}")
    }
}

impl ScanState {
    /// Whether a new scan may start from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, ScanState::Idle) || self.is_terminal()
    }

    /// Whether Pause is a valid request.
    pub fn can_pause(&self) -> bool {
        matches!(self, ScanState::Running)
    }

    /// Whether Resume is a valid request.
    pub fn can_resume(&self) -> bool {
        matches!(self, ScanState::Paused)
    }

    /// Whether Abort is a valid request.
    pub fn can_abort(&self) -> bool {
        matches!(self, ScanState::Running | ScanState::Paused)
    }

    /// Whether this state ends a session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanState::Completed | ScanState::Aborted | ScanState::Failed
        )
    }
}

/// One measured sample, never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanPoint {
    /// Zero-based plan index.
    pub index: usize,
    /// Commanded waveplate angle in degrees.
    pub target_deg: f64,
    /// Stage-reported angle, falling back to the target when readback is
    /// unavailable.
    pub actual_deg: f64,
    /// The acquired spectrum.
    pub spectrum: Spectrum,
    /// Acquisition completion timestamp.
    pub acquired_at: DateTime<Utc>,
}

impl ScanPoint {
    /// Create a point timestamped now.
    pub fn new(index: usize, target_deg: f64, actual_deg: f64, spectrum: Spectrum) -> Self {
        Self {
            index,
            target_deg,
            actual_deg,
            spectrum,
            acquired_at: Utc::now(),
        }
    }
}

/// Aggregate root for one scan run.
#[derive(Debug, Clone, Serialize)]
pub struct ScanSession {
    /// Unique session identifier.
    pub id: Uuid,
    /// The angle plan this session executes.
    pub plan: AnglePlan,
    /// Acquisition settings, immutable for the session's lifetime.
    pub settings: AcquisitionSettings,
    /// Measured points in strictly increasing plan-index order.
    pub points: Vec<ScanPoint>,
    /// Current lifecycle state.
    pub state: ScanState,
    /// The error that moved the session to `Failed`, if any.
    pub error: Option<ScanError>,
    /// Session creation timestamp.
    pub started_at: DateTime<Utc>,
    /// Set when the session reaches a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl ScanSession {
    /// Create a fresh session in the `Running` state.
    pub fn new(plan: AnglePlan, settings: AcquisitionSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan,
            settings,
            points: Vec::with_capacity(plan.len()),
            state: ScanState::Running,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Total number of planned points.
    pub fn total_points(&self) -> usize {
        self.plan.len()
    }

    /// Fraction of planned points measured so far, in `[0, 1]`.
    pub fn completion(&self) -> f64 {
        self.points.len() as f64 / self.total_points() as f64
    }

    /// Append a point; indices must arrive in plan order.
    pub(crate) fn append(&mut self, point: ScanPoint) {
        debug_assert_eq!(point.index, self.points.len());
        self.points.push(point);
    }

    /// Move to a terminal state, stamping the finish time.
    pub(crate) fn finish(&mut self, state: ScanState) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.finished_at = Some(Utc::now());
    }

    /// Record a fault and move to `Failed`. Collected points are retained.
    pub(crate) fn fail(&mut self, error: ScanError) {
        self.error = Some(error);
        self.finish(ScanState::Failed);
    }
}
