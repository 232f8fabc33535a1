//! Scan orchestration core.
//!
//! One dedicated worker task owns both hardware adapters and the active
//! [`ScanSession`] for the session's lifetime; every blocking hardware call
//! happens on that worker and nowhere else. Callers hold a cloneable
//! [`ScanHandle`] and communicate over channels:
//!
//! ```text
//! Caller (CLI/GUI/test)              Worker task
//! ---------------------              -----------
//! 1. Create command with oneshot
//! 2. Send via mpsc channel    ------>
//!                                    3. Receive at a loop boundary
//!                                    4. Process (mutate session)
//!                                    5. Send response
//! 6. Await oneshot receiver   <------
//!
//!          events: broadcast channel, strictly in plan-index order
//! ```
//!
//! Control requests (`Pause`, `Resume`, `Abort`) are honored only at scan
//! boundaries — between a completed (move, acquire) pair and the next —
//! so the device is never left mid-motion or mid-exposure. Each boundary
//! includes a short settle window during which the worker services the
//! command channel.
//!
//! Timeout-class adapter errors are retried a bounded number of times
//! before escalating; fault-class errors escalate immediately. Every
//! escalation preserves the points collected so far, and each scan step is
//! additionally wrapped in a watchdog ceiling so an unresponsive device
//! cannot hang the session forever.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analysis::LiveAnalysisFeed;
use crate::error::{AcqError, MotionError, ScanError};
use crate::hardware::{RotationStage, Spectrometer, Spectrum};
use crate::scan::plan::{AcquisitionSettings, AnglePlan};
use crate::scan::session::{ScanPoint, ScanSession, ScanState};
use crate::storage::ResultSink;

/// Orchestrator tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum attempts per hardware call for transient-retryable errors.
    pub retry_attempts: u32,
    /// Settle window at each scan boundary; control requests arriving
    /// within it are serviced before the next move is issued.
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
    /// Watchdog ceiling for a single (move, acquire) step; exceeding it
    /// fails the session.
    #[serde(with = "humantime_serde")]
    pub boundary_ceiling: Duration,
    /// Command channel capacity.
    pub command_capacity: usize,
    /// Event channel capacity.
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            settle: Duration::from_millis(25),
            boundary_ceiling: Duration::from_secs(120),
            command_capacity: 32,
            event_capacity: 64,
        }
    }
}

/// Progress and lifecycle events emitted by the orchestrator.
///
/// Events are delivered in strictly increasing plan-index order: no event
/// for angle `i + 1` is ever observed before the event for angle `i`.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// A new session entered `Running`.
    Started {
        session_id: Uuid,
        plan: AnglePlan,
        settings: AcquisitionSettings,
    },
    /// One (move, acquire) pair finished and its point joined the session.
    PointAcquired {
        session_id: Uuid,
        point: ScanPoint,
        completion: f64,
    },
    /// The session paused at a boundary.
    Paused { session_id: Uuid },
    /// The session resumed from pause.
    Resumed { session_id: Uuid },
    /// Every planned angle was measured.
    Completed {
        session_id: Uuid,
        total_points: usize,
    },
    /// The session stopped on request; collected points retained.
    Aborted {
        session_id: Uuid,
        points_collected: usize,
    },
    /// The session stopped on a fault; collected points retained.
    Failed {
        session_id: Uuid,
        error: ScanError,
        points_collected: usize,
    },
}

/// Snapshot of the orchestrator's observable state.
#[derive(Debug, Clone)]
pub struct ScanStatus {
    /// Current lifecycle state (`Idle` before the first scan).
    pub state: ScanState,
    /// The active or most recent session, if any.
    pub session: Option<ScanSession>,
}

/// Commands accepted by the orchestrator worker.
///
/// Each variant carries a `oneshot::Sender` for its response. The helper
/// constructors return the command together with the matching receiver.
#[derive(Debug)]
pub enum ScanCommand {
    /// Begin a new scan. Valid from `Idle` or a terminal state.
    Start {
        plan: AnglePlan,
        settings: AcquisitionSettings,
        response: oneshot::Sender<Result<Uuid, ScanError>>,
    },
    /// Pause at the next boundary. Valid from `Running`.
    Pause {
        response: oneshot::Sender<Result<(), ScanError>>,
    },
    /// Continue from the next unvisited angle. Valid from `Paused`.
    Resume {
        response: oneshot::Sender<Result<(), ScanError>>,
    },
    /// Stop at the next boundary, keeping collected points. Valid from
    /// `Running` or `Paused`.
    Abort {
        response: oneshot::Sender<Result<(), ScanError>>,
    },
    /// One-off stage move; rejected with `Busy` while a scan is active.
    ManualMove {
        angle_deg: f64,
        response: oneshot::Sender<Result<f64, ScanError>>,
    },
    /// One-off acquisition; rejected with `Busy` while a scan is active.
    ManualAcquire {
        response: oneshot::Sender<Result<Spectrum, ScanError>>,
    },
    /// Read the current status and session snapshot.
    Snapshot {
        response: oneshot::Sender<ScanStatus>,
    },
    /// Stop the worker task (aborting any active scan first).
    Shutdown { response: oneshot::Sender<()> },
}

impl ScanCommand {
    /// Build a `Start` command and its response receiver.
    pub fn start(
        plan: AnglePlan,
        settings: AcquisitionSettings,
    ) -> (Self, oneshot::Receiver<Result<Uuid, ScanError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Start {
                plan,
                settings,
                response: tx,
            },
            rx,
        )
    }

    /// Build a `Pause` command and its response receiver.
    pub fn pause() -> (Self, oneshot::Receiver<Result<(), ScanError>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Pause { response: tx }, rx)
    }

    /// Build a `Resume` command and its response receiver.
    pub fn resume() -> (Self, oneshot::Receiver<Result<(), ScanError>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Resume { response: tx }, rx)
    }

    /// Build an `Abort` command and its response receiver.
    pub fn abort() -> (Self, oneshot::Receiver<Result<(), ScanError>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Abort { response: tx }, rx)
    }

    /// Build a `ManualMove` command and its response receiver.
    pub fn manual_move(angle_deg: f64) -> (Self, oneshot::Receiver<Result<f64, ScanError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::ManualMove {
                angle_deg,
                response: tx,
            },
            rx,
        )
    }

    /// Build a `ManualAcquire` command and its response receiver.
    pub fn manual_acquire() -> (Self, oneshot::Receiver<Result<Spectrum, ScanError>>) {
        let (tx, rx) = oneshot::channel();
        (Self::ManualAcquire { response: tx }, rx)
    }

    /// Build a `Snapshot` command and its response receiver.
    pub fn snapshot() -> (Self, oneshot::Receiver<ScanStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::Snapshot { response: tx }, rx)
    }

    /// Build a `Shutdown` command and its response receiver.
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

/// Caller-side handle to a running orchestrator worker.
///
/// Cheap to clone; no method blocks on hardware.
#[derive(Clone)]
pub struct ScanHandle {
    command_tx: mpsc::Sender<ScanCommand>,
    event_tx: broadcast::Sender<ScanEvent>,
}

impl ScanHandle {
    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.event_tx.subscribe()
    }

    /// Request a new scan; returns the session id once the worker accepts.
    pub async fn start(
        &self,
        plan: AnglePlan,
        settings: AcquisitionSettings,
    ) -> Result<Uuid, ScanError> {
        let (cmd, rx) = ScanCommand::start(plan, settings);
        self.dispatch(cmd, rx).await?
    }

    /// Request a pause at the next boundary.
    pub async fn pause(&self) -> Result<(), ScanError> {
        let (cmd, rx) = ScanCommand::pause();
        self.dispatch(cmd, rx).await?
    }

    /// Request a resume from pause.
    pub async fn resume(&self) -> Result<(), ScanError> {
        let (cmd, rx) = ScanCommand::resume();
        self.dispatch(cmd, rx).await?
    }

    /// Request an abort at the next boundary.
    pub async fn abort(&self) -> Result<(), ScanError> {
        let (cmd, rx) = ScanCommand::abort();
        self.dispatch(cmd, rx).await?
    }

    /// One-off move; `Busy` while a scan is active.
    pub async fn manual_move(&self, angle_deg: f64) -> Result<f64, ScanError> {
        let (cmd, rx) = ScanCommand::manual_move(angle_deg);
        self.dispatch(cmd, rx).await?
    }

    /// One-off acquisition; `Busy` while a scan is active.
    pub async fn manual_acquire(&self) -> Result<Spectrum, ScanError> {
        let (cmd, rx) = ScanCommand::manual_acquire();
        self.dispatch(cmd, rx).await?
    }

    /// Fetch the current status and session snapshot.
    pub async fn status(&self) -> Result<ScanStatus, ScanError> {
        let (cmd, rx) = ScanCommand::snapshot();
        self.dispatch(cmd, rx).await
    }

    /// Stop the worker, aborting any active scan.
    pub async fn shutdown(&self) -> Result<(), ScanError> {
        let (cmd, rx) = ScanCommand::shutdown();
        self.dispatch(cmd, rx).await
    }

    async fn dispatch<T>(
        &self,
        cmd: ScanCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, ScanError> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| ScanError::WorkerGone)?;
        rx.await.map_err(|_| ScanError::WorkerGone)
    }
}

/// Outcome of a boundary check.
enum Boundary {
    /// Proceed with the next (move, acquire) pair.
    Continue,
    /// An abort (or shutdown) was honored at this boundary.
    Abort,
}

/// The scan worker: owns the adapters, the live feed and the session.
pub struct ScanOrchestrator {
    stage: Arc<dyn RotationStage>,
    spectrometer: Arc<dyn Spectrometer>,
    feed: Arc<LiveAnalysisFeed>,
    sink: Option<Arc<dyn ResultSink>>,
    config: OrchestratorConfig,
    command_rx: mpsc::Receiver<ScanCommand>,
    event_tx: broadcast::Sender<ScanEvent>,
    last_session: Option<ScanSession>,
    shutting_down: bool,
}

impl ScanOrchestrator {
    /// Spawn the worker task and return the caller handle.
    ///
    /// The worker takes exclusive ownership of both adapters for its
    /// lifetime; manual operations are routed through the same channel and
    /// therefore the same mutual-exclusion gate as scans.
    pub fn spawn(
        stage: Arc<dyn RotationStage>,
        spectrometer: Arc<dyn Spectrometer>,
        feed: Arc<LiveAnalysisFeed>,
        sink: Option<Arc<dyn ResultSink>>,
        config: OrchestratorConfig,
    ) -> (ScanHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity);
        let (event_tx, _) = broadcast::channel(config.event_capacity);

        let handle = ScanHandle {
            command_tx,
            event_tx: event_tx.clone(),
        };

        let worker = Self {
            stage,
            spectrometer,
            feed,
            sink,
            config,
            command_rx,
            event_tx,
            last_session: None,
            shutting_down: false,
        };

        let join = tokio::spawn(worker.run());
        (handle, join)
    }

    /// Worker main loop: idle command dispatch.
    async fn run(mut self) {
        while let Some(cmd) = self.command_rx.recv().await {
            match cmd {
                ScanCommand::Start {
                    plan,
                    settings,
                    response,
                } => {
                    if let Err(e) = plan.validate().and_then(|()| settings.validate()) {
                        warn!(%e, "scan rejected by validation");
                        let _ = response.send(Err(e.into()));
                        continue;
                    }
                    let session = ScanSession::new(plan, settings);
                    let _ = response.send(Ok(session.id));
                    self.run_scan(session).await;
                }
                ScanCommand::Pause { response } | ScanCommand::Resume { response } => {
                    let _ = response.send(Err(self.idle_transition_error("pause/resume")));
                }
                ScanCommand::Abort { response } => {
                    let _ = response.send(Err(self.idle_transition_error("abort")));
                }
                ScanCommand::ManualMove {
                    angle_deg,
                    response,
                } => {
                    let _ = response.send(self.manual_move(angle_deg).await);
                }
                ScanCommand::ManualAcquire { response } => {
                    let result = self
                        .spectrometer
                        .acquire_single()
                        .await
                        .map_err(ScanError::from);
                    let _ = response.send(result);
                }
                ScanCommand::Snapshot { response } => {
                    let _ = response.send(self.status());
                }
                ScanCommand::Shutdown { response } => {
                    let _ = response.send(());
                    break;
                }
            }
            if self.shutting_down {
                break;
            }
        }
        info!("scan worker stopped");
    }

    fn status(&self) -> ScanStatus {
        ScanStatus {
            state: self
                .last_session
                .as_ref()
                .map_or(ScanState::Idle, |s| s.state),
            session: self.last_session.clone(),
        }
    }

    fn idle_transition_error(&self, command: &'static str) -> ScanError {
        ScanError::InvalidTransition {
            command,
            state: self
                .last_session
                .as_ref()
                .map_or(ScanState::Idle, |s| s.state),
        }
    }

    async fn manual_move(&self, angle_deg: f64) -> Result<f64, ScanError> {
        if self.stage.is_moving().await.unwrap_or(false) {
            return Err(ScanError::Busy);
        }
        self.stage.move_to(angle_deg).await?;
        Ok(self.stage.position().await.unwrap_or(angle_deg))
    }

    // =========================================================================
    // Scan loop
    // =========================================================================

    async fn run_scan(&mut self, mut session: ScanSession) {
        let session_id = session.id;
        let total = session.total_points();
        info!(%session_id, total, "scan started");

        self.feed.reset();
        let _ = self.event_tx.send(ScanEvent::Started {
            session_id,
            plan: session.plan,
            settings: session.settings.clone(),
        });

        if let Err(e) = self.spectrometer.configure(&session.settings).await {
            self.finish_failed(&mut session, e.into()).await;
            return;
        }

        let angles: Vec<f64> = session.plan.angles().collect();
        let mut pause_requested = false;

        for (index, &target_deg) in angles.iter().enumerate() {
            match self.boundary(&session, &mut pause_requested).await {
                Boundary::Continue => {}
                Boundary::Abort => {
                    self.finish_aborted(&mut session).await;
                    return;
                }
            }

            let outcome = timeout(
                self.config.boundary_ceiling,
                self.execute_step(index, target_deg),
            )
            .await;

            let point = match outcome {
                Err(_) => {
                    let stall = ScanError::BoundaryStall {
                        ceiling_secs: self.config.boundary_ceiling.as_secs(),
                    };
                    self.finish_failed(&mut session, stall).await;
                    return;
                }
                Ok(Err(e)) => {
                    self.finish_failed(&mut session, e).await;
                    return;
                }
                Ok(Ok(point)) => point,
            };

            session.append(point.clone());
            let completion = session.completion();
            debug!(
                %session_id,
                index,
                target_deg,
                actual_deg = point.actual_deg,
                completion,
                "point acquired"
            );
            let _ = self.event_tx.send(ScanEvent::PointAcquired {
                session_id,
                point: point.clone(),
                completion,
            });
            self.feed.on_point(&point);
        }

        self.finish_completed(&mut session).await;
    }

    /// One (move, acquire) pair with per-call bounded retries.
    async fn execute_step(&self, index: usize, target_deg: f64) -> Result<ScanPoint, ScanError> {
        self.move_with_retry(target_deg).await?;

        // Best-effort readback; an offline encoder never blocks the loop.
        let actual_deg = match self.stage.position().await {
            Ok(pos) => pos,
            Err(e) => {
                warn!(%e, target_deg, "position readback unavailable, recording target");
                target_deg
            }
        };

        let spectrum = self.acquire_with_retry().await?;
        Ok(ScanPoint::new(index, target_deg, actual_deg, spectrum))
    }

    async fn move_with_retry(&self, target_deg: f64) -> Result<(), ScanError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.stage.move_to(target_deg).await {
                Ok(()) => return Ok(()),
                Err(MotionError::Timeout) if attempt < self.config.retry_attempts => {
                    warn!(target_deg, attempt, "move timed out, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn acquire_with_retry(&self) -> Result<Spectrum, ScanError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.spectrometer.acquire_single().await {
                Ok(spectrum) => return Ok(spectrum),
                Err(e @ (AcqError::Timeout | AcqError::DeviceBusy))
                    if attempt < self.config.retry_attempts =>
                {
                    warn!(%e, attempt, "acquisition failed transiently, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // =========================================================================
    // Boundary handling
    // =========================================================================

    /// Service control requests at a scan boundary.
    ///
    /// Commands arriving within the settle window are handled before the
    /// next move is issued; a pause request then parks the worker until
    /// Resume or Abort.
    async fn boundary(&mut self, session: &ScanSession, pause_requested: &mut bool) -> Boundary {
        let deadline = Instant::now() + self.config.settle;
        loop {
            match timeout_at(deadline, self.command_rx.recv()).await {
                Err(_) => break, // settle window elapsed
                Ok(None) => {
                    // All handles dropped; stop cleanly, keeping the points.
                    self.shutting_down = true;
                    return Boundary::Abort;
                }
                Ok(Some(cmd)) => {
                    if let Boundary::Abort = self.handle_running_command(cmd, session, pause_requested)
                    {
                        return Boundary::Abort;
                    }
                }
            }
        }

        if *pause_requested {
            *pause_requested = false;
            return self.paused(session).await;
        }
        Boundary::Continue
    }

    /// Handle one command while the scan is `Running` (at a boundary).
    fn handle_running_command(
        &mut self,
        cmd: ScanCommand,
        session: &ScanSession,
        pause_requested: &mut bool,
    ) -> Boundary {
        match cmd {
            ScanCommand::Pause { response } => {
                *pause_requested = true;
                let _ = response.send(Ok(()));
            }
            ScanCommand::Resume { response } => {
                let _ = response.send(Err(ScanError::InvalidTransition {
                    command: "resume",
                    state: ScanState::Running,
                }));
            }
            ScanCommand::Abort { response } => {
                let _ = response.send(Ok(()));
                return Boundary::Abort;
            }
            ScanCommand::Start { response, .. } => {
                let _ = response.send(Err(ScanError::Busy));
            }
            ScanCommand::ManualMove { response, .. } => {
                let _ = response.send(Err(ScanError::Busy));
            }
            ScanCommand::ManualAcquire { response } => {
                let _ = response.send(Err(ScanError::Busy));
            }
            ScanCommand::Snapshot { response } => {
                let _ = response.send(ScanStatus {
                    state: session.state,
                    session: Some(session.clone()),
                });
            }
            ScanCommand::Shutdown { response } => {
                let _ = response.send(());
                self.shutting_down = true;
                return Boundary::Abort;
            }
        }
        Boundary::Continue
    }

    /// Park at a boundary until Resume or Abort.
    async fn paused(&mut self, session: &ScanSession) -> Boundary {
        let session_id = session.id;
        let mut paused_view = session.clone();
        paused_view.state = ScanState::Paused;

        info!(%session_id, points = session.points.len(), "scan paused");
        let _ = self.event_tx.send(ScanEvent::Paused { session_id });

        loop {
            let Some(cmd) = self.command_rx.recv().await else {
                self.shutting_down = true;
                return Boundary::Abort;
            };
            match cmd {
                ScanCommand::Resume { response } => {
                    let _ = response.send(Ok(()));
                    info!(%session_id, "scan resumed");
                    let _ = self.event_tx.send(ScanEvent::Resumed { session_id });
                    return Boundary::Continue;
                }
                ScanCommand::Abort { response } => {
                    let _ = response.send(Ok(()));
                    return Boundary::Abort;
                }
                ScanCommand::Pause { response } => {
                    let _ = response.send(Err(ScanError::InvalidTransition {
                        command: "pause",
                        state: ScanState::Paused,
                    }));
                }
                ScanCommand::Start { response, .. } => {
                    let _ = response.send(Err(ScanError::Busy));
                }
                ScanCommand::ManualMove { response, .. } => {
                    let _ = response.send(Err(ScanError::Busy));
                }
                ScanCommand::ManualAcquire { response } => {
                    let _ = response.send(Err(ScanError::Busy));
                }
                ScanCommand::Snapshot { response } => {
                    let _ = response.send(ScanStatus {
                        state: ScanState::Paused,
                        session: Some(paused_view.clone()),
                    });
                }
                ScanCommand::Shutdown { response } => {
                    let _ = response.send(());
                    self.shutting_down = true;
                    return Boundary::Abort;
                }
            }
        }
    }

    // =========================================================================
    // Terminal transitions
    // =========================================================================

    async fn finish_completed(&mut self, session: &mut ScanSession) {
        session.finish(ScanState::Completed);
        info!(session_id = %session.id, points = session.points.len(), "scan completed");
        let _ = self.event_tx.send(ScanEvent::Completed {
            session_id: session.id,
            total_points: session.points.len(),
        });
        self.persist(session).await;
    }

    async fn finish_aborted(&mut self, session: &mut ScanSession) {
        session.finish(ScanState::Aborted);
        info!(session_id = %session.id, points = session.points.len(), "scan aborted");
        let _ = self.event_tx.send(ScanEvent::Aborted {
            session_id: session.id,
            points_collected: session.points.len(),
        });
        self.persist(session).await;
    }

    async fn finish_failed(&mut self, session: &mut ScanSession, err: ScanError) {
        error!(session_id = %session.id, %err, points = session.points.len(), "scan failed");
        session.fail(err.clone());
        let _ = self.event_tx.send(ScanEvent::Failed {
            session_id: session.id,
            error: err,
            points_collected: session.points.len(),
        });
        self.persist(session).await;
    }

    async fn persist(&mut self, session: &ScanSession) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.persist(session).await {
                warn!(session_id = %session.id, %e, "result sink failed");
            }
        }
        self.last_session = Some(session.clone());
    }
}
