//! End-to-end orchestrator tests against the mock hardware.

use std::sync::Arc;
use std::time::Duration;

use polscan::analysis::{fit_cos_squared, LiveAnalysisFeed, SpectralWindow};
use polscan::error::{AcqError, MotionError, ScanError};
use polscan::hardware::mock::{MockRotationStage, MockSpectrometer};
use polscan::scan::{
    AcquisitionSettings, AnglePlan, OrchestratorConfig, ScanEvent, ScanHandle, ScanOrchestrator,
    ScanState,
};
use polscan::storage::{JsonSessionSink, ResultSink};

fn fast_stage() -> Arc<MockRotationStage> {
    Arc::new(
        MockRotationStage::new()
            .with_speed(100_000.0)
            .with_settle(Duration::from_millis(1)),
    )
}

fn fast_spectrometer() -> Arc<MockSpectrometer> {
    Arc::new(MockSpectrometer::new().with_readout(Duration::from_millis(1)))
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        settle: Duration::from_millis(40),
        ..OrchestratorConfig::default()
    }
}

fn window() -> SpectralWindow {
    SpectralWindow::new(600.0, 660.0).unwrap()
}

fn plan_0_180_by_30() -> AnglePlan {
    AnglePlan::new(0.0, 180.0, 30.0).unwrap()
}

fn fast_settings() -> AcquisitionSettings {
    AcquisitionSettings::new(Duration::from_millis(1), 1).unwrap()
}

fn spawn(
    stage: Arc<MockRotationStage>,
    spectrometer: Arc<MockSpectrometer>,
    sink: Option<Arc<dyn ResultSink>>,
) -> (ScanHandle, Arc<LiveAnalysisFeed>) {
    let feed = Arc::new(LiveAnalysisFeed::new(window()));
    let (handle, _join) = ScanOrchestrator::spawn(
        stage,
        spectrometer,
        Arc::clone(&feed),
        sink,
        fast_config(),
    );
    (handle, feed)
}

/// Drain events until the session reaches a terminal one.
async fn run_to_terminal(events: &mut tokio::sync::broadcast::Receiver<ScanEvent>) -> ScanEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("event stream stalled")
            .expect("event stream closed");
        if matches!(
            event,
            ScanEvent::Completed { .. } | ScanEvent::Aborted { .. } | ScanEvent::Failed { .. }
        ) {
            return event;
        }
    }
}

#[tokio::test]
async fn full_scan_completes_with_ordered_points() {
    let stage = fast_stage();
    let spectrometer = fast_spectrometer();
    let (handle, feed) = spawn(stage, spectrometer, None);

    let mut events = handle.subscribe();
    handle.start(plan_0_180_by_30(), fast_settings()).await.unwrap();

    let mut indices = Vec::new();
    let terminal = loop {
        match events.recv().await.unwrap() {
            ScanEvent::PointAcquired { point, .. } => indices.push(point.index),
            e @ (ScanEvent::Completed { .. }
            | ScanEvent::Aborted { .. }
            | ScanEvent::Failed { .. }) => break e,
            _ => {}
        }
    };

    assert!(matches!(terminal, ScanEvent::Completed { total_points: 7, .. }));
    assert_eq!(indices, vec![0, 1, 2, 3, 4, 5, 6]);

    let status = handle.status().await.unwrap();
    assert_eq!(status.state, ScanState::Completed);
    let session = status.session.unwrap();
    assert_eq!(session.points.len(), 7);
    let targets: Vec<f64> = session.points.iter().map(|p| p.target_deg).collect();
    assert_eq!(targets, vec![0.0, 30.0, 60.0, 90.0, 120.0, 150.0, 180.0]);

    // The feed saw every point, in order.
    let series = feed.snapshot();
    assert_eq!(series.len(), 7);
    assert!(series.iter().all(|p| p.metric.is_some()));
}

#[tokio::test]
async fn device_fault_fails_scan_and_keeps_points() {
    let stage = fast_stage();
    stage.fail_move_at(3, MotionError::DeviceFault("driver".into()));
    let (handle, _feed) = spawn(stage, fast_spectrometer(), None);

    let mut events = handle.subscribe();
    handle.start(plan_0_180_by_30(), fast_settings()).await.unwrap();

    match run_to_terminal(&mut events).await {
        ScanEvent::Failed {
            error,
            points_collected,
            ..
        } => {
            assert_eq!(points_collected, 2);
            assert!(matches!(error, ScanError::Motion(MotionError::DeviceFault(_))));
        }
        other => panic!("expected Failed, got {other:?}"),
    }

    let status = handle.status().await.unwrap();
    assert_eq!(status.state, ScanState::Failed);
    let session = status.session.unwrap();
    assert_eq!(session.points.len(), 2);
    assert!(session.error.is_some());
    assert!(session.finished_at.is_some());
}

#[tokio::test]
async fn abort_at_boundary_retains_collected_points() {
    let stage = fast_stage();
    let (handle, _feed) = spawn(stage, fast_spectrometer(), None);

    let mut events = handle.subscribe();
    handle.start(plan_0_180_by_30(), fast_settings()).await.unwrap();

    let mut seen = 0;
    loop {
        match events.recv().await.unwrap() {
            ScanEvent::PointAcquired { .. } => {
                seen += 1;
                if seen == 2 {
                    handle.abort().await.unwrap();
                }
            }
            ScanEvent::Aborted {
                points_collected, ..
            } => {
                assert_eq!(points_collected, 2);
                break;
            }
            ScanEvent::Completed { .. } | ScanEvent::Failed { .. } => {
                panic!("expected Aborted")
            }
            _ => {}
        }
    }

    let status = handle.status().await.unwrap();
    assert_eq!(status.state, ScanState::Aborted);
    assert_eq!(status.session.unwrap().points.len(), 2);
}

#[tokio::test]
async fn pause_and_resume_lose_no_points() {
    let stage = fast_stage();
    let (handle, _feed) = spawn(stage, fast_spectrometer(), None);

    let mut events = handle.subscribe();
    handle.start(plan_0_180_by_30(), fast_settings()).await.unwrap();

    let mut paused_seen = false;
    let mut resumed_seen = false;
    let mut indices = Vec::new();
    loop {
        match events.recv().await.unwrap() {
            ScanEvent::PointAcquired { point, .. } => {
                indices.push(point.index);
                if point.index == 1 {
                    handle.pause().await.unwrap();
                }
            }
            ScanEvent::Paused { .. } => {
                paused_seen = true;
                // While paused, a second pause is an invalid transition.
                assert!(matches!(
                    handle.pause().await.unwrap_err(),
                    ScanError::InvalidTransition { .. }
                ));
                handle.resume().await.unwrap();
            }
            ScanEvent::Resumed { .. } => resumed_seen = true,
            ScanEvent::Completed { total_points, .. } => {
                assert_eq!(total_points, 7);
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    assert!(paused_seen);
    assert!(resumed_seen);
    // No loss, no duplication.
    assert_eq!(indices, vec![0, 1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn manual_operations_rejected_while_scanning() {
    let stage = fast_stage();
    let (handle, _feed) = spawn(stage, fast_spectrometer(), None);

    let mut events = handle.subscribe();
    // Slow enough that the scan is still running when we poke it.
    let settings = AcquisitionSettings::new(Duration::from_millis(30), 1).unwrap();
    handle.start(plan_0_180_by_30(), settings).await.unwrap();

    assert!(matches!(
        handle.manual_move(45.0).await.unwrap_err(),
        ScanError::Busy
    ));
    assert!(matches!(
        handle.manual_acquire().await.unwrap_err(),
        ScanError::Busy
    ));
    assert!(matches!(
        handle
            .start(plan_0_180_by_30(), fast_settings())
            .await
            .unwrap_err(),
        ScanError::Busy
    ));

    run_to_terminal(&mut events).await;

    // Terminal state accepts manual operations again.
    let pos = handle.manual_move(45.0).await.unwrap();
    assert!((pos - 45.0).abs() < 0.1);
    let spectrum = handle.manual_acquire().await.unwrap();
    assert!(!spectrum.is_empty());
}

#[tokio::test]
async fn control_requests_invalid_before_first_scan() {
    let (handle, _feed) = spawn(fast_stage(), fast_spectrometer(), None);

    assert!(matches!(
        handle.pause().await.unwrap_err(),
        ScanError::InvalidTransition {
            state: ScanState::Idle,
            ..
        }
    ));
    assert!(matches!(
        handle.abort().await.unwrap_err(),
        ScanError::InvalidTransition { .. }
    ));

    let status = handle.status().await.unwrap();
    assert_eq!(status.state, ScanState::Idle);
    assert!(status.session.is_none());

    // Idle accepts manual operations.
    let pos = handle.manual_move(10.0).await.unwrap();
    assert!((pos - 10.0).abs() < 0.1);
    assert!(!handle.manual_acquire().await.unwrap().is_empty());
}

#[tokio::test]
async fn transient_timeouts_within_budget_are_retried() {
    let stage = fast_stage();
    stage.timeout_next_moves(2);
    let (handle, _feed) = spawn(Arc::clone(&stage), fast_spectrometer(), None);

    let mut events = handle.subscribe();
    handle.start(plan_0_180_by_30(), fast_settings()).await.unwrap();

    assert!(matches!(
        run_to_terminal(&mut events).await,
        ScanEvent::Completed { total_points: 7, .. }
    ));
    // 7 successful moves plus the 2 timed-out attempts.
    assert_eq!(stage.move_count(), 9);
}

#[tokio::test]
async fn timeouts_exceeding_budget_escalate() {
    let stage = fast_stage();
    stage.timeout_next_moves(3);
    let (handle, _feed) = spawn(stage, fast_spectrometer(), None);

    let mut events = handle.subscribe();
    handle.start(plan_0_180_by_30(), fast_settings()).await.unwrap();

    match run_to_terminal(&mut events).await {
        ScanEvent::Failed {
            error,
            points_collected,
            ..
        } => {
            assert_eq!(error, ScanError::Motion(MotionError::Timeout));
            assert_eq!(points_collected, 0);
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn busy_acquisitions_within_budget_are_retried() {
    let spectrometer = fast_spectrometer();
    spectrometer.busy_next_acquires(2);
    let (handle, _feed) = spawn(fast_stage(), Arc::clone(&spectrometer), None);

    let mut events = handle.subscribe();
    handle.start(plan_0_180_by_30(), fast_settings()).await.unwrap();

    assert!(matches!(
        run_to_terminal(&mut events).await,
        ScanEvent::Completed { total_points: 7, .. }
    ));
    // 7 successful acquisitions plus the 2 rejected attempts.
    assert_eq!(spectrometer.acquire_count(), 9);
}

#[tokio::test]
async fn busy_acquisitions_exceeding_budget_escalate() {
    let spectrometer = fast_spectrometer();
    spectrometer.busy_next_acquires(3);
    let (handle, _feed) = spawn(fast_stage(), spectrometer, None);

    let mut events = handle.subscribe();
    handle.start(plan_0_180_by_30(), fast_settings()).await.unwrap();

    match run_to_terminal(&mut events).await {
        ScanEvent::Failed {
            error,
            points_collected,
            ..
        } => {
            assert_eq!(error, ScanError::Acquisition(AcqError::DeviceBusy));
            assert_eq!(points_collected, 0);
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn watchdog_fails_a_stalled_step() {
    let stage = fast_stage();
    let (handle, _join) = {
        let feed = Arc::new(LiveAnalysisFeed::new(window()));
        ScanOrchestrator::spawn(
            stage,
            fast_spectrometer(),
            feed,
            None,
            OrchestratorConfig {
                settle: Duration::from_millis(5),
                boundary_ceiling: Duration::from_millis(50),
                ..OrchestratorConfig::default()
            },
        )
    };

    let mut events = handle.subscribe();
    // Exposure far beyond the ceiling.
    let settings = AcquisitionSettings::new(Duration::from_millis(400), 1).unwrap();
    handle.start(plan_0_180_by_30(), settings).await.unwrap();

    match run_to_terminal(&mut events).await {
        ScanEvent::Failed { error, .. } => {
            assert!(matches!(error, ScanError::BoundaryStall { .. }));
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn scan_restarts_cleanly_after_watchdog_failure() {
    let stage = fast_stage();
    let spectrometer = fast_spectrometer();
    let feed = Arc::new(LiveAnalysisFeed::new(window()));
    let (handle, _join) = ScanOrchestrator::spawn(
        stage,
        spectrometer,
        feed,
        None,
        OrchestratorConfig {
            settle: Duration::from_millis(5),
            boundary_ceiling: Duration::from_millis(50),
            ..OrchestratorConfig::default()
        },
    );

    let mut events = handle.subscribe();
    let slow = AcquisitionSettings::new(Duration::from_millis(400), 1).unwrap();
    handle.start(plan_0_180_by_30(), slow).await.unwrap();
    match run_to_terminal(&mut events).await {
        ScanEvent::Failed { error, .. } => {
            assert!(matches!(error, ScanError::BoundaryStall { .. }));
        }
        other => panic!("expected Failed, got {other:?}"),
    }

    // The cancelled acquisition must not leave the device reporting busy;
    // a fresh scan on the same hardware runs to completion.
    handle.start(plan_0_180_by_30(), fast_settings()).await.unwrap();
    assert!(matches!(
        run_to_terminal(&mut events).await,
        ScanEvent::Completed { total_points: 7, .. }
    ));

    let status = handle.status().await.unwrap();
    assert_eq!(status.state, ScanState::Completed);
    assert_eq!(status.session.unwrap().points.len(), 7);
}

#[tokio::test]
async fn offline_readback_falls_back_to_target_angle() {
    let stage = fast_stage();
    stage.set_readback_offline(true);
    let (handle, _feed) = spawn(stage, fast_spectrometer(), None);

    let mut events = handle.subscribe();
    handle.start(plan_0_180_by_30(), fast_settings()).await.unwrap();
    run_to_terminal(&mut events).await;

    let session = handle.status().await.unwrap().session.unwrap();
    assert_eq!(session.state, ScanState::Completed);
    for point in &session.points {
        assert_eq!(point.actual_deg, point.target_deg);
    }
}

#[tokio::test]
async fn invalid_plan_rejected_before_touching_hardware() {
    let stage = fast_stage();
    let (handle, _feed) = spawn(Arc::clone(&stage), fast_spectrometer(), None);

    let bad_plan = AnglePlan {
        start_deg: 0.0,
        end_deg: 90.0,
        step_deg: 0.0,
    };
    assert!(matches!(
        handle.start(bad_plan, fast_settings()).await.unwrap_err(),
        ScanError::Config(_)
    ));
    assert_eq!(stage.move_count(), 0);
}

#[tokio::test]
async fn completed_session_is_persisted_and_fit_recovers_axis() {
    let stage = fast_stage();
    let spectrometer = Arc::new(
        MockSpectrometer::new()
            .with_readout(Duration::from_millis(1))
            .with_polarized_source(stage.shared_position(), 30.0),
    );
    let dir = tempfile::tempdir().unwrap();
    let sink: Arc<dyn ResultSink> = Arc::new(JsonSessionSink::new(dir.path()));

    let (handle, feed) = spawn(stage, spectrometer, Some(sink));
    let mut events = handle.subscribe();
    let session_id = handle
        .start(AnglePlan::new(0.0, 180.0, 10.0).unwrap(), fast_settings())
        .await
        .unwrap();
    run_to_terminal(&mut events).await;

    // Session record landed on disk.
    let path = dir.path().join(format!("scan_{session_id}.json"));
    let body = std::fs::read_to_string(&path).unwrap();
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["state"], "Completed");
    assert_eq!(value["points"].as_array().unwrap().len(), 19);

    // The live series carries the cos² modulation of the simulated crystal.
    let fit = fit_cos_squared(&feed.snapshot()).unwrap();
    assert!((fit.amplitude - 1000.0).abs() < 1.0, "A = {}", fit.amplitude);
    assert!((fit.phase_deg - 30.0).abs() < 0.1, "phi = {}", fit.phase_deg);
    assert!((fit.offset - 50.0).abs() < 1.0, "C = {}", fit.offset);
}
