//! Deterministic mock hardware.
//!
//! Simulated rotation stage and spectrometer for running and testing scans
//! without physical devices. Both mocks use async-safe delays
//! (`tokio::time::sleep`) and expose injectable faults so the orchestrator's
//! retry and escalation paths can be exercised deterministically:
//!
//! - [`MockRotationStage::fail_move_at`] / [`MockSpectrometer::fail_acquire_at`]
//!   arm a one-shot error for the Nth call.
//! - [`MockRotationStage::timeout_next_moves`] / [`MockSpectrometer::busy_next_acquires`]
//!   make the next N calls fail with a transient-retryable error.
//!
//! The spectrometer can be linked to the stage position so the synthesized
//! peak amplitude follows cos²(waveplate − crystal axis), which is what the
//! downstream fit expects to see.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::{debug, trace};

use crate::error::{AcqError, MotionError};
use crate::hardware::capabilities::{RotationStage, Spectrometer};
use crate::hardware::Spectrum;
use crate::scan::AcquisitionSettings;

const WAVELENGTH_START_NM: f64 = 500.0;
const WAVELENGTH_STEP_NM: f64 = 1.0;
const WAVELENGTH_SAMPLES: usize = 201;
const PEAK_CENTER_NM: f64 = 632.0;
const PEAK_SIGMA_NM: f64 = 12.0;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears an activity flag on drop, so a cancelled future (a caller-side
/// timeout dropping an in-flight move or acquisition) never leaves the
/// device stuck reporting busy.
struct ClearOnDrop<'a>(&'a AtomicBool);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// MockRotationStage
// =============================================================================

/// Simulated waveplate rotation mount.
///
/// Motion time scales with angular distance at a configurable speed, with a
/// short settle delay after each move. Position readback carries a small
/// configurable jitter, mimicking encoder noise.
pub struct MockRotationStage {
    position: Arc<RwLock<f64>>,
    moving: AtomicBool,
    speed_deg_per_sec: f64,
    settle: Duration,
    jitter_deg: f64,
    travel_range_deg: Option<(f64, f64)>,
    move_count: AtomicUsize,
    move_faults: Mutex<HashMap<usize, MotionError>>,
    pending_timeouts: AtomicU32,
    readback_offline: AtomicBool,
}

impl MockRotationStage {
    /// Create a stage at 0° with default timing (50°/s, 10 ms settle).
    pub fn new() -> Self {
        Self {
            position: Arc::new(RwLock::new(0.0)),
            moving: AtomicBool::new(false),
            speed_deg_per_sec: 50.0,
            settle: Duration::from_millis(10),
            jitter_deg: 0.0,
            travel_range_deg: None,
            move_count: AtomicUsize::new(0),
            move_faults: Mutex::new(HashMap::new()),
            pending_timeouts: AtomicU32::new(0),
            readback_offline: AtomicBool::new(false),
        }
    }

    /// Set the simulated motion speed in degrees per second.
    pub fn with_speed(mut self, speed_deg_per_sec: f64) -> Self {
        self.speed_deg_per_sec = speed_deg_per_sec;
        self
    }

    /// Set the post-move settle delay.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Set the peak-to-peak position readback jitter in degrees.
    pub fn with_jitter(mut self, jitter_deg: f64) -> Self {
        self.jitter_deg = jitter_deg;
        self
    }

    /// Restrict travel to `[min, max]` degrees; moves outside fail with
    /// [`MotionError::OutOfRange`].
    pub fn with_travel_range(mut self, min_deg: f64, max_deg: f64) -> Self {
        self.travel_range_deg = Some((min_deg, max_deg));
        self
    }

    /// Handle to the simulated position, for linking a [`MockSpectrometer`].
    pub fn shared_position(&self) -> Arc<RwLock<f64>> {
        Arc::clone(&self.position)
    }

    /// Number of `move_to`/`move_relative` calls accepted so far.
    pub fn move_count(&self) -> usize {
        self.move_count.load(Ordering::SeqCst)
    }

    /// Arm a one-shot fault for the Nth move call (1-based).
    pub fn fail_move_at(&self, call_index: usize, error: MotionError) {
        lock(&self.move_faults).insert(call_index, error);
    }

    /// Make the next `n` move calls fail with [`MotionError::Timeout`].
    pub fn timeout_next_moves(&self, n: u32) {
        self.pending_timeouts.store(n, Ordering::SeqCst);
    }

    /// Take position readback offline; `position()` fails with
    /// [`MotionError::NotConnected`] until restored.
    pub fn set_readback_offline(&self, offline: bool) {
        self.readback_offline.store(offline, Ordering::SeqCst);
    }

    fn check_injected_fault(&self, call: usize) -> Result<(), MotionError> {
        if let Some(err) = lock(&self.move_faults).remove(&call) {
            debug!(call, %err, "mock stage: injected fault");
            return Err(err);
        }
        if self.pending_timeouts.load(Ordering::SeqCst) > 0 {
            self.pending_timeouts.fetch_sub(1, Ordering::SeqCst);
            debug!(call, "mock stage: injected timeout");
            return Err(MotionError::Timeout);
        }
        Ok(())
    }

    async fn travel_to(&self, target_deg: f64) -> Result<(), MotionError> {
        if let Some((min, max)) = self.travel_range_deg {
            if target_deg < min || target_deg > max {
                return Err(MotionError::OutOfRange { target_deg });
            }
        }

        let current = *self.position.read().await;
        let distance = (target_deg - current).abs();
        let travel = Duration::from_secs_f64(distance / self.speed_deg_per_sec);
        trace!(current, target_deg, ?travel, "mock stage: moving");

        self.moving.store(true, Ordering::SeqCst);
        let _moving = ClearOnDrop(&self.moving);
        sleep(travel).await;
        *self.position.write().await = target_deg;
        sleep(self.settle).await;

        trace!(target_deg, "mock stage: settled");
        Ok(())
    }
}

impl Default for MockRotationStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RotationStage for MockRotationStage {
    async fn home(&self) -> Result<(), MotionError> {
        debug!("mock stage: homing");
        self.travel_to(0.0).await
    }

    async fn move_to(&self, angle_deg: f64) -> Result<(), MotionError> {
        let call = self.move_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.check_injected_fault(call)?;
        self.travel_to(angle_deg).await
    }

    async fn move_relative(&self, delta_deg: f64) -> Result<(), MotionError> {
        let call = self.move_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.check_injected_fault(call)?;
        let target = *self.position.read().await + delta_deg;
        self.travel_to(target).await
    }

    async fn position(&self) -> Result<f64, MotionError> {
        if self.readback_offline.load(Ordering::SeqCst) {
            return Err(MotionError::NotConnected);
        }
        let base = *self.position.read().await;
        let jitter = if self.jitter_deg > 0.0 {
            rand::thread_rng().gen_range(-self.jitter_deg..=self.jitter_deg)
        } else {
            0.0
        };
        Ok(base + jitter)
    }

    async fn is_moving(&self) -> Result<bool, MotionError> {
        Ok(self.moving.load(Ordering::SeqCst))
    }
}

// =============================================================================
// MockSpectrometer
// =============================================================================

enum SpectrumSource {
    /// Fixed peak amplitude regardless of waveplate angle.
    Flat { amplitude: f64 },
    /// Peak amplitude follows cos²(waveplate − crystal axis).
    CosSquared {
        waveplate_deg: Arc<RwLock<f64>>,
        crystal_axis_deg: f64,
        amplitude: f64,
        floor: f64,
    },
}

/// Simulated spectrometer.
///
/// Each acquisition blocks for exposure × accumulations plus a fixed
/// readout overhead, then synthesizes a Gaussian emission peak on a
/// 500–700 nm wavelength grid.
pub struct MockSpectrometer {
    settings: RwLock<AcquisitionSettings>,
    readout: Duration,
    source: SpectrumSource,
    busy: AtomicBool,
    acquire_count: AtomicUsize,
    acquire_faults: Mutex<HashMap<usize, AcqError>>,
    pending_busy: AtomicU32,
}

impl MockSpectrometer {
    /// Create a spectrometer with a fixed peak amplitude of 1000 counts.
    pub fn new() -> Self {
        Self {
            settings: RwLock::new(AcquisitionSettings::default()),
            readout: Duration::from_millis(20),
            source: SpectrumSource::Flat { amplitude: 1000.0 },
            busy: AtomicBool::new(false),
            acquire_count: AtomicUsize::new(0),
            acquire_faults: Mutex::new(HashMap::new()),
            pending_busy: AtomicU32::new(0),
        }
    }

    /// Set the fixed readout overhead per acquisition.
    pub fn with_readout(mut self, readout: Duration) -> Self {
        self.readout = readout;
        self
    }

    /// Link the peak amplitude to a stage position:
    /// `amplitude · cos²(waveplate − axis) + floor` counts.
    pub fn with_polarized_source(
        mut self,
        waveplate_deg: Arc<RwLock<f64>>,
        crystal_axis_deg: f64,
    ) -> Self {
        self.source = SpectrumSource::CosSquared {
            waveplate_deg,
            crystal_axis_deg,
            amplitude: 1000.0,
            floor: 50.0,
        };
        self
    }

    /// Number of `acquire_single` calls accepted so far.
    pub fn acquire_count(&self) -> usize {
        self.acquire_count.load(Ordering::SeqCst)
    }

    /// Arm a one-shot fault for the Nth acquisition (1-based).
    pub fn fail_acquire_at(&self, call_index: usize, error: AcqError) {
        lock(&self.acquire_faults).insert(call_index, error);
    }

    /// Make the next `n` acquisitions fail with [`AcqError::DeviceBusy`].
    pub fn busy_next_acquires(&self, n: u32) {
        self.pending_busy.store(n, Ordering::SeqCst);
    }

    async fn peak_amplitude(&self) -> f64 {
        match &self.source {
            SpectrumSource::Flat { amplitude } => *amplitude,
            SpectrumSource::CosSquared {
                waveplate_deg,
                crystal_axis_deg,
                amplitude,
                floor,
            } => {
                let angle = *waveplate_deg.read().await;
                let delta = (angle - crystal_axis_deg).to_radians();
                amplitude * delta.cos().powi(2) + floor
            }
        }
    }

    fn synthesize(peak_counts: f64) -> Spectrum {
        let mut wavelengths = Vec::with_capacity(WAVELENGTH_SAMPLES);
        let mut counts = Vec::with_capacity(WAVELENGTH_SAMPLES);
        for i in 0..WAVELENGTH_SAMPLES {
            let nm = WAVELENGTH_START_NM + i as f64 * WAVELENGTH_STEP_NM;
            let arg = (nm - PEAK_CENTER_NM) / PEAK_SIGMA_NM;
            wavelengths.push(nm);
            counts.push(peak_counts * (-0.5 * arg * arg).exp());
        }
        Spectrum::new(wavelengths, counts)
    }
}

impl Default for MockSpectrometer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Spectrometer for MockSpectrometer {
    async fn configure(&self, settings: &AcquisitionSettings) -> Result<(), AcqError> {
        debug!(?settings, "mock spectrometer: configured");
        *self.settings.write().await = settings.clone();
        Ok(())
    }

    async fn acquire_single(&self) -> Result<Spectrum, AcqError> {
        let call = self.acquire_count.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(err) = lock(&self.acquire_faults).remove(&call) {
            debug!(call, %err, "mock spectrometer: injected fault");
            return Err(err);
        }
        if self.pending_busy.load(Ordering::SeqCst) > 0 {
            self.pending_busy.fetch_sub(1, Ordering::SeqCst);
            debug!(call, "mock spectrometer: injected busy");
            return Err(AcqError::DeviceBusy);
        }
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(AcqError::DeviceBusy);
        }
        let _busy = ClearOnDrop(&self.busy);

        let (integration, accumulations) = {
            let settings = self.settings.read().await;
            (settings.total_integration(), settings.accumulations)
        };
        sleep(integration + self.readout).await;

        let peak = self.peak_amplitude().await * f64::from(accumulations);
        trace!(call, peak, "mock spectrometer: acquisition complete");
        Ok(Self::synthesize(peak))
    }

    async fn is_busy(&self) -> Result<bool, AcqError> {
        Ok(self.busy.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_stage() -> MockRotationStage {
        MockRotationStage::new()
            .with_speed(10_000.0)
            .with_settle(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn stage_moves_and_reads_back() {
        let stage = fast_stage();
        stage.move_to(45.0).await.unwrap();
        assert_eq!(stage.position().await.unwrap(), 45.0);

        stage.move_relative(-15.0).await.unwrap();
        assert_eq!(stage.position().await.unwrap(), 30.0);

        stage.home().await.unwrap();
        assert_eq!(stage.position().await.unwrap(), 0.0);
        assert!(!stage.is_moving().await.unwrap());
    }

    #[tokio::test]
    async fn stage_one_shot_fault_fires_once() {
        let stage = fast_stage();
        stage.fail_move_at(2, MotionError::DeviceFault("encoder".into()));

        stage.move_to(10.0).await.unwrap();
        let err = stage.move_to(20.0).await.unwrap_err();
        assert!(matches!(err, MotionError::DeviceFault(_)));
        // Fault is consumed; the next call succeeds.
        stage.move_to(20.0).await.unwrap();
        assert_eq!(stage.position().await.unwrap(), 20.0);
    }

    #[tokio::test]
    async fn stage_timeout_injection_counts_down() {
        let stage = fast_stage();
        stage.timeout_next_moves(2);

        assert_eq!(stage.move_to(5.0).await.unwrap_err(), MotionError::Timeout);
        assert_eq!(stage.move_to(5.0).await.unwrap_err(), MotionError::Timeout);
        stage.move_to(5.0).await.unwrap();
    }

    #[tokio::test]
    async fn stage_travel_range_enforced() {
        let stage = fast_stage().with_travel_range(0.0, 360.0);
        let err = stage.move_to(400.0).await.unwrap_err();
        assert!(matches!(err, MotionError::OutOfRange { .. }));
    }

    #[tokio::test]
    async fn stage_readback_offline() {
        let stage = fast_stage();
        stage.set_readback_offline(true);
        assert_eq!(
            stage.position().await.unwrap_err(),
            MotionError::NotConnected
        );
        stage.set_readback_offline(false);
        stage.position().await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_move_leaves_stage_idle() {
        let stage = MockRotationStage::new().with_speed(1.0);
        // Dropping the in-flight move must clear the moving flag.
        let result =
            tokio::time::timeout(Duration::from_millis(5), stage.move_to(90.0)).await;
        assert!(result.is_err());
        assert!(!stage.is_moving().await.unwrap());

        let fast = fast_stage();
        fast.move_to(10.0).await.unwrap();
        assert!(!fast.is_moving().await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_acquisition_leaves_spectrometer_idle() {
        let spec = MockSpectrometer::new().with_readout(Duration::from_millis(100));
        let result =
            tokio::time::timeout(Duration::from_millis(5), spec.acquire_single()).await;
        assert!(result.is_err());
        assert!(!spec.is_busy().await.unwrap());

        // The same device accepts the next acquisition.
        spec.acquire_single().await.unwrap();
    }

    #[tokio::test]
    async fn spectrometer_acquires_peaked_spectrum() {
        let spec = MockSpectrometer::new().with_readout(Duration::from_millis(1));
        spec.configure(&AcquisitionSettings::default()).await.unwrap();

        let spectrum = spec.acquire_single().await.unwrap();
        assert_eq!(spectrum.len(), WAVELENGTH_SAMPLES);

        // Peak sits at the configured center wavelength.
        let (peak_nm, _) = spectrum
            .samples()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap();
        assert_eq!(peak_nm, PEAK_CENTER_NM);
    }

    #[tokio::test]
    async fn spectrometer_busy_injection() {
        let spec = MockSpectrometer::new().with_readout(Duration::from_millis(1));
        spec.busy_next_acquires(1);
        assert_eq!(
            spec.acquire_single().await.unwrap_err(),
            AcqError::DeviceBusy
        );
        spec.acquire_single().await.unwrap();
        assert_eq!(spec.acquire_count(), 2);
    }

    #[tokio::test]
    async fn polarized_source_follows_stage_angle() {
        let stage = fast_stage();
        let spec = MockSpectrometer::new()
            .with_readout(Duration::from_millis(1))
            .with_polarized_source(stage.shared_position(), 0.0);

        stage.move_to(0.0).await.unwrap();
        let aligned = spec.acquire_single().await.unwrap();

        stage.move_to(90.0).await.unwrap();
        let crossed = spec.acquire_single().await.unwrap();

        let max = |s: &Spectrum| {
            s.counts()
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max)
        };
        assert!(max(&aligned) > max(&crossed) * 5.0);
    }
}
