//! Live analysis feed: receives scan points as they are acquired and keeps
//! the reduced angle/metric series current.
//!
//! The feed stores every source point, so changing the spectral window
//! mid-scan recomputes the whole series instead of mixing metrics from two
//! windows.

use std::sync::Mutex;
use tracing::warn;

use crate::analysis::{AnalysisPoint, SpectralWindow};
use crate::scan::ScanPoint;

struct FeedInner {
    window: SpectralWindow,
    sources: Vec<ScanPoint>,
    series: Vec<AnalysisPoint>,
}

/// Shared, internally synchronized analysis feed.
pub struct LiveAnalysisFeed {
    inner: Mutex<FeedInner>,
}

impl LiveAnalysisFeed {
    /// Create an empty feed over the given window.
    pub fn new(window: SpectralWindow) -> Self {
        Self {
            inner: Mutex::new(FeedInner {
                window,
                sources: Vec::new(),
                series: Vec::new(),
            }),
        }
    }

    /// Ingest one freshly acquired point.
    ///
    /// A spectrum with no samples inside the window yields a `None` metric
    /// and a warning; the scan itself is never disturbed.
    pub fn on_point(&self, point: &ScanPoint) {
        let mut inner = lock(&self.inner);
        let reduced = reduce(inner.window, point);
        inner.sources.push(point.clone());
        inner.series.push(reduced);
    }

    /// Replace the spectral window and recompute the series from the
    /// retained source points.
    pub fn configure_window(&self, window: SpectralWindow) {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        inner.window = window;
        inner.series = inner.sources.iter().map(|p| reduce(window, p)).collect();
    }

    /// Current window.
    pub fn window(&self) -> SpectralWindow {
        lock(&self.inner).window
    }

    /// Copy of the current angle/metric series, in plan order.
    pub fn snapshot(&self) -> Vec<AnalysisPoint> {
        lock(&self.inner).series.clone()
    }

    /// Drop all points; called when a new session starts.
    pub fn reset(&self) {
        let mut inner = lock(&self.inner);
        inner.sources.clear();
        inner.series.clear();
    }
}

fn reduce(window: SpectralWindow, point: &ScanPoint) -> AnalysisPoint {
    let metric = match window.peak_metric(&point.spectrum) {
        Ok(metric) => Some(metric),
        Err(e) => {
            warn!(index = point.index, %e, "analysis metric unavailable");
            None
        }
    };
    AnalysisPoint {
        index: point.index,
        angle_deg: point.actual_deg,
        metric,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
