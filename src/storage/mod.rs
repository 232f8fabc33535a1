//! Result sinks: durable records of finished scan sessions.
//!
//! Two formats are provided. The JSON sink writes the full session as a
//! replay record (plan, settings, every spectrum, final state). The CSV
//! sink writes the reduced angle/metric table for quick plotting.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

use crate::analysis::SpectralWindow;
use crate::scan::ScanSession;

/// Destination for a session that reached a terminal state.
///
/// `persist` is called exactly once per session, for completed, aborted
/// and failed sessions alike.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Write the session record, returning the path written.
    async fn persist(&self, session: &ScanSession) -> anyhow::Result<PathBuf>;
}

/// Writes `scan_<id>.json` containing the full serialized session.
pub struct JsonSessionSink {
    dir: PathBuf,
}

impl JsonSessionSink {
    /// Sink writing into `dir`, created on first use.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ResultSink for JsonSessionSink {
    async fn persist(&self, session: &ScanSession) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("scan_{}.json", session.id));
        let json = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(&path, json).await?;
        info!(path = %path.display(), points = session.points.len(), "session record written");
        Ok(path)
    }
}

/// Writes `scan_<id>.csv` with one row per point: index, target angle,
/// actual angle and the windowed peak metric.
pub struct CsvAnalysisSink {
    dir: PathBuf,
    window: SpectralWindow,
}

impl CsvAnalysisSink {
    /// Sink writing into `dir` using `window` for the metric column.
    pub fn new(dir: impl Into<PathBuf>, window: SpectralWindow) -> Self {
        Self {
            dir: dir.into(),
            window,
        }
    }

    fn render(&self, session: &ScanSession) -> anyhow::Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(["index", "target_deg", "actual_deg", "peak_counts"])?;
        for point in &session.points {
            let metric = self
                .window
                .peak_metric(&point.spectrum)
                .map(|m| m.to_string())
                .unwrap_or_default();
            writer.write_record([
                point.index.to_string(),
                point.target_deg.to_string(),
                point.actual_deg.to_string(),
                metric,
            ])?;
        }
        Ok(writer.into_inner()?)
    }
}

#[async_trait]
impl ResultSink for CsvAnalysisSink {
    async fn persist(&self, session: &ScanSession) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("scan_{}.csv", session.id));
        tokio::fs::write(&path, self.render(session)?).await?;
        info!(path = %path.display(), points = session.points.len(), "analysis table written");
        Ok(path)
    }
}

/// Fans one session out to several sinks, failing on the first error.
pub struct MultiSink {
    sinks: Vec<Box<dyn ResultSink>>,
}

impl MultiSink {
    /// Combine sinks; `persist` returns the path of the first one.
    pub fn new(sinks: Vec<Box<dyn ResultSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl ResultSink for MultiSink {
    async fn persist(&self, session: &ScanSession) -> anyhow::Result<PathBuf> {
        let mut first: Option<PathBuf> = None;
        for sink in &self.sinks {
            let path = sink.persist(session).await?;
            first.get_or_insert(path);
        }
        first.ok_or_else(|| anyhow::anyhow!("no sinks configured"))
    }
}
