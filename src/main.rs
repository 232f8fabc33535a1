//! `polscan` command line entry point.
//!
//! Wires the configured hardware backend, the scan orchestrator, the live
//! analysis feed and the result sinks together, runs one scan and prints
//! the fitted polarization response.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use polscan::analysis::{fit_cos_squared, LiveAnalysisFeed};
use polscan::config::{AppConfig, DEFAULT_CONFIG_PATH};
use polscan::hardware::mock::{MockRotationStage, MockSpectrometer};
use polscan::hardware::{RotationStage, Spectrometer};
use polscan::scan::{AcquisitionSettings, AnglePlan, ScanEvent, ScanOrchestrator};
use polscan::storage::{CsvAnalysisSink, JsonSessionSink, MultiSink, ResultSink};

#[derive(Parser)]
#[command(name = "polscan", about = "Polarization-resolved spectral scans", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a scan (the default when no subcommand is given).
    Run(RunArgs),
    /// Acquire a single spectrum at the current waveplate angle.
    Acquire,
}

#[derive(Args, Default)]
struct RunArgs {
    /// First waveplate angle in degrees.
    #[arg(long)]
    start: Option<f64>,
    /// Final waveplate angle in degrees.
    #[arg(long)]
    end: Option<f64>,
    /// Angle increment in degrees.
    #[arg(long)]
    step: Option<f64>,
    /// Exposure per accumulation, e.g. "100ms".
    #[arg(long, value_parser = humantime::parse_duration)]
    exposure: Option<Duration>,
    /// Accumulations summed per acquisition.
    #[arg(long)]
    accumulations: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;

    polscan::tracing_setup::init(&config.application.log_level)?;
    config.hardware.validate()?;
    info!(name = %config.application.name, backend = %config.hardware.backend, "starting");

    let (stage, spectrometer) = build_hardware(&config);
    stage.home().await.context("homing rotation stage")?;

    match cli.command.unwrap_or(Command::Run(RunArgs::default())) {
        Command::Run(args) => run_scan(&config, stage, spectrometer, args).await,
        Command::Acquire => acquire_once(spectrometer).await,
    }
}

fn build_hardware(config: &AppConfig) -> (Arc<dyn RotationStage>, Arc<dyn Spectrometer>) {
    let mock = &config.hardware.mock;
    let stage = MockRotationStage::new()
        .with_speed(mock.speed_deg_per_sec)
        .with_jitter(mock.jitter_deg);
    let spectrometer = MockSpectrometer::new()
        .with_readout(mock.readout)
        .with_polarized_source(stage.shared_position(), mock.crystal_axis_deg);
    (Arc::new(stage), Arc::new(spectrometer))
}

async fn acquire_once(spectrometer: Arc<dyn Spectrometer>) -> anyhow::Result<()> {
    let spectrum = spectrometer
        .acquire_single()
        .await
        .context("single acquisition")?;
    let (peak_nm, peak_counts) = spectrum
        .samples()
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .context("empty spectrum")?;
    info!(samples = spectrum.len(), peak_nm, peak_counts, "acquisition complete");
    Ok(())
}

async fn run_scan(
    config: &AppConfig,
    stage: Arc<dyn RotationStage>,
    spectrometer: Arc<dyn Spectrometer>,
    args: RunArgs,
) -> anyhow::Result<()> {
    let defaults = &config.scan.defaults;
    let plan = AnglePlan::new(
        args.start.unwrap_or(defaults.start_deg),
        args.end.unwrap_or(defaults.end_deg),
        args.step.unwrap_or(defaults.step_deg),
    )?;
    let settings = AcquisitionSettings::new(
        args.exposure.unwrap_or(defaults.exposure),
        args.accumulations.unwrap_or(defaults.accumulations),
    )?;

    let window = config.analysis.window()?;
    let feed = Arc::new(LiveAnalysisFeed::new(window));
    let sink: Arc<dyn ResultSink> = Arc::new(MultiSink::new(vec![
        Box::new(JsonSessionSink::new(&config.storage.output_dir)),
        Box::new(CsvAnalysisSink::new(&config.storage.output_dir, window)),
    ]));

    let (handle, join) = ScanOrchestrator::spawn(
        stage,
        spectrometer,
        Arc::clone(&feed),
        Some(sink),
        config.scan.orchestrator.clone(),
    );

    let mut events = handle.subscribe();
    let session_id = handle.start(plan, settings).await?;
    info!(%session_id, points = plan.len(), "scan accepted");

    let started = tokio::time::Instant::now();
    loop {
        match events.recv().await {
            Ok(ScanEvent::PointAcquired {
                point, completion, ..
            }) => {
                let eta_secs = if completion > 0.0 && completion < 1.0 {
                    let elapsed = started.elapsed();
                    Some(elapsed.mul_f64((1.0 - completion) / completion).as_secs_f64())
                } else {
                    None
                };
                info!(
                    index = point.index,
                    angle_deg = point.actual_deg,
                    percent = completion * 100.0,
                    eta_secs,
                    "point acquired"
                );
            }
            Ok(ScanEvent::Completed { total_points, .. }) => {
                info!(total_points, "scan completed");
                break;
            }
            Ok(ScanEvent::Aborted {
                points_collected, ..
            }) => {
                warn!(points_collected, "scan aborted");
                break;
            }
            Ok(ScanEvent::Failed {
                error,
                points_collected,
                ..
            }) => {
                warn!(%error, points_collected, "scan failed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(%e, "event stream closed");
                break;
            }
        }
    }

    match fit_cos_squared(&feed.snapshot()) {
        Ok(fit) => info!(
            amplitude = fit.amplitude,
            phase_deg = fit.phase_deg,
            offset = fit.offset,
            residual_rms = fit.residual_rms,
            "polarization fit"
        ),
        Err(e) => warn!(%e, "polarization fit unavailable"),
    }

    handle.shutdown().await?;
    join.await.context("scan worker join")?;
    Ok(())
}
