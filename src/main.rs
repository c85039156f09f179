//! CLI Entry Point for spectro-daq
//!
//! Provides a headless command-line interface for:
//! - Listing attached spectrometers
//! - Running a live acquisition with a logging presentation sink
//! - Saving a single snapshot
//!
//! Instruments come from the simulated backend configured in the
//! `[simulation]` section.
//!
//! # Usage
//!
//! ```bash
//! spectro-daq list --json
//! spectro-daq run --device SIM0001 --duration 10s --average 5 --continuous-save --save-dir data
//! spectro-daq snapshot --save-dir data --prefix lamp_
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use spectro_daq::config::{AppConfig, DEFAULT_CONFIG_PATH};
use spectro_daq::controller::SpectrometerController;
use spectro_daq::hardware::mock::SimulatedBackend;
use spectro_daq::logging::{self, OutputFormat, TracingConfig};
use spectro_daq::sink::{
    display_channel, present, AcquisitionStatus, DisplayReceiver, PresentationSink,
};
use spectro_daq::state::ConfigState;
use spectro_daq::SpectroError;

#[derive(Parser)]
#[command(name = "spectro-daq")]
#[command(about = "Live spectrometer acquisition, processing and recording", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Compact)]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List attached spectrometers
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Acquire continuously until the duration elapses or Ctrl-C
    Run {
        /// Instrument identifier (defaults to the first enumerated device)
        #[arg(long)]
        device: Option<String>,

        /// Stop after this long (e.g. "30s", "2m")
        #[arg(long, value_parser = parse_duration)]
        duration: Option<Duration>,

        /// Integration time in microseconds
        #[arg(long)]
        integration_us: Option<u32>,

        /// Enable the moving average with this window
        #[arg(long)]
        average: Option<usize>,

        /// Capture a background after this long and subtract it from then on
        #[arg(long, value_parser = parse_duration)]
        subtract_background_after: Option<Duration>,

        /// Directory for spectrum files
        #[arg(long)]
        save_dir: Option<PathBuf>,

        /// File name prefix for spectrum files
        #[arg(long)]
        prefix: Option<String>,

        /// Write every processed spectrum to disk
        #[arg(long)]
        continuous_save: bool,
    },

    /// Acquire one spectrum and save it
    Snapshot {
        /// Instrument identifier (defaults to the first enumerated device)
        #[arg(long)]
        device: Option<String>,

        /// Directory for the spectrum file
        #[arg(long)]
        save_dir: Option<PathBuf>,

        /// File name prefix
        #[arg(long)]
        prefix: Option<String>,
    },
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}

/// Presentation sink that reports spectra through tracing.
#[derive(Debug, Default)]
struct LogSink {
    samples: u64,
    bounds: Option<(f64, f64)>,
}

const LOG_EVERY: u64 = 20;

impl PresentationSink for LogSink {
    fn on_sample(&mut self, wavelengths: &[f64], intensities: &[f64]) {
        self.samples += 1;
        if self.samples % LOG_EVERY != 1 {
            return;
        }
        let (lower, upper) = self.bounds.unwrap_or((f64::NEG_INFINITY, f64::INFINITY));
        let peak = wavelengths
            .iter()
            .zip(intensities)
            .filter(|(wl, _)| (lower..=upper).contains(*wl))
            .max_by(|a, b| a.1.total_cmp(b.1));
        if let Some((wavelength, intensity)) = peak {
            info!(
                sample = self.samples,
                bins = intensities.len(),
                peak_nm = *wavelength,
                peak_counts = *intensity,
                "Spectrum"
            );
        }
    }

    fn on_display_bounds_changed(&mut self, lower: f64, upper: f64) {
        self.bounds = Some((lower, upper));
        info!(lower, upper, "Display range");
    }

    fn on_status(&mut self, status: &AcquisitionStatus) {
        match status {
            AcquisitionStatus::SaveFailed { .. }
            | AcquisitionStatus::ProcessingFailed { .. }
            | AcquisitionStatus::DeviceLost { .. } => warn!(%status, "Acquisition status"),
            _ => info!(%status, "Acquisition status"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)
        .map_err(SpectroError::from)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    logging::init(TracingConfig::from_app_config(&config)?.with_format(cli.log_format))?;
    info!(name = %config.application.name, "Starting");

    match cli.command {
        Commands::List { json } => list_devices(&config, json),
        Commands::Run {
            device,
            duration,
            integration_us,
            average,
            subtract_background_after,
            save_dir,
            prefix,
            continuous_save,
        } => {
            let options = RunOptions {
                device,
                duration,
                integration_us,
                average,
                subtract_background_after,
                save_dir,
                prefix,
                continuous_save,
            };
            run(&config, options).await
        }
        Commands::Snapshot {
            device,
            save_dir,
            prefix,
        } => snapshot(&config, device, save_dir, prefix).await,
    }
}

fn build_controller(config: &AppConfig) -> Result<(SpectrometerController, DisplayReceiver)> {
    let backend = Arc::new(SimulatedBackend::new(config.simulation.device_specs()));
    let state = ConfigState::new(config.processing.clone())?;
    let (tx, rx) = display_channel(config.acquisition.display_channel_capacity);
    let controller = SpectrometerController::new(
        backend,
        state,
        tx,
        config.acquisition.session_settings(),
        config.acquisition.loop_settings(),
    );
    Ok((controller, rx))
}

fn select_device(controller: &mut SpectrometerController, device: Option<String>) -> Result<String> {
    let devices = controller.refresh_devices()?;
    let identifier = match device {
        Some(id) => id,
        None => match devices.first() {
            Some(first) => first.identifier.clone(),
            None => bail!("no spectrometer attached"),
        },
    };
    tokio::task::block_in_place(|| controller.select_instrument(&identifier))?;
    Ok(identifier)
}

fn apply_storage_options(
    controller: &SpectrometerController,
    save_dir: Option<PathBuf>,
    prefix: Option<String>,
) -> Result<()> {
    if let Some(dir) = save_dir {
        controller.set_save_dir(dir)?;
    }
    if let Some(prefix) = prefix {
        controller.set_file_prefix(prefix)?;
    }
    Ok(())
}

fn list_devices(config: &AppConfig, json: bool) -> Result<()> {
    let (controller, _rx) = build_controller(config)?;
    let devices = controller.refresh_devices()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else if devices.is_empty() {
        println!("No spectrometers attached");
    } else {
        for device in devices {
            println!("{}\t{}", device.identifier, device.model);
        }
    }
    Ok(())
}

struct RunOptions {
    device: Option<String>,
    duration: Option<Duration>,
    integration_us: Option<u32>,
    average: Option<usize>,
    subtract_background_after: Option<Duration>,
    save_dir: Option<PathBuf>,
    prefix: Option<String>,
    continuous_save: bool,
}

async fn run(config: &AppConfig, options: RunOptions) -> Result<()> {
    let (mut controller, rx) = build_controller(config)?;
    let presenter = tokio::spawn(present(rx, LogSink::default()));

    apply_storage_options(&controller, options.save_dir, options.prefix)?;
    if let Some(window) = options.average {
        controller.set_averaging(true, window)?;
    }
    if options.continuous_save {
        controller.set_continuous_save(true)?;
    }

    let identifier = select_device(&mut controller, options.device)?;
    if let Some(micros) = options.integration_us {
        controller.set_integration_time(micros)?;
    }
    info!(identifier = %identifier, "Acquiring; press Ctrl-C to stop");

    let started = Instant::now();
    let mut background_pending = options.subtract_background_after;
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            _ = ticker.tick() => {
                if !controller.is_acquiring() {
                    warn!(identifier = %identifier, "Acquisition ended on its own");
                    break;
                }
                if let Some(after) = background_pending {
                    if started.elapsed() >= after {
                        match controller.save_background() {
                            Ok(_) => {
                                controller.set_background_subtraction(true)?;
                                background_pending = None;
                            }
                            Err(SpectroError::NoSampleAvailable { .. }) => {}
                            Err(err) => return Err(err.into()),
                        }
                    }
                }
                if options.duration.is_some_and(|d| started.elapsed() >= d) {
                    break;
                }
            }
        }
    }

    let summary = tokio::task::block_in_place(|| controller.shutdown())?;
    drop(controller);
    let sink = presenter.await?;

    if let Some(summary) = summary {
        info!(
            identifier = %summary.identifier,
            cycles = summary.stats.cycles,
            read_failures = summary.stats.read_failures,
            saved = summary.stats.saved,
            save_failures = summary.stats.save_failures,
            dropped = summary.stats.samples_dropped,
            displayed = sink.samples,
            reason = %summary.reason,
            "Acquisition finished"
        );
        if let Some(err) = summary.reason.error() {
            bail!("acquisition failed: {err}");
        }
    }
    Ok(())
}

async fn snapshot(
    config: &AppConfig,
    device: Option<String>,
    save_dir: Option<PathBuf>,
    prefix: Option<String>,
) -> Result<()> {
    let (mut controller, rx) = build_controller(config)?;
    let presenter = tokio::spawn(present(rx, LogSink::default()));
    apply_storage_options(&controller, save_dir, prefix)?;
    select_device(&mut controller, device)?;

    let deadline = Instant::now() + Duration::from_secs(10);
    let path = loop {
        match controller.save_snapshot() {
            Ok(path) => break path,
            Err(SpectroError::NoSampleAvailable { .. }) if Instant::now() < deadline => {
                if !controller.is_acquiring() {
                    bail!("acquisition ended before a spectrum was read");
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(err) => return Err(err.into()),
        }
    };

    tokio::task::block_in_place(|| controller.shutdown())?;
    drop(controller);
    presenter.await?;
    println!("{}", path.display());
    Ok(())
}
