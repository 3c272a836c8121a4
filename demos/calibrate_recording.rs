//! Calibrate From a Sample Recording
//!
//! Loads a CSV sample recording, calibrates the display and writes the
//! resulting calibration files. An existing calibration can be supplied as
//! the initial guess.
//!
//! Usage:
//! ```bash
//! RUST_LOG=info cargo run --example calibrate_recording -- \
//!   --samples output/samples.csv \
//!   --output output
//! ```

use clap::Parser;
use log::{info, warn};
use spheree_calib::pipeline::{CalibrationConfig, Calibrator};
use spheree_calib::samples::load_samples_csv;
use spheree_calib::{CalibrationEstimate, HeadToViewCalibration, RigidTransform};
use std::path::PathBuf;

/// Display calibration from recorded samples
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// CSV sample recording
    #[arg(short = 'i', long)]
    samples: PathBuf,

    /// Calibration config (YAML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Display calibration used as the initial guess
    #[arg(long)]
    initial_display: Option<PathBuf>,

    /// Head-to-view calibration used as the initial guess
    #[arg(long)]
    initial_head_to_view: Option<PathBuf>,

    /// Output directory
    #[arg(short = 'o', long, default_value = "output")]
    output: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            CalibrationConfig::load_from_yaml(path.to_str().ok_or("Invalid config path string")?)?
        }
        None => CalibrationConfig::default(),
    };

    let samples = load_samples_csv(&cli.samples)?;

    let display = match &cli.initial_display {
        Some(path) => RigidTransform::load_json(path)?,
        None => RigidTransform::identity(),
    };
    let head_to_view = match &cli.initial_head_to_view {
        Some(path) => HeadToViewCalibration::load_json(path)?,
        None => HeadToViewCalibration::identity(),
    };
    let initial = CalibrationEstimate::from_calibrations(&display, &head_to_view);

    let outcome = Calibrator::new(config).run(&samples, &initial)?;
    if !outcome.is_converged() {
        warn!("Calibration did not converge: {}", outcome.report);
    }

    println!("Solver:      {}", outcome.report);
    println!("Residuals:   {}", outcome.residuals);
    println!("Translation: {:?}", outcome.display.translation());
    println!("Rotation:    {:?}", outcome.display.rotation().euler_angles());
    println!("Scale:       {:?}", outcome.display.scale());

    std::fs::create_dir_all(&cli.output)?;
    let display_path = cli.output.join("display_calibration.json");
    let head_to_view_path = cli.output.join("head_to_view_calibration.json");
    outcome.display.save_json(&display_path)?;
    outcome.head_to_view.save_json(&head_to_view_path)?;
    info!(
        "Wrote {} and {}",
        display_path.display(),
        head_to_view_path.display()
    );

    Ok(())
}
