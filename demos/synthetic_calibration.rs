//! Synthetic Display Calibration Example
//!
//! Generates calibration samples from a known display transform and
//! head-to-view calibration, solves for both from an identity guess and
//! reports how well the ground truth was recovered.
//!
//! Usage:
//! ```bash
//! cargo run --example synthetic_calibration -- \
//!   --yaw-deg 30 \
//!   --targets 25 \
//!   --position-noise 0.001 \
//!   --output output
//! ```

use clap::Parser;
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use log::{error, info};
use nalgebra::{Point3, UnitQuaternion, Vector3};
use spheree_calib::pipeline::{CalibrationConfig, Calibrator};
use spheree_calib::samples::{save_samples_csv, targets_on_sphere, NoiseModel, SampleGenerator};
use spheree_calib::{CalibrationEstimate, HeadToViewCalibration, RigidTransform};
use std::path::PathBuf;
use std::time::Instant;

/// Synthetic display calibration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Ground-truth display rotation about +Y, degrees
    #[arg(long, default_value = "30")]
    yaw_deg: f64,

    /// Number of display targets (two samples each)
    #[arg(short = 'n', long, default_value = "25")]
    targets: usize,

    /// Uniform position noise magnitude per axis, metres
    #[arg(long, default_value = "0")]
    position_noise: f64,

    /// Uniform rotation noise magnitude per axis, radians
    #[arg(long, default_value = "0")]
    rotation_noise: f64,

    /// Noise seed
    #[arg(short = 's', long, default_value = "42")]
    seed: u64,

    /// Optional calibration config (YAML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Directory for the calibration files and the sample recording
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    Logger::try_with_str("info")?
        .log_to_file(
            FileSpec::default()
                .directory("logs")
                .suppress_timestamp()
                .suffix("log"),
        )
        .duplicate_to_stdout(Duplicate::All)
        .format_for_files(detailed_format)
        .format_for_stdout(colored_detailed_format)
        .set_palette("196;208;76;39;178".to_string())
        .start()?;

    let cli = Cli::parse();
    info!("Arguments: {:?}", cli);

    let config = match &cli.config {
        Some(path) => {
            let path = path.to_str().ok_or("Invalid config path string")?;
            CalibrationConfig::load_from_yaml(path)?
        }
        None => CalibrationConfig::default(),
    };

    let display_truth = RigidTransform::from_parts(
        &Vector3::new(0.05, -1.25, 0.35),
        &UnitQuaternion::from_axis_angle(&Vector3::y_axis(), cli.yaw_deg.to_radians()),
        &Vector3::new(1.0, 1.0, 1.0),
        0.0,
    );
    let head_to_view_truth = HeadToViewCalibration::new(
        Vector3::new(0.0, -0.07, 0.09),
        UnitQuaternion::from_euler_angles(0.02, -0.015, 0.0),
        0.0,
    );

    let samples = SampleGenerator::new(
        display_truth,
        head_to_view_truth,
        config.interpupillary_distance,
        targets_on_sphere(cli.targets, 0.3, Point3::origin()),
    )
    .with_noise(NoiseModel::uniform(cli.position_noise, cli.rotation_noise))
    .with_seed(cli.seed)
    .generate()?
    .all();
    info!("Generated {} samples", samples.len());

    let calibrator = Calibrator::new(config);
    let start = Instant::now();
    let result = calibrator.run_with_ground_truth(
        &samples,
        &CalibrationEstimate::identity(),
        &display_truth,
        &head_to_view_truth,
    );
    let elapsed_ms = start.elapsed().as_secs_f64() * 1e3;

    let (outcome, errors) = match result {
        Ok(result) => result,
        Err(e) => {
            error!("Calibration failed: {e}");
            return Err(e.into());
        }
    };

    info!("Solver: {}", outcome.report);
    info!("Status: {} ({} restarts, {:.1} ms)", outcome.status, outcome.restarts, elapsed_ms);
    info!("Gaze residuals: {:?}", outcome.residuals);
    info!(
        "Display translation error: {:.4} mm",
        errors.translation_error() * 1e3
    );
    info!("Display rotation error: {:.5}°", errors.rotation_error_deg());
    info!(
        "Head-to-view errors: {:.4} mm, {:.5}°",
        errors.head_to_view.translation.error() * 1e3,
        errors.head_to_view.rotation.error().to_degrees()
    );

    if let Some(dir) = &cli.output {
        std::fs::create_dir_all(dir)?;
        outcome.display.save_json(dir.join("display_calibration.json"))?;
        outcome
            .head_to_view
            .save_json(dir.join("head_to_view_calibration.json"))?;
        save_samples_csv(dir.join("samples.csv"), &samples)?;
    }

    Ok(())
}
