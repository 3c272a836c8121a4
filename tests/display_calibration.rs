use nalgebra::{Point3, UnitQuaternion, Vector3};
use spheree_calib::geometry::{geodesic_distance, geodesic_distance_deg};
use spheree_calib::optimization::{
    Bounds, CalibrationEstimate, DisplayCalibrationCost, LeastSquaresProblem, LevenbergMarquardt,
    ParameterLayout, SolverOptions, Termination,
};
use spheree_calib::pipeline::{
    CalibrationBackend, CalibrationConfig, CalibrationStatus, Calibrator,
    TINY_SOLVER_CHECK_ITERATIONS,
};
use spheree_calib::samples::{targets_on_sphere, NoiseModel, SampleGenerator};
use spheree_calib::{CalibrationSample, HeadToViewCalibration, RigidTransform};

const IPD: f64 = 0.064;

fn head_to_view_truth() -> HeadToViewCalibration {
    HeadToViewCalibration::new(
        Vector3::new(0.0, -0.07, 0.09),
        UnitQuaternion::from_euler_angles(0.02, -0.015, 0.0),
        0.0,
    )
}

fn yaw_30_display() -> RigidTransform {
    RigidTransform::from_parts(
        &Vector3::new(0.0, 1.5, 0.0),
        &UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 30f64.to_radians()),
        &Vector3::new(1.0, 1.0, 1.0),
        0.0,
    )
}

fn generate(display: RigidTransform, targets: usize, noise: NoiseModel) -> Vec<CalibrationSample> {
    SampleGenerator::new(
        display,
        head_to_view_truth(),
        IPD,
        targets_on_sphere(targets, 0.3, Point3::origin()),
    )
    .with_noise(noise)
    .with_seed(11)
    .generate()
    .unwrap()
    .all()
}

#[test]
fn test_yaw_30_scenario() {
    let display = yaw_30_display();
    let samples = generate(display, 25, NoiseModel::none());
    assert_eq!(samples.len(), 50);

    let outcome = Calibrator::default()
        .run(&samples, &CalibrationEstimate::identity())
        .unwrap();

    assert_eq!(outcome.status, CalibrationStatus::Converged);
    assert!(geodesic_distance_deg(&outcome.display.rotation(), &display.rotation()) < 0.01);
    assert!((outcome.display.translation() - display.translation()).norm() < 1e-3);
    assert!(outcome.display.error() < 1e-6);
    assert!(outcome.residuals.max < 1e-6);
}

#[test]
fn test_round_trip_recovery_with_scale() {
    let display = RigidTransform::from_parts(
        &Vector3::new(-0.2, 1.1, 0.6),
        &UnitQuaternion::from_euler_angles(0.05, -0.4, 0.1),
        &Vector3::new(1.04, 0.97, 1.01),
        0.0,
    );
    let samples = generate(display, 30, NoiseModel::none());
    let config = CalibrationConfig {
        layout: ParameterLayout::new(true, true),
        ..CalibrationConfig::default()
    };

    let (outcome, errors) = Calibrator::new(config)
        .run_with_ground_truth(
            &samples,
            &CalibrationEstimate::identity(),
            &display,
            &head_to_view_truth(),
        )
        .unwrap();

    assert!(outcome.is_converged());
    assert!(errors.translation_error() < 1e-6);
    assert!(errors.rotation_error_deg() < 1e-5);
    assert!((outcome.display.scale() - display.scale()).norm() < 1e-6);
    assert!(errors.head_to_view.translation.error() < 1e-6);
    assert!(errors.head_to_view.rotation.error() < 1e-6);
    assert!(outcome.display.error() < 1e-6);
}

#[test]
fn test_noise_degrades_error_monotonically() {
    let display = yaw_30_display();
    let calibrator = Calibrator::default();

    let errors: Vec<f64> = [0.0, 0.001, 0.005]
        .iter()
        .map(|&magnitude| {
            let samples = generate(display, 25, NoiseModel::uniform(magnitude, 2.0 * magnitude));
            calibrator
                .run(&samples, &CalibrationEstimate::identity())
                .unwrap()
                .display
                .error()
        })
        .collect();

    assert!(errors.iter().all(|e| e.is_finite()));
    assert!(errors[0] < 1e-6);
    assert!(errors[0] <= errors[1]);
    assert!(errors[1] <= errors[2]);
}

#[test]
fn test_large_noise_stays_finite() {
    let display = yaw_30_display();
    let samples = generate(display, 25, NoiseModel::uniform(0.05, 0.2));
    let outcome = Calibrator::default()
        .run(&samples, &CalibrationEstimate::identity())
        .unwrap();
    assert!(outcome.display.error().is_finite());
    assert!(outcome.display.is_calibrated());
    assert!(outcome.residuals.max.is_finite());
    assert!(outcome.display.matrix().iter().all(|v| v.is_finite()));
}

#[test]
fn test_single_iteration_from_far_guess() {
    let display = yaw_30_display();
    let samples = generate(display, 25, NoiseModel::none());
    let layout = ParameterLayout::default();
    let cost = DisplayCalibrationCost::new(&samples, IPD, layout, CalibrationEstimate::identity());

    let far = CalibrationEstimate {
        rotation: Vector3::new(0.0, -2.0, 0.0),
        translation: Vector3::new(1.0, -1.0, 1.0),
        ..CalibrationEstimate::identity()
    };
    let x0 = layout.encode(&far);
    let bounds = Bounds::around(&x0, &layout.half_widths(0.5, 0.5, 0.1));

    let solver = LevenbergMarquardt::new(
        SolverOptions::default()
            .with_max_iterations(1)
            .with_trajectory(true),
    );
    let output = solver.solve(&cost, &x0, &bounds, None).unwrap();

    assert_eq!(output.report.termination, Termination::BudgetExhausted);
    assert_ne!(output.report.termination, Termination::Converged);
    assert_eq!(output.report.iterations, 1);
    assert!(bounds.contains(&output.x));
}

#[test]
fn test_bounds_hold_on_every_accepted_iterate() {
    let display = yaw_30_display();
    let samples = generate(display, 25, NoiseModel::uniform(0.002, 0.004));
    let mut config = CalibrationConfig::default();
    config.solver.record_trajectory = true;
    // Tight enough for the translation bound to become active.
    config.bounds.translation = 0.05;
    config.align_initial_translation = false;

    let outcome = Calibrator::new(config)
        .run(&samples, &CalibrationEstimate::identity())
        .unwrap();

    let trajectory = &outcome.report.trajectory;
    assert!(trajectory.len() > 1);
    assert!(trajectory.iter().all(|x| outcome.bounds.contains(x)));
    assert!(outcome.bounds.contains(&outcome.solution));
    assert!(outcome.report.final_cost <= outcome.report.initial_cost);
}

#[test]
fn test_tiny_solver_backend_recovers_truth() {
    let display = yaw_30_display();
    let samples = generate(display, 25, NoiseModel::none());
    let config = CalibrationConfig {
        backend: CalibrationBackend::TinySolver,
        ..CalibrationConfig::default()
    };

    let outcome = Calibrator::new(config)
        .run(&samples, &CalibrationEstimate::identity())
        .unwrap();

    assert_eq!(outcome.status, CalibrationStatus::Converged);
    assert!(outcome.report.iterations <= TINY_SOLVER_CHECK_ITERATIONS);
    assert!(outcome.bounds.contains(&outcome.solution));
    assert!(geodesic_distance(&outcome.display.rotation(), &display.rotation()) < 1e-3);
    assert!((outcome.display.translation() - display.translation()).norm() < 1e-3);
}

#[test]
fn test_runtime_pose_composition() {
    let display = yaw_30_display();
    let samples = generate(display, 25, NoiseModel::none());
    let outcome = Calibrator::default()
        .run(&samples, &CalibrationEstimate::identity())
        .unwrap();

    let cost = DisplayCalibrationCost::new(
        &samples,
        IPD,
        ParameterLayout::default(),
        CalibrationEstimate::identity(),
    );
    assert_eq!(cost.num_residuals(), 150);

    // A solved calibration places every eye where the truth does.
    for sample in samples.iter().take(5) {
        let solved_head = outcome.display.transform_pose(&sample.pose);
        let true_head = display.transform_pose(&sample.pose);
        let solved_eye = outcome.head_to_view.view_pose(&solved_head, sample.anchor, IPD);
        let true_eye = head_to_view_truth().view_pose(&true_head, sample.anchor, IPD);
        assert!((solved_eye.position - true_eye.position).norm() < 1e-6);
        assert!(geodesic_distance(&solved_eye.rotation, &true_eye.rotation) < 1e-6);
    }
}
