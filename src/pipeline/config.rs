//! Calibration settings, loadable from YAML.
//!
//! Every field has a default, so a YAML file only needs the keys it changes:
//!
//! ```yaml
//! interpupillary_distance: 0.062
//! solver:
//!   max_iterations: 200
//! layout:
//!   estimate_scale: true
//! backend: tiny_solver
//! ```

use crate::calibration::CalibrationError;
use crate::optimization::{ParameterLayout, SolverOptions};
use log::info;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fs;
use std::io::Write;

/// Optimizer that runs the solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationBackend {
    /// The crate's bounded Levenberg-Marquardt solver.
    #[default]
    Bounded,
    /// `tiny-solver`'s Levenberg-Marquardt optimizer.
    TinySolver,
}

/// Half-widths of the box bounds placed around the initial guess.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundsConfig {
    /// Radians, for every rotation-vector component.
    pub rotation: f64,
    /// Metres, for translation and head-offset components.
    pub translation: f64,
    /// For scale components.
    pub scale: f64,
}

impl Default for BoundsConfig {
    fn default() -> Self {
        Self {
            rotation: PI,
            translation: 2.0,
            scale: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub solver: SolverOptions,
    pub bounds: BoundsConfig,
    pub layout: ParameterLayout,
    /// Eye separation, metres.
    pub interpupillary_distance: f64,
    /// Re-solves allowed after a solve runs out of iterations.
    pub max_restarts: usize,
    /// Yaw offsets, degrees about display `+Y`, applied to the initial
    /// rotation on successive restarts.
    pub restart_yaw_deg: Vec<f64>,
    /// Replace the initial translation by the one that aligns the predicted
    /// and observed centroids before solving.
    pub align_initial_translation: bool,
    pub backend: CalibrationBackend,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            solver: SolverOptions::default(),
            bounds: BoundsConfig::default(),
            layout: ParameterLayout::default(),
            interpupillary_distance: 0.064,
            max_restarts: 3,
            restart_yaw_deg: vec![90.0, -90.0, 180.0],
            align_initial_translation: true,
            backend: CalibrationBackend::default(),
        }
    }
}

impl CalibrationConfig {
    /// Checks the settings that the solver does not check itself.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        if !(self.interpupillary_distance.is_finite() && self.interpupillary_distance >= 0.0) {
            return Err(CalibrationError::InvalidParams(format!(
                "interpupillary distance must be non-negative, found {}",
                self.interpupillary_distance
            )));
        }
        let widths = [
            ("rotation", self.bounds.rotation),
            ("translation", self.bounds.translation),
            ("scale", self.bounds.scale),
        ];
        for (name, width) in widths {
            if !(width.is_finite() && width > 0.0) {
                return Err(CalibrationError::InvalidParams(format!(
                    "{name} bound half-width must be positive, found {width}"
                )));
            }
        }
        if self.restart_yaw_deg.iter().any(|yaw| !yaw.is_finite()) {
            return Err(CalibrationError::InvalidParams(
                "restart yaw offsets must be finite".to_string(),
            ));
        }
        Ok(())
    }

    /// Loads a configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::IOError`]: If the file cannot be read.
    /// * [`CalibrationError::YamlError`]: If the content is not valid YAML
    ///   for this type.
    /// * [`CalibrationError::InvalidParams`]: If a value is out of range.
    pub fn load_from_yaml(path: &str) -> Result<Self, CalibrationError> {
        let contents = fs::read_to_string(path)?;
        let config: CalibrationConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        info!("Loaded calibration config from {path}");
        Ok(config)
    }

    pub fn save_to_yaml(&self, path: &str) -> Result<(), CalibrationError> {
        let yaml_string = serde_yaml::to_string(self)?;
        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "interpupillary_distance: 0.062\nsolver:\n  max_iterations: 250\nbackend: tiny_solver\n";
        let config: CalibrationConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.interpupillary_distance, 0.062);
        assert_eq!(config.solver.max_iterations, 250);
        assert_eq!(config.solver.x_tolerance, SolverOptions::default().x_tolerance);
        assert_eq!(config.backend, CalibrationBackend::TinySolver);
        assert_eq!(config.restart_yaw_deg, vec![90.0, -90.0, 180.0]);
        assert!(config.layout.estimate_head_to_view);
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.yaml");
        let path = path.to_str().unwrap();

        let config = CalibrationConfig {
            max_restarts: 1,
            layout: ParameterLayout::new(true, false),
            ..CalibrationConfig::default()
        };
        config.save_to_yaml(path).unwrap();
        assert_eq!(CalibrationConfig::load_from_yaml(path).unwrap(), config);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "interpupillary_distance: -1.0\n").unwrap();
        assert!(matches!(
            CalibrationConfig::load_from_yaml(path.to_str().unwrap()),
            Err(CalibrationError::InvalidParams(_))
        ));

        std::fs::write(&path, "backend: [1, 2]\n").unwrap();
        assert!(matches!(
            CalibrationConfig::load_from_yaml(path.to_str().unwrap()),
            Err(CalibrationError::YamlError(_))
        ));

        assert!(matches!(
            CalibrationConfig::load_from_yaml("/nonexistent/config.yaml"),
            Err(CalibrationError::IOError(_))
        ));
    }
}
