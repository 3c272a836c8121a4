//! Summary statistics of per-sample calibration residuals.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error("No residuals to summarize")]
    ZeroResiduals,
    #[error("Numerical error in computation: {0}")]
    NumericalError(String),
}

/// Distribution of the per-sample angular residuals of a calibration, radians.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualStatistics {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ResidualStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Residual Error (rad) [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

impl fmt::Display for ResidualStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rmse {:.4}° (min {:.4}°, median {:.4}°, max {:.4}°)",
            self.rmse.to_degrees(),
            self.min.to_degrees(),
            self.median.to_degrees(),
            self.max.to_degrees()
        )
    }
}

impl ResidualStatistics {
    /// Summarizes `errors`.
    ///
    /// # Arguments
    ///
    /// * `errors` - One non-negative error per sample.
    ///
    /// # Returns
    ///
    /// * `Ok(ResidualStatistics)` - rmse, min, max, mean, population standard
    ///   deviation and median of `errors`.
    /// * `Err(UtilError)` - If `errors` is empty or holds a non-finite value.
    pub fn from_errors(errors: &[f64]) -> Result<Self, UtilError> {
        if errors.is_empty() {
            return Err(UtilError::ZeroResiduals);
        }
        if let Some(bad) = errors.iter().find(|e| !e.is_finite()) {
            return Err(UtilError::NumericalError(format!("non-finite residual {bad}")));
        }

        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;

        let variance: f64 = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let stddev = variance.sqrt();

        let sum_squared: f64 = errors.iter().map(|x| x.powi(2)).sum::<f64>();
        let rmse = (sum_squared / n).sqrt();

        let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

        let mut sorted = errors.to_vec();
        sorted.sort_by(f64::total_cmp);
        let median = if sorted.len() % 2 == 0 {
            let mid = sorted.len() / 2;
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[sorted.len() / 2]
        };

        Ok(Self {
            rmse,
            min,
            max,
            mean,
            stddev,
            median,
        })
    }
}
