//! CSV recording and replay of calibration samples.
//!
//! One row per sample with the header
//! `frame,anchor,px,py,pz,qx,qy,qz,qw,tx,ty,tz,gx,gy,gz`: the tracked position,
//! the tracked orientation as an `(x, y, z, w)` quaternion, the display-space
//! target and the view-frame gaze direction.

use crate::calibration::{CalibrationError, Eye};
use crate::geometry::Pose;
use crate::samples::CalibrationSample;
use log::info;
use nalgebra::{Point3, Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize)]
struct SampleRecord {
    frame: usize,
    anchor: String,
    px: f64,
    py: f64,
    pz: f64,
    qx: f64,
    qy: f64,
    qz: f64,
    qw: f64,
    tx: f64,
    ty: f64,
    tz: f64,
    gx: f64,
    gy: f64,
    gz: f64,
}

impl From<&CalibrationSample> for SampleRecord {
    fn from(sample: &CalibrationSample) -> Self {
        let q = sample.pose.rotation.quaternion();
        Self {
            frame: sample.frame,
            anchor: sample.anchor.as_str().to_string(),
            px: sample.pose.position.x,
            py: sample.pose.position.y,
            pz: sample.pose.position.z,
            qx: q.i,
            qy: q.j,
            qz: q.k,
            qw: q.w,
            tx: sample.target.x,
            ty: sample.target.y,
            tz: sample.target.z,
            gx: sample.gaze.x,
            gy: sample.gaze.y,
            gz: sample.gaze.z,
        }
    }
}

impl SampleRecord {
    fn into_sample(self, row: usize) -> Result<CalibrationSample, CalibrationError> {
        let anchor: Eye = self.anchor.parse().map_err(|_| CalibrationError::InvalidSample {
            index: row,
            reason: format!("unknown anchor '{}'", self.anchor),
        })?;
        let quaternion = Quaternion::new(self.qw, self.qx, self.qy, self.qz);
        let norm = quaternion.norm();
        if !norm.is_finite() || norm < 1e-6 {
            return Err(CalibrationError::InvalidSample {
                index: row,
                reason: "orientation quaternion is zero or not finite".to_string(),
            });
        }
        Ok(CalibrationSample::new(
            self.frame,
            anchor,
            Pose::new(
                Point3::new(self.px, self.py, self.pz),
                UnitQuaternion::from_quaternion(quaternion),
            ),
            Point3::new(self.tx, self.ty, self.tz),
            Vector3::new(self.gx, self.gy, self.gz),
        ))
    }
}

/// Writes `samples` as CSV, header included.
pub fn write_samples<W: io::Write>(
    writer: W,
    samples: &[CalibrationSample],
) -> Result<(), CalibrationError> {
    let mut writer = csv::Writer::from_writer(writer);
    for sample in samples {
        writer.serialize(SampleRecord::from(sample))?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads samples written by [`write_samples`].
///
/// Rows are validated as they are parsed; the first bad row aborts the read
/// and is reported by its zero-based index.
pub fn read_samples<R: io::Read>(reader: R) -> Result<Vec<CalibrationSample>, CalibrationError> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut samples = Vec::new();
    for (row, record) in reader.deserialize::<SampleRecord>().enumerate() {
        let sample = record?.into_sample(row)?;
        sample.validate(row)?;
        samples.push(sample);
    }
    Ok(samples)
}

pub fn save_samples_csv<P: AsRef<Path>>(
    path: P,
    samples: &[CalibrationSample],
) -> Result<(), CalibrationError> {
    let path = path.as_ref();
    let file = std::fs::File::create(path)?;
    write_samples(file, samples)?;
    info!("Saved {} calibration samples to {}", samples.len(), path.display());
    Ok(())
}

pub fn load_samples_csv<P: AsRef<Path>>(path: P) -> Result<Vec<CalibrationSample>, CalibrationError> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)?;
    let samples = read_samples(file)?;
    info!("Loaded {} calibration samples from {}", samples.len(), path.display());
    Ok(samples)
}
