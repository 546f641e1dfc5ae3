//! Construction-time configuration of the estimator.
//!
//! [`Settings`] is consumed once by [`crate::LeggedStateEstimator::new`] and never mutated
//! afterwards. It can be written to and read from JSON, YAML or TOML files; the format is picked
//! from the file extension by [`Settings::to_file`] / [`Settings::from_file`].
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::contact::ContactEstimatorSettings;
use crate::errors::EstimatorError;
use crate::inekf::{ContactKind, DT_MAX, DT_MIN};
use crate::lowpass::CutoffFrequencies;
use crate::noise::NoiseParams;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Robot description handed to the kinematics provider
    pub urdf_path: String,
    /// Name of the IMU frame in the robot description
    pub imu_frame: String,
    /// Ordered contact frame names. The order defines the leg/slot index everywhere.
    pub contact_frames: Vec<String>,
    /// Geometry per contact frame. Empty means every contact is a point contact.
    pub contact_kinds: Vec<ContactKind>,
    pub contact_estimator_settings: ContactEstimatorSettings,
    pub noise_params: NoiseParams,
    /// Use inverse dynamics in contact estimation; otherwise quasi-static equilibrium
    pub dynamic_contact_estimation: bool,
    /// Variance of the kinematic contact position measurement (m²)
    pub contact_position_noise: f64,
    /// Variance of the kinematic contact orientation measurement (rad²), surface contacts only
    pub contact_rotation_noise: f64,
    /// Ticks a tracked contact may stay out of stance before it leaves the state
    pub contact_removal_ticks: usize,
    /// Fixed estimation period (s)
    pub dt: f64,
    pub lpf_gyro_cutoff: f64,
    pub lpf_gyro_accel_cutoff: f64,
    pub lpf_lin_accel_cutoff: f64,
    pub lpf_dqj_cutoff: f64,
    pub lpf_ddqj_cutoff: f64,
    pub lpf_tauj_cutoff: f64,
    /// Cascaded first-order stages per low-pass filter
    pub lpf_stages: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings::unitree_a1("", 0.001)
    }
}

impl Settings {
    /// Reference quadruped (Unitree A1) configuration.
    pub fn unitree_a1<P: AsRef<Path>>(urdf_path: P, dt: f64) -> Self {
        let mut noise_params = NoiseParams::default();
        noise_params.set_gyroscope_noise(0.01);
        noise_params.set_accelerometer_noise(0.1);
        noise_params.set_gyroscope_bias_noise(0.00001);
        noise_params.set_accelerometer_bias_noise(0.0001);
        noise_params.set_contact_noise(0.1);
        Settings {
            urdf_path: urdf_path.as_ref().to_string_lossy().into_owned(),
            imu_frame: "imu_link".to_string(),
            contact_frames: ["FL_foot", "FR_foot", "RL_foot", "RR_foot"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            contact_kinds: vec![ContactKind::Point; 4],
            contact_estimator_settings: ContactEstimatorSettings {
                beta0: vec![-20.0; 4],
                beta1: vec![0.7; 4],
                ..Default::default()
            },
            noise_params,
            dynamic_contact_estimation: false,
            contact_position_noise: 0.01,
            contact_rotation_noise: 0.01,
            contact_removal_ticks: 0,
            dt,
            lpf_gyro_cutoff: 250.0,
            lpf_gyro_accel_cutoff: 250.0,
            lpf_lin_accel_cutoff: 250.0,
            lpf_dqj_cutoff: 10.0,
            lpf_ddqj_cutoff: 5.0,
            lpf_tauj_cutoff: 10.0,
            lpf_stages: 1,
        }
    }

    pub fn num_contacts(&self) -> usize {
        self.contact_frames.len()
    }

    pub fn cutoffs(&self) -> CutoffFrequencies {
        CutoffFrequencies {
            gyro: self.lpf_gyro_cutoff,
            gyro_accel: self.lpf_gyro_accel_cutoff,
            lin_accel: self.lpf_lin_accel_cutoff,
            joint_velocity: self.lpf_dqj_cutoff,
            joint_acceleration: self.lpf_ddqj_cutoff,
            joint_torque: self.lpf_tauj_cutoff,
        }
    }

    /// Contact geometry per frame, defaulting to point contacts.
    pub fn resolved_contact_kinds(&self) -> Vec<ContactKind> {
        if self.contact_kinds.is_empty() {
            vec![ContactKind::Point; self.num_contacts()]
        } else {
            self.contact_kinds.clone()
        }
    }

    /// Check internal consistency. Frame names and the URDF itself are checked by the estimator.
    pub fn validate(&self) -> Result<(), EstimatorError> {
        if !(self.dt > DT_MIN && self.dt < DT_MAX) {
            return Err(EstimatorError::Configuration(format!(
                "dt must lie in ({}, {}) s, got {}",
                DT_MIN, DT_MAX, self.dt
            )));
        }
        if self.contact_frames.is_empty() {
            return Err(EstimatorError::Configuration(
                "at least one contact frame is required".to_string(),
            ));
        }
        if !self.contact_kinds.is_empty() && self.contact_kinds.len() != self.num_contacts() {
            return Err(EstimatorError::Configuration(format!(
                "{} contact kinds given for {} contact frames",
                self.contact_kinds.len(),
                self.num_contacts()
            )));
        }
        let cutoffs = [
            ("lpf_gyro_cutoff", self.lpf_gyro_cutoff),
            ("lpf_gyro_accel_cutoff", self.lpf_gyro_accel_cutoff),
            ("lpf_lin_accel_cutoff", self.lpf_lin_accel_cutoff),
            ("lpf_dqj_cutoff", self.lpf_dqj_cutoff),
            ("lpf_ddqj_cutoff", self.lpf_ddqj_cutoff),
            ("lpf_tauj_cutoff", self.lpf_tauj_cutoff),
        ];
        for (name, value) in cutoffs {
            if !(value.is_finite() && value > 0.0) {
                return Err(EstimatorError::Configuration(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if self.lpf_stages == 0 {
            return Err(EstimatorError::Configuration(
                "lpf_stages must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("contact_position_noise", self.contact_position_noise),
            ("contact_rotation_noise", self.contact_rotation_noise),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(EstimatorError::Configuration(format!(
                    "{} must be non-negative, got {}",
                    name, value
                )));
            }
        }
        self.contact_estimator_settings
            .validate(self.num_contacts())?;
        self.noise_params.validate()
    }

    /// Write the settings as pretty JSON.
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }

    /// Read the settings from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }

    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }

    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }

    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }

    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }

    /// Write in the format named by the extension (.json/.yaml/.yml/.toml).
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported settings file extension",
            )),
        }
    }

    /// Read in the format named by the extension (.json/.yaml/.yml/.toml).
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported settings file extension",
            )),
        }
    }
}

fn extension(p: &Path) -> Option<String> {
    p.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use tempfile::NamedTempFile;

    fn sample() -> Settings {
        let mut s = Settings::unitree_a1("/robots/a1.urdf", 0.0025);
        s.dynamic_contact_estimation = true;
        s.contact_kinds[2] = ContactKind::Surface;
        s.contact_estimator_settings.debounce_ticks = 5;
        s.noise_params.set_contact_noise(0.05);
        s
    }

    fn assert_same(a: &Settings, b: &Settings) {
        assert_eq!(a.urdf_path, b.urdf_path);
        assert_eq!(a.contact_frames, b.contact_frames);
        assert_eq!(a.contact_kinds, b.contact_kinds);
        assert_eq!(a.dynamic_contact_estimation, b.dynamic_contact_estimation);
        assert_eq!(
            a.contact_estimator_settings.debounce_ticks,
            b.contact_estimator_settings.debounce_ticks
        );
        assert_approx_eq!(a.dt, b.dt, 1e-15);
        assert_approx_eq!(
            a.noise_params.contact_cov[(1, 1)],
            b.noise_params.contact_cov[(1, 1)],
            1e-15
        );
        assert_approx_eq!(a.lpf_ddqj_cutoff, b.lpf_ddqj_cutoff, 1e-15);
    }

    #[test]
    fn a1_preset_is_valid() {
        let s = Settings::unitree_a1("a1.urdf", 0.0025);
        assert!(s.validate().is_ok());
        assert_eq!(s.imu_frame, "imu_link");
        assert_eq!(s.contact_frames[3], "RR_foot");
        assert!(!s.dynamic_contact_estimation);
        assert_approx_eq!(s.noise_params.gyroscope_cov[(0, 0)], 1e-4, 1e-18);
        assert_eq!(s.cutoffs().joint_acceleration, 5.0);
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut s = Settings::unitree_a1("a1.urdf", 0.0);
        assert!(matches!(s.validate(), Err(EstimatorError::Configuration(_))));
        s.dt = 0.001;
        s.lpf_tauj_cutoff = 0.0;
        assert!(s.validate().is_err());
        s.lpf_tauj_cutoff = 10.0;
        s.contact_frames.pop();
        assert!(s.validate().is_err());
        s.contact_kinds.clear();
        s.contact_estimator_settings.beta0.pop();
        s.contact_estimator_settings.beta1.pop();
        assert!(s.validate().is_ok());
        assert_eq!(s.resolved_contact_kinds(), vec![ContactKind::Point; 3]);
        s.contact_frames.clear();
        assert!(s.validate().is_err());
    }

    #[test]
    fn json_roundtrip() {
        let cfg = sample();
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("json");
        cfg.to_json(&path).unwrap();
        assert_same(&cfg, &Settings::from_json(&path).unwrap());
    }

    #[test]
    fn yaml_roundtrip() {
        let cfg = sample();
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("yaml");
        cfg.to_yaml(&path).unwrap();
        assert_same(&cfg, &Settings::from_yaml(&path).unwrap());
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = sample();
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("toml");
        cfg.to_toml(&path).unwrap();
        assert_same(&cfg, &Settings::from_toml(&path).unwrap());
    }

    #[test]
    fn generic_dispatch() {
        let cfg = sample();
        for ext in ["json", "yml", "toml"] {
            let f = NamedTempFile::new().unwrap();
            let path = f.path().with_extension(ext);
            cfg.to_file(&path).unwrap();
            assert_same(&cfg, &Settings::from_file(&path).unwrap());
        }
        let f = NamedTempFile::new().unwrap();
        let bad = f.path().with_extension("ini");
        assert_eq!(
            cfg.to_file(&bad).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let s: Settings = serde_json::from_str(r#"{ "urdf_path": "x.urdf", "dt": 0.002 }"#).unwrap();
        assert_eq!(s.urdf_path, "x.urdf");
        assert_eq!(s.contact_frames.len(), 4);
        assert!(s.validate().is_ok());
    }
}
