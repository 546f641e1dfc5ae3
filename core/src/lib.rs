//! State estimation for legged robots
//!
//! This crate estimates the floating-base state of a legged robot (orientation, velocity,
//! position, IMU biases and the positions of the feet in contact) by fusing a body-mounted IMU
//! with leg kinematics in a right-invariant extended Kalman filter (InEKF) on the group
//! SE_K(3). It is meant to run inside a fixed-rate control loop: one call to
//! [`LeggedStateEstimator::update`] per tick.
//!
//! Rigid-body kinematics and dynamics are not computed here. The estimator consumes them through
//! the narrow [`model::KinematicsProvider`] and [`model::DynamicsProvider`] traits so that any
//! URDF or rigid-body library can back it.
//!
//! ## Crate overview
//!
//! - [lowpass]: first-order low-pass filters and the per-channel [`lowpass::SignalConditioner`]
//! - [contact]: per-leg contact probability with hysteresis and debounce
//! - [state]: the filter state as a fixed-capacity arena of contact slots
//! - [inekf]: propagation and stacked contact correction
//! - [estimator]: the per-tick pipeline tying the above together
//! - [settings]: the configuration aggregate and its JSON/YAML/TOML persistence
//! - [sim]: a toy leg model, a noisy sample generator and CSV estimate logs for testing
//! - [lie], [linalg]: group and covariance algebra
//!
//! ## Conventions
//!
//! The world frame is z-up with gravity `(0, 0, -9.81)`. The IMU reports specific force, so an
//! IMU at rest and level reads `(0, 0, 9.81)`. Error states are ordered
//! `[R, v, p, d_1..d_K, b_g, b_a]` and live in the right-invariant (world) frame.
use std::fmt::{self, Display};

use nalgebra::{DVector, Vector3};

pub mod contact;
pub mod errors;
pub mod estimator;
pub mod inekf;
pub mod lie;
pub mod linalg;
pub mod lowpass;
pub mod model;
pub mod noise;
pub mod settings;
pub mod sim;
pub mod state;

pub use contact::{ContactEstimate, ContactEstimator, ContactEstimatorSettings, ContactState};
pub use errors::EstimatorError;
pub use estimator::{EstimateSnapshot, LeggedStateEstimator};
pub use inekf::{ContactKind, InEKF, LegKinematics};
pub use noise::{InitialCovariance, NoiseParams};
pub use settings::Settings;
pub use state::{InEKFState, InitialState};

/// One IMU sample in the IMU frame.
///
/// The accelerometer reports specific force (gravity is not compensated).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ImuMeasurement {
    /// Angular rate in rad/s
    pub gyro: Vector3<f64>,
    /// Specific force in m/s^2
    pub accel: Vector3<f64>,
}

impl ImuMeasurement {
    pub fn new(gyro: Vector3<f64>, accel: Vector3<f64>) -> Self {
        ImuMeasurement { gyro, accel }
    }

    pub fn is_finite(&self) -> bool {
        self.gyro.iter().chain(self.accel.iter()).all(|x| x.is_finite())
    }
}

impl Display for ImuMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ImuMeasurement {{ gyro: [{:.4}, {:.4}, {:.4}], accel: [{:.4}, {:.4}, {:.4}] }}",
            self.gyro[0], self.gyro[1], self.gyro[2], self.accel[0], self.accel[1], self.accel[2]
        )
    }
}

impl TryFrom<Vec<f64>> for ImuMeasurement {
    type Error = EstimatorError;

    /// `[gyro_x, gyro_y, gyro_z, accel_x, accel_y, accel_z]`
    fn try_from(vec: Vec<f64>) -> Result<Self, Self::Error> {
        if vec.len() != 6 {
            return Err(EstimatorError::DimensionMismatch {
                expected: 6,
                found: vec.len(),
            });
        }
        Ok(ImuMeasurement {
            gyro: Vector3::new(vec[0], vec[1], vec[2]),
            accel: Vector3::new(vec[3], vec[4], vec[5]),
        })
    }
}

impl From<ImuMeasurement> for Vec<f64> {
    fn from(data: ImuMeasurement) -> Self {
        data.gyro.iter().chain(data.accel.iter()).cloned().collect()
    }
}

/// Joint encoder and torque sample, one entry per actuated joint.
#[derive(Clone, Debug, PartialEq)]
pub struct JointMeasurement {
    /// Joint positions (rad)
    pub q: DVector<f64>,
    /// Joint velocities (rad/s)
    pub dq: DVector<f64>,
    /// Joint torques (Nm)
    pub tau: DVector<f64>,
}

impl JointMeasurement {
    pub fn new(q: DVector<f64>, dq: DVector<f64>, tau: DVector<f64>) -> Self {
        JointMeasurement { q, dq, tau }
    }

    /// All-zero sample for `num_joints` joints.
    pub fn zeros(num_joints: usize) -> Self {
        JointMeasurement {
            q: DVector::zeros(num_joints),
            dq: DVector::zeros(num_joints),
            tau: DVector::zeros(num_joints),
        }
    }

    /// Check every array has `num_joints` entries.
    pub fn check_dimension(&self, num_joints: usize) -> Result<(), EstimatorError> {
        for found in [self.q.len(), self.dq.len(), self.tau.len()] {
            if found != num_joints {
                return Err(EstimatorError::DimensionMismatch {
                    expected: num_joints,
                    found,
                });
            }
        }
        Ok(())
    }
}
