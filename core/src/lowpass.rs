//! Low-pass filter bank for IMU and joint signals.
//!
//! Every conditioned signal class owns one [`LowPassFilter`]: a cascade of identical first-order
//! IIR stages
//!
//! $$
//! y_k = \alpha x_k + (1 - \alpha) y_{k-1}, \qquad \alpha = \frac{2 \pi f_c \Delta t}{1 + 2 \pi f_c \Delta t}
//! $$
//!
//! The coefficient is derived once from the cutoff frequency and the fixed estimator time step.
//! Stages are always evaluated in the same order so the phase lag of a channel is reproducible,
//! which matters because the contact classifier mixes channels with different lags.

use std::f64::consts::PI;
use std::fmt::{self, Display};

use log::warn;
use nalgebra::DVector;

use crate::errors::EstimatorError;

/// Signal classes conditioned before they reach the filter and the contact classifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Angular velocity from the gyroscope (body frame)
    Gyro,
    /// Finite-difference derivative of the gyro signal (world frame)
    GyroAccel,
    /// Specific force from the accelerometer (body frame)
    LinAccel,
    /// Joint velocities
    JointVelocity,
    /// Finite-difference joint accelerations
    JointAcceleration,
    /// Joint torques
    JointTorque,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::Gyro,
        Channel::GyroAccel,
        Channel::LinAccel,
        Channel::JointVelocity,
        Channel::JointAcceleration,
        Channel::JointTorque,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Channel::Gyro => "gyro",
            Channel::GyroAccel => "gyro_accel",
            Channel::LinAccel => "lin_accel",
            Channel::JointVelocity => "dqJ",
            Channel::JointAcceleration => "ddqJ",
            Channel::JointTorque => "tauJ",
        }
    }

    fn index(&self) -> usize {
        match self {
            Channel::Gyro => 0,
            Channel::GyroAccel => 1,
            Channel::LinAccel => 2,
            Channel::JointVelocity => 3,
            Channel::JointAcceleration => 4,
            Channel::JointTorque => 5,
        }
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Cascaded first-order low-pass filter over a fixed-size vector signal.
#[derive(Clone, Debug)]
pub struct LowPassFilter {
    alpha: f64,
    stages: Vec<DVector<f64>>,
    primed: bool,
}

impl LowPassFilter {
    /// Build a filter for a `dim`-sized signal.
    ///
    /// # Arguments
    /// * `cutoff_hz` - cutoff frequency of each stage, must be positive
    /// * `dt` - fixed sampling period in seconds, must be positive
    /// * `dim` - signal dimension, never changes afterwards
    /// * `num_stages` - number of cascaded stages (at least one)
    pub fn new(
        cutoff_hz: f64,
        dt: f64,
        dim: usize,
        num_stages: usize,
    ) -> Result<LowPassFilter, EstimatorError> {
        if !(cutoff_hz.is_finite() && cutoff_hz > 0.0) {
            return Err(EstimatorError::Configuration(format!(
                "low-pass cutoff must be positive, got {}",
                cutoff_hz
            )));
        }
        if !(dt.is_finite() && dt > 0.0) {
            return Err(EstimatorError::Configuration(format!(
                "low-pass time step must be positive, got {}",
                dt
            )));
        }
        if num_stages == 0 {
            return Err(EstimatorError::Configuration(
                "low-pass filter needs at least one stage".to_string(),
            ));
        }
        let wc = 2.0 * PI * cutoff_hz * dt;
        Ok(LowPassFilter {
            alpha: wc / (1.0 + wc),
            stages: vec![DVector::zeros(dim); num_stages],
            primed: false,
        })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn dim(&self) -> usize {
        self.stages[0].len()
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// Latest filtered value (the last stage of the cascade).
    pub fn output(&self) -> &DVector<f64> {
        &self.stages[self.stages.len() - 1]
    }

    /// Forget the history; the next accepted sample primes every stage.
    pub fn reset(&mut self) {
        for s in self.stages.iter_mut() {
            s.fill(0.0);
        }
        self.primed = false;
    }

    /// Feed one sample. Non-finite or wrong-sized samples leave the state untouched and are
    /// reported as errors; the held output stays available through [`LowPassFilter::output`].
    pub fn update(&mut self, x: &DVector<f64>, channel: &str) -> Result<&DVector<f64>, EstimatorError> {
        if x.len() != self.dim() {
            return Err(EstimatorError::DimensionMismatch {
                expected: self.dim(),
                found: x.len(),
            });
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(EstimatorError::NonFiniteSample {
                channel: channel.to_string(),
            });
        }
        if !self.primed {
            for s in self.stages.iter_mut() {
                s.copy_from(x);
            }
            self.primed = true;
            return Ok(self.output());
        }
        let alpha = self.alpha;
        let mut input = x.clone();
        for s in self.stages.iter_mut() {
            *s = alpha * &input + (1.0 - alpha) * &*s;
            input.copy_from(s);
        }
        Ok(self.output())
    }
}

/// Cutoff frequencies (Hz) per signal class.
#[derive(Clone, Copy, Debug)]
pub struct CutoffFrequencies {
    pub gyro: f64,
    pub gyro_accel: f64,
    pub lin_accel: f64,
    pub joint_velocity: f64,
    pub joint_acceleration: f64,
    pub joint_torque: f64,
}

/// The filter bank: one independent [`LowPassFilter`] per [`Channel`].
#[derive(Clone, Debug)]
pub struct SignalConditioner {
    filters: Vec<LowPassFilter>,
    rejected: [usize; 6],
}

impl SignalConditioner {
    pub fn new(
        cutoffs: CutoffFrequencies,
        dt: f64,
        num_joints: usize,
        num_stages: usize,
    ) -> Result<SignalConditioner, EstimatorError> {
        // Order must follow Channel::index
        let filters = vec![
            LowPassFilter::new(cutoffs.gyro, dt, 3, num_stages)?,
            LowPassFilter::new(cutoffs.gyro_accel, dt, 3, num_stages)?,
            LowPassFilter::new(cutoffs.lin_accel, dt, 3, num_stages)?,
            LowPassFilter::new(cutoffs.joint_velocity, dt, num_joints, num_stages)?,
            LowPassFilter::new(cutoffs.joint_acceleration, dt, num_joints, num_stages)?,
            LowPassFilter::new(cutoffs.joint_torque, dt, num_joints, num_stages)?,
        ];
        Ok(SignalConditioner {
            filters,
            rejected: [0; 6],
        })
    }

    /// Filter one raw sample of `channel`.
    ///
    /// On a rejected sample the previous output is held, a warning is logged and the error is
    /// returned so the caller can surface it; [`SignalConditioner::output`] still yields the held
    /// value.
    pub fn filter(
        &mut self,
        channel: Channel,
        raw: &DVector<f64>,
    ) -> Result<DVector<f64>, EstimatorError> {
        let idx = channel.index();
        match self.filters[idx].update(raw, channel.name()) {
            Ok(y) => Ok(y.clone()),
            Err(e) => {
                self.rejected[idx] += 1;
                warn!("{} sample rejected, holding previous output: {}", channel, e);
                Err(e)
            }
        }
    }

    pub fn output(&self, channel: Channel) -> &DVector<f64> {
        self.filters[channel.index()].output()
    }

    pub fn filter_for(&self, channel: Channel) -> &LowPassFilter {
        &self.filters[channel.index()]
    }

    /// Number of samples rejected so far on `channel`.
    pub fn rejected_count(&self, channel: Channel) -> usize {
        self.rejected[channel.index()]
    }

    pub fn reset(&mut self) {
        for f in self.filters.iter_mut() {
            f.reset();
        }
        self.rejected = [0; 6];
    }
}
