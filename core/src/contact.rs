//! Per-leg contact classification.
//!
//! For each leg a ground-reaction force is recovered from the filtered joint torques through the
//! foot Jacobian,
//!
//! $$
//! f = -(J J^T)^{-1} J (\tau - \tau_{id})
//! $$
//!
//! where $\tau_{id}$ is the inverse-dynamics torque (dynamic mode) or the static leg torque
//! under gravity (quasi-static equilibrium mode, zero when no dynamics model is available). The world-frame normal component drives a logistic contact probability
//!
//! $$
//! p = \frac{1}{1 + e^{-\beta_1 f_n - \beta_0}}
//! $$
//!
//! which is classified with a hysteresis band and a debounce counter: a proposed transition is
//! only reported after it has been proposed for `debounce_ticks` consecutive ticks.

use std::fmt::{self, Display};

use log::{debug, warn};
use nalgebra::{DMatrix, DVector, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

use crate::errors::EstimatorError;
use crate::linalg::{min_symmetric_eigenvalue, robust_spd_solve};

/// Smallest eigenvalue of `J Jᵀ` (m²) accepted as a full-rank foot Jacobian.
const SINGULAR_JACOBIAN_EIGENVALUE: f64 = 1e-10;

/// Reported contact classification of one leg.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactState {
    /// Foot in the air
    Swing,
    /// Foot on the ground, usable as a kinematic measurement
    Stance,
    /// No decision yet
    #[default]
    Uncertain,
}

impl ContactState {
    pub fn is_stance(&self) -> bool {
        matches!(self, ContactState::Stance)
    }
}

impl Display for ContactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContactState::Swing => write!(f, "SWING"),
            ContactState::Stance => write!(f, "STANCE"),
            ContactState::Uncertain => write!(f, "UNCERTAIN"),
        }
    }
}

/// Tunable classification parameters. Vectors hold one entry per contact frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactEstimatorSettings {
    /// Logistic offset per leg
    pub beta0: Vec<f64>,
    /// Logistic slope per leg (1/N)
    pub beta1: Vec<f64>,
    /// Probability at or above which STANCE is proposed
    pub stance_probability_threshold: f64,
    /// Probability at or below which SWING is proposed
    pub swing_probability_threshold: f64,
    /// Consecutive ticks a proposal must persist before it is reported
    pub debounce_ticks: usize,
    /// Scale of the kinematic measurement variance added for low-probability stance legs
    pub contact_force_covariance_alpha: f64,
}

impl Default for ContactEstimatorSettings {
    fn default() -> Self {
        ContactEstimatorSettings {
            beta0: vec![-20.0; 4],
            beta1: vec![0.7; 4],
            stance_probability_threshold: 0.6,
            swing_probability_threshold: 0.4,
            debounce_ticks: 3,
            contact_force_covariance_alpha: 100.0,
        }
    }
}

impl ContactEstimatorSettings {
    pub fn validate(&self, num_legs: usize) -> Result<(), EstimatorError> {
        if self.beta0.len() != num_legs || self.beta1.len() != num_legs {
            return Err(EstimatorError::Configuration(format!(
                "contact estimator expects {} beta0/beta1 entries, got {}/{}",
                num_legs,
                self.beta0.len(),
                self.beta1.len()
            )));
        }
        let (lo, hi) = (
            self.swing_probability_threshold,
            self.stance_probability_threshold,
        );
        if !(0.0..=1.0).contains(&lo) || !(0.0..=1.0).contains(&hi) || lo > hi {
            return Err(EstimatorError::Configuration(format!(
                "contact thresholds must satisfy 0 <= swing ({}) <= stance ({}) <= 1",
                lo, hi
            )));
        }
        if self.contact_force_covariance_alpha < 0.0 {
            return Err(EstimatorError::Configuration(
                "contact_force_covariance_alpha must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Inputs to one leg's classification.
#[derive(Clone, Copy, Debug)]
pub enum ContactEvidence<'a> {
    /// Full dynamics: filtered torques minus the inverse-dynamics torque
    Dynamics {
        jacobian: &'a DMatrix<f64>,
        joint_torque: &'a DVector<f64>,
        inverse_dynamics: &'a DVector<f64>,
    },
    /// Quasi-static balance: filtered torques minus the static gravity torque of the legs, if known
    Equilibrium {
        jacobian: &'a DMatrix<f64>,
        joint_torque: &'a DVector<f64>,
        static_torque: Option<&'a DVector<f64>>,
    },
}

/// Latest evidence and decision of one leg.
#[derive(Clone, Copy, Debug, Default)]
pub struct ContactEstimate {
    pub state: ContactState,
    pub probability: f64,
    /// World-frame normal component of `force`
    pub normal_force: f64,
    /// Ground-reaction force estimate in the world frame
    pub force: Vector3<f64>,
}

#[derive(Clone, Copy, Debug, Default)]
struct Debouncer {
    pending: Option<ContactState>,
    count: usize,
}

#[derive(Clone, Debug)]
pub struct ContactEstimator {
    settings: ContactEstimatorSettings,
    estimates: Vec<ContactEstimate>,
    debouncers: Vec<Debouncer>,
}

impl ContactEstimator {
    pub fn new(
        settings: ContactEstimatorSettings,
        num_legs: usize,
    ) -> Result<ContactEstimator, EstimatorError> {
        settings.validate(num_legs)?;
        Ok(ContactEstimator {
            settings,
            estimates: vec![ContactEstimate::default(); num_legs],
            debouncers: vec![Debouncer::default(); num_legs],
        })
    }

    pub fn settings(&self) -> &ContactEstimatorSettings {
        &self.settings
    }

    pub fn num_legs(&self) -> usize {
        self.estimates.len()
    }

    /// Ground-reaction force in the base frame from a residual joint torque.
    ///
    /// Returns `None` when the foot Jacobian is rank deficient (e.g. a singular leg pose).
    pub fn force_from_torque(jacobian: &DMatrix<f64>, tau_residual: &DVector<f64>) -> Option<Vector3<f64>> {
        let jjt = jacobian * jacobian.transpose();
        if !(min_symmetric_eigenvalue(&jjt) > SINGULAR_JACOBIAN_EIGENVALUE) {
            return None;
        }
        let rhs = -(jacobian * tau_residual);
        let rhs = DMatrix::from_column_slice(3, 1, rhs.as_slice());
        let f = robust_spd_solve(&jjt, &rhs)?;
        let f = Vector3::new(f[0], f[1], f[2]);
        if f.iter().all(|v| v.is_finite()) {
            Some(f)
        } else {
            None
        }
    }

    /// Logistic contact probability of `leg` for a world-frame normal force.
    pub fn probability(&self, leg: usize, normal_force: f64) -> f64 {
        let z = self.settings.beta1[leg] * normal_force + self.settings.beta0[leg];
        1.0 / (1.0 + (-z).exp())
    }

    /// Classify one leg from torque evidence. `rotation` maps base to world.
    ///
    /// A singular foot Jacobian is recovered by classifying with zero force; the recovery is
    /// returned next to the state so the caller can report it.
    pub fn estimate(
        &mut self,
        leg: usize,
        evidence: ContactEvidence<'_>,
        rotation: &Rotation3<f64>,
    ) -> (ContactState, Option<EstimatorError>) {
        let (jacobian, residual) = match evidence {
            ContactEvidence::Dynamics {
                jacobian,
                joint_torque,
                inverse_dynamics,
            } => (jacobian, joint_torque - inverse_dynamics),
            ContactEvidence::Equilibrium {
                jacobian,
                joint_torque,
                static_torque: Some(tau_static),
            } => (jacobian, joint_torque - tau_static),
            ContactEvidence::Equilibrium {
                jacobian,
                joint_torque,
                static_torque: None,
            } => (jacobian, joint_torque.clone()),
        };
        let (force_base, recovery) = match Self::force_from_torque(jacobian, &residual) {
            Some(f) => (f, None),
            None => {
                let e = EstimatorError::SingularJacobian { leg };
                warn!("{}, classifying with zero force this tick", e);
                (Vector3::zeros(), Some(e))
            }
        };
        let force = rotation * force_base;
        (self.update_from_force(leg, force), recovery)
    }

    /// Classify one leg from an already estimated world-frame ground-reaction force.
    pub fn update_from_force(&mut self, leg: usize, force: Vector3<f64>) -> ContactState {
        let normal_force = force.z;
        let probability = self.probability(leg, normal_force);
        let estimate = &mut self.estimates[leg];
        estimate.force = force;
        estimate.normal_force = normal_force;
        estimate.probability = probability;
        self.classify(leg, probability)
    }

    /// Hysteresis band plus debounce on a contact probability.
    pub fn classify(&mut self, leg: usize, probability: f64) -> ContactState {
        let proposal = if probability >= self.settings.stance_probability_threshold {
            Some(ContactState::Stance)
        } else if probability <= self.settings.swing_probability_threshold {
            Some(ContactState::Swing)
        } else {
            None
        };
        let window = self.settings.debounce_ticks.max(1);
        let current = self.estimates[leg].state;
        let deb = &mut self.debouncers[leg];
        match proposal {
            Some(next) if next != current => {
                if deb.pending == Some(next) {
                    deb.count += 1;
                } else {
                    deb.pending = Some(next);
                    deb.count = 1;
                }
                if deb.count >= window {
                    debug!("leg {}: {} -> {} (p = {:.3})", leg, current, next, probability);
                    *deb = Debouncer::default();
                    self.estimates[leg].state = next;
                }
            }
            // Agreement with the reported state or inside the band: hold
            _ => *deb = Debouncer::default(),
        }
        self.estimates[leg].state
    }

    pub fn contact_state(&self, leg: usize) -> ContactState {
        self.estimates[leg].state
    }

    pub fn contact_states(&self) -> Vec<ContactState> {
        self.estimates.iter().map(|e| e.state).collect()
    }

    pub fn estimates(&self) -> &[ContactEstimate] {
        &self.estimates
    }

    /// Extra kinematic position variance for `leg`: `alpha (1 - p)^2`.
    pub fn measurement_variance_inflation(&self, leg: usize) -> f64 {
        let p = self.estimates[leg].probability;
        self.settings.contact_force_covariance_alpha * (1.0 - p).powi(2)
    }

    pub fn reset(&mut self) {
        for e in self.estimates.iter_mut() {
            *e = ContactEstimate::default();
        }
        for d in self.debouncers.iter_mut() {
            *d = Debouncer::default();
        }
    }
}
