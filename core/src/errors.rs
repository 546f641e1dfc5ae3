//! Error taxonomy for the estimator.
//!
//! Configuration errors are fatal and only raised at construction. Numerical errors are raised
//! per tick by the component that detected them; the orchestrator logs them, keeps the last good
//! state and carries on.

use std::error::Error;
use std::fmt;

#[derive(Clone, Debug, PartialEq)]
pub enum EstimatorError {
    /// Bad settings, missing URDF file or an unknown frame name
    Configuration(String),
    /// Propagate/Correct called before any state was assigned
    NotInitialized,
    /// Time step outside the accepted `(DT_MIN, DT_MAX)` window
    DegenerateTimeStep(f64),
    /// NaN or Inf in an input sample
    NonFiniteSample { channel: String },
    /// Covariance failed the positive-semidefinite check after an update
    CovarianceNotPsd { min_eigenvalue: f64 },
    /// Vector or matrix of the wrong size handed to the estimator
    DimensionMismatch { expected: usize, found: usize },
    /// AddContact on a slot that is already active
    ContactAlreadyTracked(usize),
    /// RemoveContact (or a contact query) on a slot that is not active
    ContactNotTracked(usize),
    /// Foot Jacobian of a leg is rank deficient, the leg reported zero force
    SingularJacobian { leg: usize },
    /// Settings persistence failure
    Io(String),
}

impl EstimatorError {
    /// True for the errors that abort initialization rather than a single tick.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EstimatorError::Configuration(_) | EstimatorError::Io(_))
    }
}

impl fmt::Display for EstimatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EstimatorError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            EstimatorError::NotInitialized => {
                write!(f, "filter has no state yet, assign one before propagating")
            }
            EstimatorError::DegenerateTimeStep(dt) => {
                write!(f, "rejected time step dt = {} s", dt)
            }
            EstimatorError::NonFiniteSample { channel } => {
                write!(f, "non-finite sample on channel '{}'", channel)
            }
            EstimatorError::CovarianceNotPsd { min_eigenvalue } => write!(
                f,
                "covariance update rejected, minimum eigenvalue {:e}",
                min_eigenvalue
            ),
            EstimatorError::DimensionMismatch { expected, found } => {
                write!(f, "dimension mismatch: expected {}, found {}", expected, found)
            }
            EstimatorError::ContactAlreadyTracked(id) => {
                write!(f, "contact {} is already tracked", id)
            }
            EstimatorError::ContactNotTracked(id) => write!(f, "contact {} is not tracked", id),
            EstimatorError::SingularJacobian { leg } => {
                write!(f, "leg {}: foot Jacobian is singular, no contact force", leg)
            }
            EstimatorError::Io(msg) => write!(f, "settings I/O error: {}", msg),
        }
    }
}

impl Error for EstimatorError {}

impl From<std::io::Error> for EstimatorError {
    fn from(e: std::io::Error) -> Self {
        EstimatorError::Io(e.to_string())
    }
}
