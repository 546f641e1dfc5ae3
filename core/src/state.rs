//! Filter state: an SE_K(3) element plus IMU biases, stored as a fixed-capacity arena.
//!
//! Each configured contact frame owns one slot. A slot is either active (its contact point is
//! part of the group element) or empty. The covariance is held at full capacity in the order
//!
//! ```text
//! [ R | v | p | d_0 | d_1 | ... | d_{C-1} | bg | ba ]
//! ```
//!
//! with the rows and columns of empty slots kept at zero. [`InEKFState::covariance`] exposes the
//! compact view restricted to the active slots, whose dimension is `15 + 3 * active`.
use std::fmt::{self, Display};

use log::debug;
use nalgebra::{DMatrix, DVector, Matrix3, Rotation3, UnitQuaternion, Vector3};

use crate::errors::EstimatorError;
use crate::lie::{exp_sek3, orthonormalize};
use crate::noise::InitialCovariance;

/// Error-state indices of the base blocks.
pub const ROTATION_INDEX: usize = 0;
pub const VELOCITY_INDEX: usize = 3;
pub const POSITION_INDEX: usize = 6;
/// Dimension of the state without contacts
pub const BASE_DIMENSION: usize = 15;

/// Starting point handed to the filter (world frame, IMU origin).
#[derive(Clone, Debug, PartialEq)]
pub struct InitialState {
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
    pub velocity: Vector3<f64>,
    pub gyro_bias: Vector3<f64>,
    pub accel_bias: Vector3<f64>,
}

impl Default for InitialState {
    fn default() -> Self {
        InitialState {
            position: Vector3::zeros(),
            orientation: UnitQuaternion::identity(),
            velocity: Vector3::zeros(),
            gyro_bias: Vector3::zeros(),
            accel_bias: Vector3::zeros(),
        }
    }
}

impl InitialState {
    pub fn new(
        position: Vector3<f64>,
        orientation: UnitQuaternion<f64>,
        velocity: Vector3<f64>,
        gyro_bias: Vector3<f64>,
        accel_bias: Vector3<f64>,
    ) -> Self {
        InitialState {
            position,
            orientation,
            velocity,
            gyro_bias,
            accel_bias,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InEKFState {
    rotation: Rotation3<f64>,
    velocity: Vector3<f64>,
    position: Vector3<f64>,
    gyro_bias: Vector3<f64>,
    accel_bias: Vector3<f64>,
    contacts: Vec<Option<Vector3<f64>>>,
    covariance: DMatrix<f64>,
}

impl Display for InEKFState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (roll, pitch, yaw) = self.rotation.euler_angles();
        f.debug_struct("InEKFState")
            .field("rpy", &(roll, pitch, yaw))
            .field("velocity", &self.velocity.as_slice())
            .field("position", &self.position.as_slice())
            .field("gyro_bias", &self.gyro_bias.as_slice())
            .field("accel_bias", &self.accel_bias.as_slice())
            .field("active_contacts", &self.active_contacts())
            .finish()
    }
}

impl InEKFState {
    /// Identity element with zero covariance and `capacity` empty contact slots.
    pub fn identity(capacity: usize) -> Self {
        InEKFState {
            rotation: Rotation3::identity(),
            velocity: Vector3::zeros(),
            position: Vector3::zeros(),
            gyro_bias: Vector3::zeros(),
            accel_bias: Vector3::zeros(),
            contacts: vec![None; capacity],
            covariance: DMatrix::zeros(BASE_DIMENSION + 3 * capacity, BASE_DIMENSION + 3 * capacity),
        }
    }

    /// State at `initial` with the base covariance `prior` and no tracked contacts.
    pub fn from_initial(initial: &InitialState, prior: &InitialCovariance, capacity: usize) -> Self {
        let mut state = InEKFState::identity(capacity);
        state.rotation = initial.orientation.to_rotation_matrix();
        state.velocity = initial.velocity;
        state.position = initial.position;
        state.gyro_bias = initial.gyro_bias;
        state.accel_bias = initial.accel_bias;
        // The compact view has no contacts yet, so the prior maps onto it directly
        let base = prior.to_matrix();
        state.scatter(&base);
        state
    }

    pub fn rotation(&self) -> &Rotation3<f64> {
        &self.rotation
    }

    pub fn velocity(&self) -> &Vector3<f64> {
        &self.velocity
    }

    pub fn position(&self) -> &Vector3<f64> {
        &self.position
    }

    pub fn gyro_bias(&self) -> &Vector3<f64> {
        &self.gyro_bias
    }

    pub fn accel_bias(&self) -> &Vector3<f64> {
        &self.accel_bias
    }

    pub fn set_rotation(&mut self, rotation: Rotation3<f64>) {
        self.rotation = rotation;
    }

    pub fn set_velocity(&mut self, velocity: Vector3<f64>) {
        self.velocity = velocity;
    }

    pub fn set_position(&mut self, position: Vector3<f64>) {
        self.position = position;
    }

    pub fn set_gyro_bias(&mut self, bias: Vector3<f64>) {
        self.gyro_bias = bias;
    }

    pub fn set_accel_bias(&mut self, bias: Vector3<f64>) {
        self.accel_bias = bias;
    }

    /// Number of contact slots
    pub fn capacity(&self) -> usize {
        self.contacts.len()
    }

    pub fn contact(&self, slot: usize) -> Option<&Vector3<f64>> {
        self.contacts.get(slot).and_then(|c| c.as_ref())
    }

    pub fn is_tracked(&self, slot: usize) -> bool {
        self.contact(slot).is_some()
    }

    /// Active slots in ascending order.
    pub fn active_contacts(&self) -> Vec<usize> {
        self.contacts
            .iter()
            .enumerate()
            .filter_map(|(slot, c)| c.map(|_| slot))
            .collect()
    }

    /// Dimension of the Lie algebra of the current element.
    pub fn dimension(&self) -> usize {
        BASE_DIMENSION + 3 * self.contacts.iter().filter(|c| c.is_some()).count()
    }

    /// Full-arena index of a contact slot block.
    pub(crate) fn contact_index(&self, slot: usize) -> usize {
        9 + 3 * slot
    }

    pub(crate) fn gyro_bias_index(&self) -> usize {
        9 + 3 * self.capacity()
    }

    pub(crate) fn accel_bias_index(&self) -> usize {
        12 + 3 * self.capacity()
    }

    pub(crate) fn full_dimension(&self) -> usize {
        BASE_DIMENSION + 3 * self.capacity()
    }

    pub(crate) fn full_covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub(crate) fn set_full_covariance(&mut self, covariance: DMatrix<f64>) {
        debug_assert_eq!(covariance.shape(), self.covariance.shape());
        self.covariance = covariance;
    }

    /// Arena indices making up the compact view, in compact order.
    pub(crate) fn active_indices(&self) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..9).collect();
        for slot in self.active_contacts() {
            let base = self.contact_index(slot);
            idx.extend(base..base + 3);
        }
        let bg = self.gyro_bias_index();
        idx.extend(bg..bg + 6);
        idx
    }

    /// Covariance of the active error state, ordered `[R, v, p, d_active..., bg, ba]`.
    pub fn covariance(&self) -> DMatrix<f64> {
        let idx = self.active_indices();
        self.covariance.select_rows(idx.iter()).select_columns(idx.iter())
    }

    /// Overwrite the active covariance. The matrix must be `dimension() x dimension()`.
    pub fn set_covariance(&mut self, covariance: &DMatrix<f64>) -> Result<(), EstimatorError> {
        let n = self.dimension();
        if covariance.nrows() != n || covariance.ncols() != n {
            return Err(EstimatorError::DimensionMismatch {
                expected: n,
                found: covariance.nrows().max(covariance.ncols()),
            });
        }
        self.scatter(covariance);
        Ok(())
    }

    fn scatter(&mut self, compact: &DMatrix<f64>) {
        let idx = self.active_indices();
        for (i, &fi) in idx.iter().enumerate() {
            for (j, &fj) in idx.iter().enumerate() {
                self.covariance[(fi, fj)] = compact[(i, j)];
            }
        }
    }

    /// Start tracking `slot` at the world-frame point `estimate`.
    ///
    /// The new block is correlated with the rest of the state through the position error:
    /// `P ← F P Fᵀ + G N Gᵀ` where `F` copies the position rows into the contact rows and `N`
    /// (`covariance`, world frame) is the extra uncertainty of the kinematic offset.
    pub fn add_contact(
        &mut self,
        slot: usize,
        estimate: Vector3<f64>,
        covariance: &Matrix3<f64>,
    ) -> Result<(), EstimatorError> {
        if slot >= self.capacity() {
            return Err(EstimatorError::ContactNotTracked(slot));
        }
        if self.contacts[slot].is_some() {
            return Err(EstimatorError::ContactAlreadyTracked(slot));
        }
        let n = self.full_dimension();
        let ci = self.contact_index(slot);
        let mut f = DMatrix::<f64>::identity(n, n);
        for k in 0..3 {
            f[(ci + k, ci + k)] = 0.0;
            f[(ci + k, POSITION_INDEX + k)] = 1.0;
        }
        let mut p = &f * &self.covariance * f.transpose();
        for r in 0..3 {
            for c in 0..3 {
                p[(ci + r, ci + c)] += covariance[(r, c)];
            }
        }
        self.covariance = crate::linalg::symmetrize(&p);
        self.contacts[slot] = Some(estimate);
        debug!("contact slot {} added at {:?}", slot, estimate.as_slice());
        Ok(())
    }

    /// Stop tracking `slot`, marginalizing its block out of the covariance.
    pub fn remove_contact(&mut self, slot: usize) -> Result<(), EstimatorError> {
        if !self.is_tracked(slot) {
            return Err(EstimatorError::ContactNotTracked(slot));
        }
        let ci = self.contact_index(slot);
        self.covariance.rows_mut(ci, 3).fill(0.0);
        self.covariance.columns_mut(ci, 3).fill(0.0);
        self.contacts[slot] = None;
        debug!("contact slot {} removed", slot);
        Ok(())
    }

    /// Right-invariant retraction `X ← Exp(ξ) X`, `θ ← θ + δθ`.
    ///
    /// `delta` is a compact error vector (length `dimension()`).
    pub fn retract(&mut self, delta: &DVector<f64>) -> Result<(), EstimatorError> {
        let n = self.dimension();
        if delta.len() != n {
            return Err(EstimatorError::DimensionMismatch {
                expected: n,
                found: delta.len(),
            });
        }
        let group_dim = n - 6;
        let xi = delta.rows(0, group_dim).into_owned();
        let (d_rot, columns) = exp_sek3(&xi);
        self.rotation = orthonormalize(&(d_rot * self.rotation.matrix()));
        self.velocity = d_rot * self.velocity + columns[0];
        self.position = d_rot * self.position + columns[1];
        for (k, slot) in self.active_contacts().into_iter().enumerate() {
            if let Some(d) = self.contacts[slot].as_mut() {
                *d = d_rot * *d + columns[2 + k];
            }
        }
        self.gyro_bias += delta.fixed_rows::<3>(group_dim);
        self.accel_bias += delta.fixed_rows::<3>(group_dim + 3);
        Ok(())
    }
}
