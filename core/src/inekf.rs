//! Right-invariant extended Kalman filter on SE_K(3) with IMU biases.
//!
//! The filter follows the contact-aided invariant EKF for legged robots: the IMU drives the
//! prediction, and every foot in stance contributes a kinematic measurement of its contact point
//! relative to the body. Contact points are tracked as extra columns of the group element and
//! enter and leave the state only at explicit add/remove events.
//!
//! # Propagation
//!
//! With bias-compensated inputs $\omega = \tilde\omega - b_g$ and $a = \tilde a - b_a$ held
//! constant over the step, the mean is integrated in closed form
//!
//! $$
//! \begin{aligned}
//! R^+ &= R\, \Gamma_0(\omega\Delta t) \\\\
//! v^+ &= v + (R\, \Gamma_1(\omega\Delta t)\, a + g) \Delta t \\\\
//! p^+ &= p + v \Delta t + (R\, \Gamma_2(\omega\Delta t)\, a + \tfrac{1}{2} g) \Delta t^2
//! \end{aligned}
//! $$
//!
//! and the covariance with $\Phi = I + A \Delta t$, $Q_d = \Phi\, \mathrm{Ad}_X Q_c\, \mathrm{Ad}_X^T
//! \Phi^T \Delta t$, where $A$ and $\mathrm{Ad}_X$ are evaluated at the current a posteriori
//! estimate.
//!
//! # Correction
//!
//! For a tracked contact $d$ observed by forward kinematics $d_k$ (body frame) the right-invariant
//! innovation is $z = \hat R d_k + \hat p - \hat d$ with the state-independent Jacobian
//! $H = [0 \; 0 \; -I \; \dots \; I \; \dots]$. All stance legs are stacked into one update
//! $X^+ = \mathrm{Exp}(K z)\, \hat X$ and the covariance is updated in Joseph form.
use log::{debug, warn};
use nalgebra::{DMatrix, DVector, Matrix3, Matrix6, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

use crate::ImuMeasurement;
use crate::contact::ContactState;
use crate::errors::EstimatorError;
use crate::lie::{adjoint_sek3, gamma_so3, log_so3, orthonormalize, skew};
use crate::linalg::{
    is_positive_semidefinite, min_symmetric_eigenvalue, robust_spd_solve, symmetrize,
};
use crate::noise::NoiseParams;
use crate::state::{InEKFState, POSITION_INDEX, ROTATION_INDEX, VELOCITY_INDEX};

/// Smallest accepted propagation step (s)
pub const DT_MIN: f64 = 1e-6;
/// Largest accepted propagation step (s)
pub const DT_MAX: f64 = 1.0;
/// World-frame gravity (z up)
pub const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, -9.81);
/// Relative tolerance of the post-update PSD check
const PSD_TOLERANCE: f64 = 1e-9;

/// Geometry of a contact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactKind {
    /// Only the contact position is constrained
    #[default]
    Point,
    /// Position and orientation of the foot are constrained (flat feet)
    Surface,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterStatus {
    Uninitialized,
    Ready,
}

/// Forward-kinematics measurement of one contact frame relative to the IMU.
#[derive(Clone, Debug, PartialEq)]
pub struct LegKinematics {
    /// Contact slot (index into the configured contact frames)
    pub slot: usize,
    /// Contact position in the IMU frame
    pub position: Vector3<f64>,
    /// Contact orientation in the IMU frame
    pub rotation: Rotation3<f64>,
    /// Covariance ordered `[rotation, position]`, IMU frame
    pub covariance: Matrix6<f64>,
}

impl LegKinematics {
    pub fn new(
        slot: usize,
        position: Vector3<f64>,
        rotation: Rotation3<f64>,
        covariance: Matrix6<f64>,
    ) -> Self {
        LegKinematics {
            slot,
            position,
            rotation,
            covariance,
        }
    }

    /// A position-only measurement with isotropic variances.
    pub fn point(slot: usize, position: Vector3<f64>, position_variance: f64) -> Self {
        let mut covariance = Matrix6::identity();
        covariance
            .fixed_view_mut::<3, 3>(3, 3)
            .copy_from(&(Matrix3::identity() * position_variance));
        LegKinematics {
            slot,
            position,
            rotation: Rotation3::identity(),
            covariance,
        }
    }

    pub fn position_covariance(&self) -> Matrix3<f64> {
        self.covariance.fixed_view::<3, 3>(3, 3).into_owned()
    }

    pub fn rotation_covariance(&self) -> Matrix3<f64> {
        self.covariance.fixed_view::<3, 3>(0, 0).into_owned()
    }

    fn is_finite(&self) -> bool {
        self.position.iter().all(|x| x.is_finite())
            && self.rotation.matrix().iter().all(|x| x.is_finite())
            && self.covariance.iter().all(|x| x.is_finite())
    }
}

#[derive(Clone, Debug)]
pub struct InEKF {
    state: InEKFState,
    noise: NoiseParams,
    status: FilterStatus,
    gravity: Vector3<f64>,
    contact_kinds: Vec<ContactKind>,
    /// World orientation of each surface contact recorded at touchdown
    surface_orientations: Vec<Option<Rotation3<f64>>>,
    /// Consecutive ticks each tracked slot has been out of stance
    ticks_out_of_stance: Vec<usize>,
    contact_removal_ticks: usize,
}

impl Default for InEKF {
    fn default() -> Self {
        InEKF::new()
    }
}

impl InEKF {
    /// Uninitialized filter; propagation and correction fail until a state is assigned.
    pub fn new() -> Self {
        InEKF {
            state: InEKFState::identity(0),
            noise: NoiseParams::default(),
            status: FilterStatus::Uninitialized,
            gravity: GRAVITY,
            contact_kinds: Vec::new(),
            surface_orientations: Vec::new(),
            ticks_out_of_stance: Vec::new(),
            contact_removal_ticks: 0,
        }
    }

    /// Filter that is ready at `state`. All contacts are point contacts.
    pub fn with_state(state: InEKFState, noise: NoiseParams) -> Self {
        let mut filter = InEKF::new();
        filter.noise = noise;
        filter.set_state(state);
        filter
    }

    /// Assign the state and move to READY. Per-slot bookkeeping is reset.
    pub fn set_state(&mut self, state: InEKFState) {
        let capacity = state.capacity();
        self.state = state;
        self.contact_kinds.resize(capacity, ContactKind::Point);
        self.surface_orientations = vec![None; capacity];
        self.ticks_out_of_stance = vec![0; capacity];
        self.status = FilterStatus::Ready;
    }

    pub fn set_noise_params(&mut self, noise: NoiseParams) {
        self.noise = noise;
    }

    pub fn set_contact_kinds(&mut self, kinds: Vec<ContactKind>) -> Result<(), EstimatorError> {
        if kinds.len() != self.state.capacity() {
            return Err(EstimatorError::DimensionMismatch {
                expected: self.state.capacity(),
                found: kinds.len(),
            });
        }
        self.contact_kinds = kinds;
        Ok(())
    }

    /// Ticks a tracked contact may spend out of stance before it is removed.
    pub fn set_contact_removal_ticks(&mut self, ticks: usize) {
        self.contact_removal_ticks = ticks;
    }

    pub fn status(&self) -> FilterStatus {
        self.status
    }

    pub fn noise_params(&self) -> &NoiseParams {
        &self.noise
    }

    pub fn contact_kinds(&self) -> &[ContactKind] {
        &self.contact_kinds
    }

    pub fn state(&self) -> &InEKFState {
        &self.state
    }

    /// Snapshot of the current state.
    pub fn get_state(&self) -> InEKFState {
        self.state.clone()
    }

    fn ensure_ready(&self) -> Result<(), EstimatorError> {
        match self.status {
            FilterStatus::Ready => Ok(()),
            FilterStatus::Uninitialized => Err(EstimatorError::NotInitialized),
        }
    }

    /// Predict the state `dt` seconds ahead from one IMU sample.
    ///
    /// # Arguments
    /// * `imu` - angular velocity (rad/s) and specific force (m/s²) in the IMU frame
    /// * `dt` - step in seconds, must lie in `(DT_MIN, DT_MAX)`
    pub fn propagate(&mut self, imu: &ImuMeasurement, dt: f64) -> Result<(), EstimatorError> {
        self.ensure_ready()?;
        if !(dt > DT_MIN && dt < DT_MAX) {
            warn!("InEKF: rejecting propagation with dt = {}", dt);
            return Err(EstimatorError::DegenerateTimeStep(dt));
        }
        if !imu.is_finite() {
            warn!("InEKF: rejecting non-finite IMU sample {}", imu);
            return Err(EstimatorError::NonFiniteSample {
                channel: "imu".to_string(),
            });
        }

        // Linearize at the a posteriori estimate, before the mean moves
        let (phi, qd) = self.discrete_error_dynamics(dt);
        let covariance = symmetrize(&(&phi * self.state.full_covariance() * phi.transpose() + qd));
        if covariance.iter().any(|x| !x.is_finite()) {
            warn!("InEKF: propagated covariance is not finite, keeping the previous state");
            return Err(EstimatorError::CovarianceNotPsd {
                min_eigenvalue: f64::NAN,
            });
        }

        let w = imu.gyro - self.state.gyro_bias();
        let a = imu.accel - self.state.accel_bias();
        let phi_w = w * dt;
        let r = *self.state.rotation().matrix();
        let v = *self.state.velocity();
        let p = *self.state.position();
        let g = self.gravity;

        let r_next = r * gamma_so3(&phi_w, 0);
        let v_next = v + (r * gamma_so3(&phi_w, 1) * a + g) * dt;
        let p_next = p + v * dt + (r * gamma_so3(&phi_w, 2) * a + 0.5 * g) * dt * dt;

        self.state.set_rotation(orthonormalize(&r_next));
        self.state.set_velocity(v_next);
        self.state.set_position(p_next);
        self.state.set_full_covariance(covariance);
        Ok(())
    }

    /// `Φ` and `Q_d` over the full contact arena.
    fn discrete_error_dynamics(&self, dt: f64) -> (DMatrix<f64>, DMatrix<f64>) {
        let s = &self.state;
        let n = s.full_dimension();
        let bg = s.gyro_bias_index();
        let ba = s.accel_bias_index();
        let r = s.rotation().matrix();
        let active = s.active_contacts();

        let mut a = DMatrix::<f64>::zeros(n, n);
        a.fixed_view_mut::<3, 3>(VELOCITY_INDEX, ROTATION_INDEX)
            .copy_from(&skew(&self.gravity));
        a.fixed_view_mut::<3, 3>(POSITION_INDEX, VELOCITY_INDEX)
            .copy_from(&Matrix3::identity());
        a.fixed_view_mut::<3, 3>(ROTATION_INDEX, bg).copy_from(&(-r));
        a.fixed_view_mut::<3, 3>(VELOCITY_INDEX, bg)
            .copy_from(&(-skew(s.velocity()) * r));
        a.fixed_view_mut::<3, 3>(POSITION_INDEX, bg)
            .copy_from(&(-skew(s.position()) * r));
        for &slot in &active {
            if let Some(d) = s.contact(slot) {
                a.fixed_view_mut::<3, 3>(s.contact_index(slot), bg)
                    .copy_from(&(-skew(d) * r));
            }
        }
        a.fixed_view_mut::<3, 3>(VELOCITY_INDEX, ba).copy_from(&(-r));
        let phi = DMatrix::<f64>::identity(n, n) + a * dt;

        // Empty slots carry a zero column, so their adjoint rows never see noise
        let mut columns = vec![*s.velocity(), *s.position()];
        columns.extend((0..s.capacity()).map(|slot| s.contact(slot).copied().unwrap_or_else(Vector3::zeros)));
        let mut adj = DMatrix::<f64>::identity(n, n);
        adj.view_mut((0, 0), (bg, bg))
            .copy_from(&adjoint_sek3(r, &columns));

        let mut qc = DMatrix::<f64>::zeros(n, n);
        qc.fixed_view_mut::<3, 3>(ROTATION_INDEX, ROTATION_INDEX)
            .copy_from(&self.noise.gyroscope_cov);
        qc.fixed_view_mut::<3, 3>(VELOCITY_INDEX, VELOCITY_INDEX)
            .copy_from(&self.noise.accelerometer_cov);
        for &slot in &active {
            let ci = s.contact_index(slot);
            qc.fixed_view_mut::<3, 3>(ci, ci)
                .copy_from(&self.noise.contact_cov);
        }
        qc.fixed_view_mut::<3, 3>(bg, bg)
            .copy_from(&self.noise.gyroscope_bias_cov);
        qc.fixed_view_mut::<3, 3>(ba, ba)
            .copy_from(&self.noise.accelerometer_bias_cov);

        let phi_adj = &phi * adj;
        let qd = &phi_adj * qc * phi_adj.transpose() * dt;
        (phi, qd)
    }

    /// Fuse the kinematics of every leg currently in stance.
    ///
    /// Slots entering stance untracked are added from their kinematics and take part in the
    /// correction from the next tick on. Tracked slots out of stance for more than the removal
    /// window are removed. A rejected update leaves state and covariance untouched.
    ///
    /// # Arguments
    /// * `contacts` - reported contact state per slot; missing entries count as not in stance
    /// * `kinematics` - forward kinematics of the contact frames, IMU frame
    pub fn correct(
        &mut self,
        contacts: &[ContactState],
        kinematics: &[LegKinematics],
    ) -> Result<(), EstimatorError> {
        self.ensure_ready()?;
        let capacity = self.state.capacity();
        for kin in kinematics {
            if kin.slot >= capacity {
                return Err(EstimatorError::ContactNotTracked(kin.slot));
            }
            if !kin.is_finite() {
                warn!("InEKF: rejecting non-finite kinematics of contact {}", kin.slot);
                return Err(EstimatorError::NonFiniteSample {
                    channel: format!("kinematics[{}]", kin.slot),
                });
            }
        }
        let in_stance = |slot: usize| contacts.get(slot).is_some_and(|c| c.is_stance());

        for slot in 0..capacity {
            if in_stance(slot) {
                self.ticks_out_of_stance[slot] = 0;
            } else if self.state.is_tracked(slot) {
                self.ticks_out_of_stance[slot] += 1;
                if self.ticks_out_of_stance[slot] > self.contact_removal_ticks {
                    self.state.remove_contact(slot)?;
                    self.surface_orientations[slot] = None;
                    self.ticks_out_of_stance[slot] = 0;
                }
            }
        }

        let mut added = vec![false; capacity];
        let mut measured: Vec<&LegKinematics> = Vec::new();
        for kin in kinematics {
            if !in_stance(kin.slot) || added[kin.slot] {
                continue;
            }
            if self.state.is_tracked(kin.slot) {
                measured.push(kin);
            } else {
                self.augment(kin)?;
                added[kin.slot] = true;
            }
        }
        if measured.is_empty() {
            return Ok(());
        }
        self.stacked_update(&measured)
    }

    fn augment(&mut self, kin: &LegKinematics) -> Result<(), EstimatorError> {
        let r = self.state.rotation();
        let estimate = self.state.position() + r * kin.position;
        let rm = r.matrix();
        let covariance = rm * kin.position_covariance() * rm.transpose();
        if self.contact_kinds[kin.slot] == ContactKind::Surface {
            self.surface_orientations[kin.slot] = Some(r * kin.rotation);
        }
        self.state.add_contact(kin.slot, estimate, &covariance)
    }

    fn rows_for(&self, slot: usize) -> usize {
        if self.surface_orientations[slot].is_some() {
            6
        } else {
            3
        }
    }

    fn stacked_update(&mut self, measured: &[&LegKinematics]) -> Result<(), EstimatorError> {
        let n = self.state.dimension();
        let active = self.state.active_contacts();
        let rows: usize = measured.iter().map(|k| self.rows_for(k.slot)).sum();
        let r_hat = *self.state.rotation().matrix();
        let p_hat = *self.state.position();

        let mut h = DMatrix::<f64>::zeros(rows, n);
        let mut z = DVector::<f64>::zeros(rows);
        let mut noise = DMatrix::<f64>::zeros(rows, rows);
        let mut row = 0;
        for kin in measured {
            let (Some(col), Some(d_hat)) = (
                active.iter().position(|&s| s == kin.slot),
                self.state.contact(kin.slot),
            ) else {
                return Err(EstimatorError::ContactNotTracked(kin.slot));
            };
            let ci = 9 + 3 * col;
            z.fixed_rows_mut::<3>(row)
                .copy_from(&(r_hat * kin.position + p_hat - d_hat));
            h.fixed_view_mut::<3, 3>(row, POSITION_INDEX)
                .copy_from(&(-Matrix3::identity()));
            h.fixed_view_mut::<3, 3>(row, ci)
                .copy_from(&Matrix3::identity());
            noise
                .fixed_view_mut::<3, 3>(row, row)
                .copy_from(&(r_hat * kin.position_covariance() * r_hat.transpose()));
            row += 3;

            if let Some(r_contact) = self.surface_orientations[kin.slot] {
                let residual = r_contact.matrix() * kin.rotation.matrix().transpose() * r_hat.transpose();
                z.fixed_rows_mut::<3>(row).copy_from(&log_so3(&residual));
                h.fixed_view_mut::<3, 3>(row, ROTATION_INDEX)
                    .copy_from(&Matrix3::identity());
                noise
                    .fixed_view_mut::<3, 3>(row, row)
                    .copy_from(&(r_hat * kin.rotation_covariance() * r_hat.transpose()));
                row += 3;
            }
        }

        let p = self.state.covariance();
        let hp = &h * &p;
        let s = &hp * h.transpose() + &noise;
        let Some(kt) = robust_spd_solve(&s, &hp) else {
            let min_eigenvalue = min_symmetric_eigenvalue(&s);
            warn!(
                "InEKF: singular innovation covariance (min eigenvalue {:e}), update rejected",
                min_eigenvalue
            );
            return Err(EstimatorError::CovarianceNotPsd { min_eigenvalue });
        };
        let k = kt.transpose();
        let delta = &k * &z;
        let ikh = DMatrix::<f64>::identity(n, n) - &k * &h;
        let p_next = symmetrize(&(&ikh * &p * ikh.transpose() + &k * &noise * k.transpose()));
        if !is_positive_semidefinite(&p_next, PSD_TOLERANCE) {
            let min_eigenvalue = min_symmetric_eigenvalue(&p_next);
            warn!(
                "InEKF: corrected covariance is not PSD (min eigenvalue {:e}), update rejected",
                min_eigenvalue
            );
            return Err(EstimatorError::CovarianceNotPsd { min_eigenvalue });
        }

        let mut next = self.state.clone();
        next.retract(&delta)?;
        next.set_covariance(&p_next)?;
        self.state = next;
        debug!(
            "InEKF: corrected with {} contact(s), |dx| = {:.3e}",
            measured.len(),
            delta.norm()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::InitialCovariance;
    use crate::state::InitialState;
    use nalgebra::UnitQuaternion;

    const FOOT: [f64; 3] = [0.2, 0.15, -0.3];

    fn ready_filter(capacity: usize) -> InEKF {
        let state = InEKFState::from_initial(
            &InitialState::default(),
            &InitialCovariance::default(),
            capacity,
        );
        InEKF::with_state(state, NoiseParams::default())
    }

    fn at_rest() -> ImuMeasurement {
        ImuMeasurement::new(Vector3::zeros(), Vector3::new(0.0, 0.0, 9.81))
    }

    fn foot() -> Vector3<f64> {
        Vector3::from_column_slice(&FOOT)
    }

    #[test]
    fn uninitialized_filter_refuses_work() {
        let mut filter = InEKF::new();
        assert_eq!(filter.status(), FilterStatus::Uninitialized);
        assert_eq!(
            filter.propagate(&at_rest(), 0.001),
            Err(EstimatorError::NotInitialized)
        );
        assert_eq!(filter.correct(&[], &[]), Err(EstimatorError::NotInitialized));
    }

    #[test]
    fn state_round_trip_is_exact() {
        let mut state = InEKFState::from_initial(
            &InitialState::new(
                Vector3::new(0.1, -0.2, 0.3),
                UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3),
                Vector3::new(1.0 / 3.0, 0.0, 0.0),
                Vector3::new(1e-3, 0.0, 0.0),
                Vector3::new(0.0, 2e-2, 0.0),
            ),
            &InitialCovariance::default(),
            4,
        );
        state
            .add_contact(1, Vector3::new(0.3, 0.1, 0.0), &Matrix3::identity())
            .unwrap();
        let filter = InEKF::with_state(state.clone(), NoiseParams::default());
        assert_eq!(filter.get_state(), state);
    }

    #[test]
    fn degenerate_dt_is_rejected() {
        let mut filter = ready_filter(2);
        let before = filter.get_state();
        for dt in [0.0, -0.001, 1e-7, 1.0, 5.0, f64::NAN] {
            match filter.propagate(&at_rest(), dt) {
                Err(EstimatorError::DegenerateTimeStep(_)) => {}
                other => panic!("dt = {} gave {:?}", dt, other),
            }
        }
        assert_eq!(filter.get_state(), before);
    }

    #[test]
    fn non_finite_imu_is_rejected() {
        let mut filter = ready_filter(2);
        let before = filter.get_state();
        let bad = ImuMeasurement::new(Vector3::new(f64::NAN, 0.0, 0.0), Vector3::zeros());
        assert!(matches!(
            filter.propagate(&bad, 0.001),
            Err(EstimatorError::NonFiniteSample { .. })
        ));
        assert_eq!(filter.get_state(), before);
    }

    #[test]
    fn propagation_composes_over_split_steps() {
        let init = InitialState::new(
            Vector3::new(0.5, 0.0, 0.3),
            UnitQuaternion::from_euler_angles(0.05, -0.1, 0.7),
            Vector3::new(0.2, -0.1, 0.05),
            Vector3::new(0.01, -0.02, 0.005),
            Vector3::new(0.05, 0.0, -0.03),
        );
        let state = InEKFState::from_initial(&init, &InitialCovariance::default(), 2);
        let mut once = InEKF::with_state(state.clone(), NoiseParams::default());
        let mut twice = InEKF::with_state(state, NoiseParams::default());
        let imu = ImuMeasurement::new(Vector3::new(0.3, -0.2, 0.5), Vector3::new(0.4, 0.2, 9.5));

        once.propagate(&imu, 0.01).unwrap();
        twice.propagate(&imu, 0.004).unwrap();
        twice.propagate(&imu, 0.006).unwrap();

        let (a, b) = (once.state(), twice.state());
        assert!((a.rotation().matrix() - b.rotation().matrix()).abs().max() < 1e-12);
        assert!((a.velocity() - b.velocity()).norm() < 1e-12);
        assert!((a.position() - b.position()).norm() < 1e-12);
    }

    #[test]
    fn resting_imu_keeps_state_still() {
        let mut filter = ready_filter(0);
        for _ in 0..1000 {
            filter.propagate(&at_rest(), 0.001).unwrap();
        }
        assert!(filter.state().velocity().norm() < 1e-9);
        assert!(filter.state().position().norm() < 1e-9);
    }

    #[test]
    fn propagation_grows_uncertainty_and_stays_psd() {
        let mut filter = ready_filter(2);
        filter
            .correct(
                &[ContactState::Stance, ContactState::Swing],
                &[LegKinematics::point(0, foot(), 1e-4)],
            )
            .unwrap();
        let before = filter.state().covariance();
        let imu = ImuMeasurement::new(Vector3::new(0.2, 0.1, -0.3), Vector3::new(0.3, 0.0, 9.9));
        for _ in 0..200 {
            filter.propagate(&imu, 0.002).unwrap();
            assert!(is_positive_semidefinite(&filter.state().covariance(), 1e-9));
        }
        let after = filter.state().covariance();
        assert!(after[(6, 6)] > before[(6, 6)]);
        assert!(after[(9, 9)] > before[(9, 9)]);
    }

    #[test]
    fn new_contact_is_added_but_not_corrected() {
        let mut filter = ready_filter(4);
        let before = filter.get_state();
        filter
            .correct(
                &[ContactState::Stance, ContactState::Uncertain],
                &[
                    LegKinematics::point(0, foot(), 1e-4),
                    LegKinematics::point(1, -foot(), 1e-4),
                ],
            )
            .unwrap();
        let after = filter.state();
        assert_eq!(after.dimension(), 18);
        assert_eq!(after.active_contacts(), vec![0]);
        assert_eq!(after.position(), before.position());
        assert_eq!(after.rotation(), before.rotation());
        assert!((after.contact(0).unwrap() - foot()).norm() < 1e-15);
    }

    #[test]
    fn unknown_slot_is_an_error() {
        let mut filter = ready_filter(2);
        assert_eq!(
            filter.correct(
                &[ContactState::Stance],
                &[LegKinematics::point(5, foot(), 1e-4)]
            ),
            Err(EstimatorError::ContactNotTracked(5))
        );
    }

    #[test]
    fn contact_removed_after_hysteresis() {
        let mut filter = ready_filter(1);
        filter.set_contact_removal_ticks(2);
        let kin = [LegKinematics::point(0, foot(), 1e-4)];
        filter.correct(&[ContactState::Stance], &kin).unwrap();
        assert!(filter.state().is_tracked(0));
        filter.correct(&[ContactState::Swing], &kin).unwrap();
        filter.correct(&[ContactState::Swing], &kin).unwrap();
        assert!(filter.state().is_tracked(0));
        filter.correct(&[ContactState::Swing], &kin).unwrap();
        assert!(!filter.state().is_tracked(0));
        assert_eq!(filter.state().dimension(), 15);
    }

    #[test]
    fn stance_velocity_error_converges() {
        let mut state = InEKFState::from_initial(
            &InitialState::default(),
            &InitialCovariance::default(),
            2,
        );
        state.set_velocity(Vector3::new(0.3, -0.2, 0.0));
        let mut noise = NoiseParams::default();
        noise.set_accelerometer_noise(0.01);
        noise.set_contact_noise(0.001);
        let mut filter = InEKF::with_state(state, noise);
        let stance = [ContactState::Stance, ContactState::Stance];
        let kin = [
            LegKinematics::point(0, foot(), 1e-4),
            LegKinematics::point(1, Vector3::new(-0.2, -0.15, -0.3), 1e-4),
        ];
        let initial_error = filter.state().velocity().norm();
        for _ in 0..1000 {
            filter.propagate(&at_rest(), 0.001).unwrap();
            filter.correct(&stance, &kin).unwrap();
            assert!(is_positive_semidefinite(&filter.state().covariance(), 1e-9));
        }
        let final_error = filter.state().velocity().norm();
        assert!(final_error < 0.1 * initial_error, "velocity error {}", final_error);
    }

    #[test]
    fn surface_contact_observes_orientation() {
        let mut filter = ready_filter(1);
        filter.set_contact_kinds(vec![ContactKind::Surface]).unwrap();
        let mut cov = Matrix6::identity() * 1e-4;
        cov.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(Matrix3::identity() * 1e-4));
        let touchdown = LegKinematics::new(0, foot(), Rotation3::identity(), cov);
        filter.correct(&[ContactState::Stance], &[touchdown]).unwrap();
        // The body has since yawed by 0.1 rad relative to the planted foot
        let yawed = LegKinematics::new(
            0,
            Rotation3::from_euler_angles(0.0, 0.0, -0.1) * foot(),
            Rotation3::from_euler_angles(0.0, 0.0, -0.1),
            cov,
        );
        for _ in 0..5 {
            filter.correct(&[ContactState::Stance], &[yawed.clone()]).unwrap();
        }
        let (_, _, yaw) = filter.state().rotation().euler_angles();
        assert!(yaw > 0.05, "yaw {}", yaw);
        assert!(yaw < 0.11, "yaw {}", yaw);
    }

    #[test]
    fn indefinite_update_is_rolled_back() {
        let mut state = InEKFState::from_initial(
            &InitialState::default(),
            &InitialCovariance::default(),
            1,
        );
        state.add_contact(0, foot(), &Matrix3::zeros()).unwrap();
        state
            .set_covariance(&(DMatrix::identity(18, 18) * -0.01))
            .unwrap();
        let mut filter = InEKF::with_state(state, NoiseParams::default());
        let before = filter.get_state();
        let result = filter.correct(
            &[ContactState::Stance],
            &[LegKinematics::point(0, foot() * 1.1, 1e-4)],
        );
        assert!(matches!(result, Err(EstimatorError::CovarianceNotPsd { .. })));
        assert_eq!(filter.get_state(), before);
    }
}
