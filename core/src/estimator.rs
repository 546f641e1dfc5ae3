//! The per-tick estimation pipeline.
//!
//! One [`LeggedStateEstimator::update`] call per control tick runs, in this fixed order:
//!
//! 1. signal conditioning of the IMU and joint samples,
//! 2. contact classification of every leg, using kinematics evaluated at the pre-update state,
//! 3. InEKF propagation with the filtered IMU sample,
//! 4. InEKF correction with the legs in stance.
//!
//! Numerical failures inside a tick never abort the loop. They are logged, collected in
//! [`LeggedStateEstimator::diagnostics`], and the filter keeps its last valid state.
use std::fmt::{self, Debug};
use std::path::Path;

use log::{info, warn};
use nalgebra::{DVector, Matrix3, Matrix6, Rotation3, UnitQuaternion, Vector3};

use crate::contact::{ContactEstimate, ContactEstimator, ContactEvidence, ContactState};
use crate::errors::EstimatorError;
use crate::inekf::{ContactKind, GRAVITY, InEKF, LegKinematics};
use crate::lowpass::{Channel, SignalConditioner};
use crate::model::{BaseMotion, DynamicsProvider, FrameId, KinematicsProvider};
use crate::settings::Settings;
use crate::state::{InEKFState, InitialState};
use crate::{ImuMeasurement, JointMeasurement};

/// Output of one tick.
#[derive(Clone, Debug)]
pub struct EstimateSnapshot {
    /// Filter state (IMU frame in the world)
    pub state: InEKFState,
    /// Contact decision and evidence per leg
    pub contacts: Vec<ContactEstimate>,
}

impl EstimateSnapshot {
    pub fn contact_states(&self) -> Vec<ContactState> {
        self.contacts.iter().map(|c| c.state).collect()
    }
}

pub struct LeggedStateEstimator {
    settings: Settings,
    kinematics: Box<dyn KinematicsProvider>,
    dynamics: Option<Box<dyn DynamicsProvider>>,
    imu_frame: FrameId,
    contact_frames: Vec<FrameId>,
    conditioner: SignalConditioner,
    contact_estimator: ContactEstimator,
    filter: InEKF,
    snapshot: EstimateSnapshot,
    diagnostics: Vec<EstimatorError>,
    /// IMU pose in the base frame, refreshed every tick
    imu_offset: (Vector3<f64>, Rotation3<f64>),
    prev_joint_velocity: Option<DVector<f64>>,
    prev_angular_velocity_world: Option<Vector3<f64>>,
    angular_velocity_imu: Vector3<f64>,
    angular_acceleration_world: Vector3<f64>,
    linear_acceleration_world: Vector3<f64>,
}

impl Debug for LeggedStateEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeggedStateEstimator")
            .field("imu_frame", &self.settings.imu_frame)
            .field("contact_frames", &self.settings.contact_frames)
            .field("dt", &self.settings.dt)
            .field("dynamic", &self.settings.dynamic_contact_estimation)
            .field("state", &self.snapshot.state)
            .finish()
    }
}

fn to_vector3(v: &DVector<f64>) -> Vector3<f64> {
    Vector3::new(v[0], v[1], v[2])
}

fn to_dvector(v: &Vector3<f64>) -> DVector<f64> {
    DVector::from_column_slice(v.as_slice())
}

impl LeggedStateEstimator {
    /// Build the estimator and resolve every configured frame.
    ///
    /// # Arguments
    /// * `settings` - configuration, validated here
    /// * `kinematics` - rigid-body kinematics of the robot described by `settings.urdf_path`
    /// * `dynamics` - inverse dynamics, required when `dynamic_contact_estimation` is set. In
    ///   equilibrium mode it is optional and supplies the static gravity torque of the legs.
    ///
    /// # Returns
    /// A configuration error when the URDF file is missing, a frame name is unknown or the
    /// settings are inconsistent. The estimator starts at the origin, level and at rest.
    pub fn new(
        settings: Settings,
        kinematics: Box<dyn KinematicsProvider>,
        dynamics: Option<Box<dyn DynamicsProvider>>,
    ) -> Result<LeggedStateEstimator, EstimatorError> {
        settings.validate()?;
        if !Path::new(&settings.urdf_path).is_file() {
            return Err(EstimatorError::Configuration(format!(
                "URDF file not found: {}",
                settings.urdf_path
            )));
        }
        if settings.dynamic_contact_estimation && dynamics.is_none() {
            return Err(EstimatorError::Configuration(
                "dynamic contact estimation needs a dynamics provider".to_string(),
            ));
        }
        let resolve = |name: &str| {
            kinematics.frame_id(name).ok_or_else(|| {
                EstimatorError::Configuration(format!("unknown frame '{}' in {}", name, settings.urdf_path))
            })
        };
        let imu_frame = resolve(&settings.imu_frame)?;
        let contact_frames = settings
            .contact_frames
            .iter()
            .map(|name| resolve(name))
            .collect::<Result<Vec<_>, _>>()?;

        let num_joints = kinematics.num_joints();
        let conditioner =
            SignalConditioner::new(settings.cutoffs(), settings.dt, num_joints, settings.lpf_stages)?;
        let contact_estimator = ContactEstimator::new(
            settings.contact_estimator_settings.clone(),
            contact_frames.len(),
        )?;
        let state = InEKFState::from_initial(
            &InitialState::default(),
            &settings.noise_params.prior,
            contact_frames.len(),
        );
        let mut filter = InEKF::with_state(state.clone(), settings.noise_params.clone());
        filter.set_contact_kinds(settings.resolved_contact_kinds())?;
        filter.set_contact_removal_ticks(settings.contact_removal_ticks);

        info!(
            "legged state estimator: {} joints, contacts {:?}, dt = {} s, {} contact estimation",
            num_joints,
            settings.contact_frames,
            settings.dt,
            if settings.dynamic_contact_estimation {
                "dynamic"
            } else {
                "equilibrium"
            }
        );
        let snapshot = EstimateSnapshot {
            state,
            contacts: contact_estimator.estimates().to_vec(),
        };
        Ok(LeggedStateEstimator {
            settings,
            kinematics,
            dynamics,
            imu_frame,
            contact_frames,
            conditioner,
            contact_estimator,
            filter,
            snapshot,
            diagnostics: Vec::new(),
            imu_offset: (Vector3::zeros(), Rotation3::identity()),
            prev_joint_velocity: None,
            prev_angular_velocity_world: None,
            angular_velocity_imu: Vector3::zeros(),
            angular_acceleration_world: Vector3::zeros(),
            linear_acceleration_world: Vector3::zeros(),
        })
    }

    /// Build the estimator from a JSON, YAML or TOML settings file.
    pub fn from_settings_file<P: AsRef<Path>>(
        path: P,
        kinematics: Box<dyn KinematicsProvider>,
        dynamics: Option<Box<dyn DynamicsProvider>>,
    ) -> Result<LeggedStateEstimator, EstimatorError> {
        let settings = Settings::from_file(path)?;
        LeggedStateEstimator::new(settings, kinematics, dynamics)
    }

    /// Restart from `initial` with the prior covariance. Tracked contacts, contact
    /// classification and filter history are cleared.
    pub fn init(&mut self, initial: &InitialState) {
        let state = InEKFState::from_initial(
            initial,
            &self.settings.noise_params.prior,
            self.contact_frames.len(),
        );
        self.filter.set_state(state.clone());
        self.contact_estimator.reset();
        self.conditioner.reset();
        self.prev_joint_velocity = None;
        self.prev_angular_velocity_world = None;
        self.angular_velocity_imu = Vector3::zeros();
        self.angular_acceleration_world = Vector3::zeros();
        self.linear_acceleration_world = Vector3::zeros();
        self.diagnostics.clear();
        self.snapshot = EstimateSnapshot {
            state,
            contacts: self.contact_estimator.estimates().to_vec(),
        };
    }

    /// Run one tick.
    ///
    /// # Arguments
    /// * `imu` - raw IMU sample
    /// * `joints` - raw joint positions, velocities and torques of the same tick
    ///
    /// # Returns
    /// The estimate after this tick; the previous estimate if the tick was rejected.
    pub fn update(&mut self, imu: &ImuMeasurement, joints: &JointMeasurement) -> &EstimateSnapshot {
        self.diagnostics.clear();
        let num_joints = self.kinematics.num_joints();
        if let Err(e) = joints.check_dimension(num_joints) {
            warn!("joint sample rejected: {}", e);
            self.diagnostics.push(e);
            return &self.snapshot;
        }
        let dt = self.settings.dt;

        let gyro = to_vector3(&self.condition(Channel::Gyro, &to_dvector(&imu.gyro)));
        let accel = to_vector3(&self.condition(Channel::LinAccel, &to_dvector(&imu.accel)));
        let dq = self.condition(Channel::JointVelocity, &joints.dq);
        let ddq_raw = match &self.prev_joint_velocity {
            Some(prev) => (&dq - prev) / dt,
            None => DVector::zeros(num_joints),
        };
        self.prev_joint_velocity = Some(dq.clone());
        let ddq = self.condition(Channel::JointAcceleration, &ddq_raw);
        let tau = self.condition(Channel::JointTorque, &joints.tau);

        let (r_wi, v_wi, gyro_bias, accel_bias) = {
            let s = self.filter.state();
            (
                *s.rotation(),
                *s.velocity(),
                *s.gyro_bias(),
                *s.accel_bias(),
            )
        };
        let omega_world = r_wi * (gyro - gyro_bias);
        let gyro_accel_raw = match self.prev_angular_velocity_world {
            Some(prev) => (omega_world - prev) / dt,
            None => Vector3::zeros(),
        };
        self.prev_angular_velocity_world = Some(omega_world);
        let gyro_accel = to_vector3(&self.condition(Channel::GyroAccel, &to_dvector(&gyro_accel_raw)));

        let imu_kin = self
            .kinematics
            .frame_kinematics(self.imu_frame, &joints.q, &dq);
        let r_ib = imu_kin.rotation.inverse();
        let r_wb = r_wi * r_ib;
        self.imu_offset = (imu_kin.position, imu_kin.rotation);

        let inverse_dynamics = if self.settings.dynamic_contact_estimation {
            let lever = r_wb * imu_kin.position;
            let base = BaseMotion {
                rotation: r_wb,
                linear_velocity: v_wi - omega_world.cross(&lever),
                angular_velocity: omega_world,
                linear_acceleration: r_wi * (accel - accel_bias) + GRAVITY,
                angular_acceleration: gyro_accel,
            };
            self.inverse_dynamics(&base, &joints.q, &dq, &ddq)
        } else {
            None
        };
        // Gravity torque of the legs with the base held still, for equilibrium mode
        let static_torque = if self.settings.dynamic_contact_estimation {
            None
        } else {
            let at_rest = BaseMotion {
                rotation: r_wb,
                ..Default::default()
            };
            let zeros = DVector::zeros(num_joints);
            self.inverse_dynamics(&at_rest, &joints.q, &zeros, &zeros)
        };

        let rotation_noise = Matrix3::identity() * self.settings.contact_rotation_noise;
        let mut legs = Vec::with_capacity(self.contact_frames.len());
        for (leg, &frame) in self.contact_frames.iter().enumerate() {
            let foot = self.kinematics.frame_kinematics(frame, &joints.q, &dq);
            if foot.jacobian.shape() != (3, num_joints) {
                let e = EstimatorError::DimensionMismatch {
                    expected: num_joints,
                    found: foot.jacobian.ncols(),
                };
                warn!("leg {}: foot Jacobian rejected: {}", leg, e);
                self.diagnostics.push(e);
                continue;
            }
            let evidence = match &inverse_dynamics {
                Some(tau_id) => ContactEvidence::Dynamics {
                    jacobian: &foot.jacobian,
                    joint_torque: &tau,
                    inverse_dynamics: tau_id,
                },
                None => ContactEvidence::Equilibrium {
                    jacobian: &foot.jacobian,
                    joint_torque: &tau,
                    static_torque: static_torque.as_ref(),
                },
            };
            if let (_, Some(e)) = self.contact_estimator.estimate(leg, evidence, &r_wb) {
                self.diagnostics.push(e);
            }

            let position_variance = self.settings.contact_position_noise
                + self.contact_estimator.measurement_variance_inflation(leg);
            let mut covariance = Matrix6::zeros();
            covariance
                .fixed_view_mut::<3, 3>(0, 0)
                .copy_from(&rotation_noise);
            covariance
                .fixed_view_mut::<3, 3>(3, 3)
                .copy_from(&(Matrix3::identity() * position_variance));
            legs.push(LegKinematics::new(
                leg,
                r_ib * (foot.position - imu_kin.position),
                r_ib * foot.rotation,
                covariance,
            ));
        }
        let contact_states = self.contact_estimator.contact_states();

        let filtered = ImuMeasurement::new(gyro, accel);
        match self.filter.propagate(&filtered, dt) {
            Ok(()) => {
                if let Err(e) = self.filter.correct(&contact_states, &legs) {
                    self.diagnostics.push(e);
                }
            }
            Err(e) => self.diagnostics.push(e),
        }

        let state = self.filter.get_state();
        self.angular_velocity_imu = gyro - state.gyro_bias();
        self.angular_acceleration_world = gyro_accel;
        self.linear_acceleration_world = state.rotation() * (accel - state.accel_bias()) + GRAVITY;
        self.snapshot = EstimateSnapshot {
            state,
            contacts: self.contact_estimator.estimates().to_vec(),
        };
        &self.snapshot
    }

    fn condition(&mut self, channel: Channel, raw: &DVector<f64>) -> DVector<f64> {
        match self.conditioner.filter(channel, raw) {
            Ok(y) => y,
            Err(e) => {
                self.diagnostics.push(e);
                self.conditioner.output(channel).clone()
            }
        }
    }

    fn inverse_dynamics(
        &mut self,
        base: &BaseMotion,
        q: &DVector<f64>,
        dq: &DVector<f64>,
        ddq: &DVector<f64>,
    ) -> Option<DVector<f64>> {
        let dynamics = self.dynamics.as_ref()?;
        let tau_id = dynamics.inverse_dynamics(base, q, dq, ddq);
        if tau_id.len() != q.len() || tau_id.iter().any(|x| !x.is_finite()) {
            let e = if tau_id.len() != q.len() {
                EstimatorError::DimensionMismatch {
                    expected: q.len(),
                    found: tau_id.len(),
                }
            } else {
                EstimatorError::NonFiniteSample {
                    channel: "inverse_dynamics".to_string(),
                }
            };
            warn!("inverse dynamics rejected this tick: {}", e);
            self.diagnostics.push(e);
            return None;
        }
        Some(tau_id)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn filter(&self) -> &InEKF {
        &self.filter
    }

    pub fn contact_estimator(&self) -> &ContactEstimator {
        &self.contact_estimator
    }

    pub fn signal_conditioner(&self) -> &SignalConditioner {
        &self.conditioner
    }

    pub fn snapshot(&self) -> &EstimateSnapshot {
        &self.snapshot
    }

    /// Warnings and rejected operations of the last tick.
    pub fn diagnostics(&self) -> &[EstimatorError] {
        &self.diagnostics
    }

    pub fn contact_kinds(&self) -> &[ContactKind] {
        self.filter.contact_kinds()
    }

    pub fn contact_states(&self) -> Vec<ContactState> {
        self.snapshot.contact_states()
    }

    pub fn contact_estimates(&self) -> &[ContactEstimate] {
        &self.snapshot.contacts
    }

    pub fn imu_position(&self) -> &Vector3<f64> {
        self.snapshot.state.position()
    }

    pub fn imu_rotation(&self) -> &Rotation3<f64> {
        self.snapshot.state.rotation()
    }

    pub fn imu_linear_velocity_world(&self) -> &Vector3<f64> {
        self.snapshot.state.velocity()
    }

    /// Base orientation in the world.
    pub fn base_rotation(&self) -> Rotation3<f64> {
        self.snapshot.state.rotation() * self.imu_offset.1.inverse()
    }

    pub fn base_quaternion(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_rotation_matrix(&self.base_rotation())
    }

    /// Base origin in the world.
    pub fn base_position(&self) -> Vector3<f64> {
        self.snapshot.state.position() - self.base_rotation() * self.imu_offset.0
    }

    /// Bias-compensated filtered angular velocity in the base frame.
    pub fn base_angular_velocity_local(&self) -> Vector3<f64> {
        self.imu_offset.1 * self.angular_velocity_imu
    }

    pub fn base_angular_velocity_world(&self) -> Vector3<f64> {
        self.snapshot.state.rotation() * self.angular_velocity_imu
    }

    pub fn base_linear_velocity_world(&self) -> Vector3<f64> {
        let lever = self.base_rotation() * self.imu_offset.0;
        self.snapshot.state.velocity() - self.base_angular_velocity_world().cross(&lever)
    }

    pub fn base_linear_velocity_local(&self) -> Vector3<f64> {
        self.base_rotation().inverse() * self.base_linear_velocity_world()
    }

    /// Filtered angular acceleration in the world frame.
    pub fn angular_acceleration_world(&self) -> &Vector3<f64> {
        &self.angular_acceleration_world
    }

    /// Bias-compensated filtered linear acceleration of the IMU in the world frame.
    pub fn linear_acceleration_world(&self) -> &Vector3<f64> {
        &self.linear_acceleration_world
    }

    /// World position of the contact point of `leg`, while it is tracked.
    pub fn contact_position(&self, leg: usize) -> Option<&Vector3<f64>> {
        self.snapshot.state.contact(leg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{LinearLegModel, SampleGenerator, SampleNoise};
    use tempfile::NamedTempFile;

    fn settings(urdf: &NamedTempFile) -> Settings {
        let mut s = Settings::unitree_a1(urdf.path(), 0.002);
        s.contact_frames = LinearLegModel::FOOT_FRAMES.iter().map(|s| s.to_string()).collect();
        s.imu_frame = LinearLegModel::IMU_FRAME.to_string();
        s
    }

    fn estimator(urdf: &NamedTempFile) -> LeggedStateEstimator {
        LeggedStateEstimator::new(
            settings(urdf),
            Box::new(LinearLegModel::quadruped()),
            None,
        )
        .unwrap()
    }

    #[test]
    fn missing_urdf_is_fatal() {
        let mut s = Settings::unitree_a1("/definitely/not/here.urdf", 0.002);
        s.contact_frames = LinearLegModel::FOOT_FRAMES.iter().map(|s| s.to_string()).collect();
        s.imu_frame = LinearLegModel::IMU_FRAME.to_string();
        let err = LeggedStateEstimator::new(s, Box::new(LinearLegModel::quadruped()), None)
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn unknown_frame_is_fatal() {
        let urdf = NamedTempFile::new().unwrap();
        let mut s = settings(&urdf);
        s.contact_frames[1] = "no_such_foot".to_string();
        let err = LeggedStateEstimator::new(s, Box::new(LinearLegModel::quadruped()), None)
            .unwrap_err();
        match err {
            EstimatorError::Configuration(msg) => assert!(msg.contains("no_such_foot")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn dynamic_mode_needs_dynamics() {
        let urdf = NamedTempFile::new().unwrap();
        let mut s = settings(&urdf);
        s.dynamic_contact_estimation = true;
        assert!(
            LeggedStateEstimator::new(s.clone(), Box::new(LinearLegModel::quadruped()), None)
                .is_err()
        );
        assert!(
            LeggedStateEstimator::new(
                s,
                Box::new(LinearLegModel::quadruped()),
                Some(Box::new(LinearLegModel::quadruped()))
            )
            .is_ok()
        );
    }

    #[test]
    fn standing_robot_detects_all_stance_feet() {
        let urdf = NamedTempFile::new().unwrap();
        let mut est = estimator(&urdf);
        let mut generator = SampleGenerator::new(LinearLegModel::quadruped(), SampleNoise::none(), 7);
        for _ in 0..20 {
            let (imu, joints) = generator.next_sample();
            est.update(&imu, &joints);
            assert!(est.diagnostics().is_empty(), "{:?}", est.diagnostics());
        }
        assert_eq!(est.contact_states(), vec![ContactState::Stance; 4]);
        assert_eq!(est.filter().state().dimension(), 15 + 12);
        assert!(est.imu_linear_velocity_world().norm() < 1e-6);
    }

    #[test]
    fn lifted_leg_goes_to_swing() {
        let urdf = NamedTempFile::new().unwrap();
        let mut est = estimator(&urdf);
        let mut generator = SampleGenerator::new(LinearLegModel::quadruped(), SampleNoise::none(), 7);
        for _ in 0..10 {
            let (imu, joints) = generator.next_sample();
            est.update(&imu, &joints);
        }
        generator.set_foot_load(2, 0.0);
        for _ in 0..10 {
            let (imu, joints) = generator.next_sample();
            est.update(&imu, &joints);
        }
        let states = est.contact_states();
        assert_eq!(states[2], ContactState::Swing);
        assert_eq!(states[0], ContactState::Stance);
        assert!(est.contact_position(2).is_none());
        assert!(est.contact_position(0).is_some());
    }

    #[test]
    fn bad_joint_sample_keeps_previous_state() {
        let urdf = NamedTempFile::new().unwrap();
        let mut est = estimator(&urdf);
        let mut generator = SampleGenerator::new(LinearLegModel::quadruped(), SampleNoise::none(), 7);
        let (imu, joints) = generator.next_sample();
        est.update(&imu, &joints);
        let before = est.snapshot().state.clone();
        let short = JointMeasurement::zeros(3);
        est.update(&imu, &short);
        assert_eq!(est.snapshot().state, before);
        assert_eq!(
            est.diagnostics(),
            &[EstimatorError::DimensionMismatch {
                expected: 12,
                found: 3
            }]
        );
    }

    #[test]
    fn non_finite_gyro_is_held_and_reported() {
        let urdf = NamedTempFile::new().unwrap();
        let mut est = estimator(&urdf);
        let mut generator = SampleGenerator::new(LinearLegModel::quadruped(), SampleNoise::none(), 7);
        let (imu, joints) = generator.next_sample();
        est.update(&imu, &joints);
        let mut bad = imu;
        bad.gyro.x = f64::NAN;
        let snapshot = est.update(&bad, &joints);
        assert!(snapshot.state.rotation().matrix().iter().all(|x| x.is_finite()));
        assert!(matches!(
            est.diagnostics()[0],
            EstimatorError::NonFiniteSample { .. }
        ));
        assert_eq!(est.signal_conditioner().rejected_count(Channel::Gyro), 1);
    }

    #[test]
    fn init_resets_pose_and_contacts() {
        let urdf = NamedTempFile::new().unwrap();
        let mut est = estimator(&urdf);
        let mut generator = SampleGenerator::new(LinearLegModel::quadruped(), SampleNoise::none(), 7);
        for _ in 0..10 {
            let (imu, joints) = generator.next_sample();
            est.update(&imu, &joints);
        }
        let init = InitialState {
            position: Vector3::new(1.0, 2.0, 0.3),
            orientation: UnitQuaternion::from_euler_angles(0.0, 0.0, 0.5),
            ..Default::default()
        };
        est.init(&init);
        assert_eq!(est.imu_position(), &Vector3::new(1.0, 2.0, 0.3));
        assert!(est.filter().state().active_contacts().is_empty());
        assert_eq!(est.contact_states(), vec![ContactState::Uncertain; 4]);
        let (_, _, yaw) = est.base_rotation().euler_angles();
        assert!((yaw - 0.5).abs() < 1e-12);
    }

    #[test]
    fn base_pose_accounts_for_imu_offset() {
        let urdf = NamedTempFile::new().unwrap();
        let mut est = estimator(&urdf);
        let mut generator = SampleGenerator::new(LinearLegModel::quadruped(), SampleNoise::none(), 7);
        let (imu, joints) = generator.next_sample();
        est.update(&imu, &joints);
        let offset = LinearLegModel::quadruped().imu_position();
        assert!((est.base_position() - (est.imu_position() - offset)).norm() < 1e-9);
        assert!(est.base_linear_velocity_local().norm() < 1e-6);
    }

    /// Delegates to the quadruped model but reports rank-deficient foot Jacobians.
    struct FlatFootModel(LinearLegModel);

    impl KinematicsProvider for FlatFootModel {
        fn num_joints(&self) -> usize {
            self.0.num_joints()
        }

        fn frame_id(&self, name: &str) -> Option<FrameId> {
            self.0.frame_id(name)
        }

        fn frame_kinematics(
            &self,
            frame: FrameId,
            q: &DVector<f64>,
            dq: &DVector<f64>,
        ) -> crate::model::FrameKinematics {
            let mut kin = self.0.frame_kinematics(frame, q, dq);
            kin.jacobian.fill(0.0);
            kin
        }
    }

    #[test]
    fn singular_jacobian_is_reported_per_leg() {
        let urdf = NamedTempFile::new().unwrap();
        let mut est = LeggedStateEstimator::new(
            settings(&urdf),
            Box::new(FlatFootModel(LinearLegModel::quadruped())),
            None,
        )
        .unwrap();
        let mut generator = SampleGenerator::new(LinearLegModel::quadruped(), SampleNoise::none(), 7);
        let (imu, joints) = generator.next_sample();
        est.update(&imu, &joints);
        let expected: Vec<EstimatorError> = (0..4)
            .map(|leg| EstimatorError::SingularJacobian { leg })
            .collect();
        assert_eq!(est.diagnostics(), expected.as_slice());
        assert!(est.contact_estimates().iter().all(|c| c.normal_force == 0.0));
    }

    #[test]
    fn equilibrium_mode_removes_leg_weight() {
        let urdf = NamedTempFile::new().unwrap();
        let mut generator = SampleGenerator::new(LinearLegModel::quadruped(), SampleNoise::none(), 7);
        generator.set_foot_load(2, 0.0);
        let (imu, joints) = generator.next_sample();

        let mut without_model = estimator(&urdf);
        without_model.update(&imu, &joints);
        assert!(without_model.contact_estimates()[2].normal_force > 0.2);

        let mut with_model = LeggedStateEstimator::new(
            settings(&urdf),
            Box::new(LinearLegModel::quadruped()),
            Some(Box::new(LinearLegModel::quadruped())),
        )
        .unwrap();
        with_model.update(&imu, &joints);
        assert!(with_model.diagnostics().is_empty());
        let contacts = with_model.contact_estimates();
        assert!(contacts[2].normal_force.abs() < 1e-9);
        for leg in [0, 1, 3] {
            assert!((contacts[leg].normal_force - SampleGenerator::NOMINAL_FOOT_LOAD).abs() < 1e-9);
        }
    }

    #[test]
    fn settings_file_errors_surface_as_io() {
        let missing = LeggedStateEstimator::from_settings_file(
            "/definitely/not/here.yaml",
            Box::new(LinearLegModel::quadruped()),
            None,
        )
        .unwrap_err();
        assert!(matches!(missing, EstimatorError::Io(_)));
        assert!(missing.is_fatal());

        let urdf = NamedTempFile::new().unwrap();
        let file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        settings(&urdf).to_file(file.path()).unwrap();
        let est = LeggedStateEstimator::from_settings_file(
            file.path(),
            Box::new(LinearLegModel::quadruped()),
            None,
        );
        assert!(est.is_ok());
    }
}
