//! Simulation utilities and CSV logging of estimates.
//!
//! This module provides:
//! - [`LinearLegModel`], a toy quadruped whose feet move linearly with the joint angles. It backs
//!   both model traits so the estimator can run without a rigid-body library.
//! - [`SampleGenerator`], a seeded source of noisy IMU and joint samples of a robot standing
//!   still with configurable per-foot loads.
//! - [`EstimateRecord`] / [`EstimateLog`] for writing estimator output to CSV and reading it back.
use std::io;
use std::path::Path;

use nalgebra::{DMatrix, DVector, Matrix3, Rotation3, Vector3};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::estimator::EstimateSnapshot;
use crate::model::{BaseMotion, DynamicsProvider, FrameId, FrameKinematics, KinematicsProvider};
use crate::{ImuMeasurement, JointMeasurement};

const JOINTS_PER_LEG: usize = 3;
const STANDARD_GRAVITY: f64 = 9.81;

/// A quadruped with three joints per leg and a constant foot Jacobian per leg.
///
/// Frame 0 is the IMU, frames 1..=4 are the feet in the order front-left, front-right,
/// rear-left, rear-right.
#[derive(Clone, Debug)]
pub struct LinearLegModel {
    frame_names: Vec<String>,
    imu_position: Vector3<f64>,
    imu_rotation: Rotation3<f64>,
    nominal_feet: Vec<Vector3<f64>>,
    leg_jacobians: Vec<Matrix3<f64>>,
    joint_inertia: f64,
    gravity_torque: DVector<f64>,
}

impl LinearLegModel {
    pub const IMU_FRAME: &'static str = "imu_link";
    pub const FOOT_FRAMES: [&'static str; 4] = ["FL_foot", "FR_foot", "RL_foot", "RR_foot"];

    /// Unitree A1 sized stand: feet 0.3 m below the base on a 0.36 m x 0.26 m rectangle.
    pub fn quadruped() -> Self {
        let nominal_feet = vec![
            Vector3::new(0.18, 0.13, -0.3),
            Vector3::new(0.18, -0.13, -0.3),
            Vector3::new(-0.18, 0.13, -0.3),
            Vector3::new(-0.18, -0.13, -0.3),
        ];
        let leg_jacobians = (0..4)
            .map(|leg| {
                let side = if leg % 2 == 0 { 1.0 } else { -1.0 };
                Matrix3::new(
                    0.0, -0.3, -0.15, //
                    0.3 * side, 0.0, 0.0, //
                    0.0, -0.05, -0.2,
                )
            })
            .collect();
        let mut frame_names = vec![Self::IMU_FRAME.to_string()];
        frame_names.extend(Self::FOOT_FRAMES.iter().map(|s| s.to_string()));
        LinearLegModel {
            frame_names,
            imu_position: Vector3::new(-0.012, -0.002, 0.015),
            imu_rotation: Rotation3::identity(),
            nominal_feet,
            leg_jacobians,
            joint_inertia: 0.01,
            gravity_torque: DVector::from_element(4 * JOINTS_PER_LEG, 0.1),
        }
    }

    /// Rename the IMU and foot frames.
    pub fn with_frames(mut self, imu: &str, feet: [&str; 4]) -> Self {
        self.frame_names = std::iter::once(imu)
            .chain(feet)
            .map(|s| s.to_string())
            .collect();
        self
    }

    pub fn num_legs(&self) -> usize {
        self.nominal_feet.len()
    }

    pub fn imu_position(&self) -> Vector3<f64> {
        self.imu_position
    }

    pub fn imu_rotation(&self) -> Rotation3<f64> {
        self.imu_rotation
    }

    pub fn nominal_foot(&self, leg: usize) -> Vector3<f64> {
        self.nominal_feet[leg]
    }

    /// Foot Jacobian of `leg` as a full 3 x nJ matrix.
    pub fn foot_jacobian(&self, leg: usize) -> DMatrix<f64> {
        let mut jacobian = DMatrix::zeros(3, self.num_joints());
        jacobian
            .fixed_view_mut::<3, 3>(0, JOINTS_PER_LEG * leg)
            .copy_from(&self.leg_jacobians[leg]);
        jacobian
    }

    fn leg_slice(v: &DVector<f64>, leg: usize) -> Vector3<f64> {
        let i = JOINTS_PER_LEG * leg;
        Vector3::new(v[i], v[i + 1], v[i + 2])
    }
}

impl KinematicsProvider for LinearLegModel {
    fn num_joints(&self) -> usize {
        JOINTS_PER_LEG * self.nominal_feet.len()
    }

    fn frame_id(&self, name: &str) -> Option<FrameId> {
        self.frame_names.iter().position(|n| n == name).map(FrameId)
    }

    fn frame_kinematics(&self, frame: FrameId, q: &DVector<f64>, dq: &DVector<f64>) -> FrameKinematics {
        match frame.0 {
            0 => FrameKinematics::fixed(self.imu_position, self.imu_rotation, self.num_joints()),
            f => {
                let leg = f - 1;
                let j = &self.leg_jacobians[leg];
                FrameKinematics {
                    position: self.nominal_feet[leg] + j * Self::leg_slice(q, leg),
                    rotation: Rotation3::identity(),
                    velocity: j * Self::leg_slice(dq, leg),
                    jacobian: self.foot_jacobian(leg),
                }
            }
        }
    }
}

impl DynamicsProvider for LinearLegModel {
    fn inverse_dynamics(
        &self,
        _base: &BaseMotion,
        _q: &DVector<f64>,
        _dq: &DVector<f64>,
        ddq: &DVector<f64>,
    ) -> DVector<f64> {
        ddq * self.joint_inertia + &self.gravity_torque
    }
}

/// Standard deviations of the noise added to generated samples.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SampleNoise {
    pub gyro: f64,
    pub accel: f64,
    pub joint_position: f64,
    pub joint_velocity: f64,
    pub joint_torque: f64,
}

impl SampleNoise {
    pub fn none() -> Self {
        SampleNoise {
            gyro: 0.0,
            accel: 0.0,
            joint_position: 0.0,
            joint_velocity: 0.0,
            joint_torque: 0.0,
        }
    }
}

impl Default for SampleNoise {
    fn default() -> Self {
        SampleNoise {
            gyro: 0.005,
            accel: 0.05,
            joint_position: 1e-4,
            joint_velocity: 0.01,
            joint_torque: 0.1,
        }
    }
}

/// Seeded source of samples for a [`LinearLegModel`] standing still.
#[derive(Debug)]
pub struct SampleGenerator {
    model: LinearLegModel,
    noise: SampleNoise,
    rng: StdRng,
    base_rotation: Rotation3<f64>,
    foot_loads: Vec<f64>,
    ticks: usize,
}

impl SampleGenerator {
    /// Weight of a 20 kg robot split evenly over the four feet.
    pub const NOMINAL_FOOT_LOAD: f64 = 20.0 * STANDARD_GRAVITY / 4.0;

    pub fn new(model: LinearLegModel, noise: SampleNoise, seed: u64) -> Self {
        let foot_loads = vec![Self::NOMINAL_FOOT_LOAD; model.num_legs()];
        SampleGenerator {
            model,
            noise,
            rng: StdRng::seed_from_u64(seed),
            base_rotation: Rotation3::identity(),
            foot_loads,
            ticks: 0,
        }
    }

    /// Stand on a slope: the base is held at `rotation` in the world.
    pub fn with_base_rotation(mut self, rotation: Rotation3<f64>) -> Self {
        self.base_rotation = rotation;
        self
    }

    /// Vertical ground-reaction force of `leg` in N. Zero lifts the foot.
    pub fn set_foot_load(&mut self, leg: usize, load: f64) {
        self.foot_loads[leg] = load;
    }

    pub fn model(&self) -> &LinearLegModel {
        &self.model
    }

    pub fn ticks(&self) -> usize {
        self.ticks
    }

    fn gaussian(&mut self, std: f64) -> f64 {
        if std <= 0.0 {
            return 0.0;
        }
        match Normal::new(0.0, std) {
            Ok(normal) => normal.sample(&mut self.rng),
            Err(_) => 0.0,
        }
    }

    fn noisy3(&mut self, v: Vector3<f64>, std: f64) -> Vector3<f64> {
        v + Vector3::new(self.gaussian(std), self.gaussian(std), self.gaussian(std))
    }

    fn noisy(&mut self, v: DVector<f64>, std: f64) -> DVector<f64> {
        v.map(|x| x + self.gaussian(std))
    }

    /// Produce the IMU and joint samples of the next tick.
    pub fn next_sample(&mut self) -> (ImuMeasurement, JointMeasurement) {
        let n = self.model.num_joints();
        let r_wi = self.base_rotation * self.model.imu_rotation();
        let specific_force = r_wi.inverse() * Vector3::new(0.0, 0.0, STANDARD_GRAVITY);

        let q = DVector::zeros(n);
        let dq = DVector::zeros(n);
        let mut tau = self
            .model
            .inverse_dynamics(&BaseMotion::default(), &q, &dq, &DVector::zeros(n));
        for leg in 0..self.model.num_legs() {
            let force_base =
                self.base_rotation.inverse() * Vector3::new(0.0, 0.0, self.foot_loads[leg]);
            tau -= self.model.foot_jacobian(leg).transpose() * force_base;
        }

        let gyro = self.noisy3(Vector3::zeros(), self.noise.gyro);
        let accel = self.noisy3(specific_force, self.noise.accel);
        let q = self.noisy(q, self.noise.joint_position);
        let dq = self.noisy(dq, self.noise.joint_velocity);
        let tau = self.noisy(tau, self.noise.joint_torque);
        self.ticks += 1;
        (
            ImuMeasurement::new(gyro, accel),
            JointMeasurement::new(q, dq, tau),
        )
    }
}

/// One row of an estimate log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimateRecord {
    /// Time since start (s)
    pub time: f64,
    pub px: f64,
    pub py: f64,
    pub pz: f64,
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
    /// Roll angle in radians
    pub roll: f64,
    /// Pitch angle in radians
    pub pitch: f64,
    /// Yaw angle in radians
    pub yaw: f64,
    pub bgx: f64,
    pub bgy: f64,
    pub bgz: f64,
    pub bax: f64,
    pub bay: f64,
    pub baz: f64,
    /// Number of tracked contact points
    pub contacts: usize,
    /// One character per leg: `1` stance, `0` swing, `?` uncertain
    pub stance: String,
}

impl EstimateRecord {
    pub fn from_snapshot(time: f64, snapshot: &EstimateSnapshot) -> Self {
        let s = &snapshot.state;
        let (roll, pitch, yaw) = s.rotation().euler_angles();
        let stance = snapshot
            .contacts
            .iter()
            .map(|c| match c.state {
                crate::ContactState::Stance => '1',
                crate::ContactState::Swing => '0',
                crate::ContactState::Uncertain => '?',
            })
            .collect();
        EstimateRecord {
            time,
            px: s.position()[0],
            py: s.position()[1],
            pz: s.position()[2],
            vx: s.velocity()[0],
            vy: s.velocity()[1],
            vz: s.velocity()[2],
            roll,
            pitch,
            yaw,
            bgx: s.gyro_bias()[0],
            bgy: s.gyro_bias()[1],
            bgz: s.gyro_bias()[2],
            bax: s.accel_bias()[0],
            bay: s.accel_bias()[1],
            baz: s.accel_bias()[2],
            contacts: s.active_contacts().len(),
            stance,
        }
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.px, self.py, self.pz)
    }

    pub fn velocity(&self) -> Vector3<f64> {
        Vector3::new(self.vx, self.vy, self.vz)
    }
}

/// Time series of estimates.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EstimateLog {
    pub records: Vec<EstimateRecord>,
}

impl EstimateLog {
    pub fn new() -> Self {
        EstimateLog::default()
    }

    pub fn push(&mut self, time: f64, snapshot: &EstimateSnapshot) {
        self.records.push(EstimateRecord::from_snapshot(time, snapshot));
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&EstimateRecord> {
        self.records.last()
    }

    /// Writes the log to a CSV file with a header row.
    ///
    /// # Arguments
    /// * `path` - Path where the CSV file will be saved
    ///
    /// # Returns
    /// * `io::Result<()>` - Ok if successful, Err otherwise
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in &self.records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads a log previously written with [`EstimateLog::to_csv`].
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: EstimateRecord = result?;
            records.push(record);
        }
        Ok(EstimateLog { records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::ContactEstimator;
    use crate::state::InEKFState;
    use crate::{ContactEstimate, ContactState};
    use assert_approx_eq::assert_approx_eq;
    use tempfile::NamedTempFile;

    #[test]
    fn frames_resolve_by_name() {
        let model = LinearLegModel::quadruped();
        assert_eq!(model.frame_id("imu_link"), Some(FrameId(0)));
        assert_eq!(model.frame_id("RR_foot"), Some(FrameId(4)));
        assert_eq!(model.frame_id("base"), None);
        let renamed = model.with_frames("trunk_imu", ["a", "b", "c", "d"]);
        assert_eq!(renamed.frame_id("c"), Some(FrameId(3)));
        assert_eq!(renamed.frame_id("FL_foot"), None);
    }

    #[test]
    fn foot_moves_with_its_own_leg_only() {
        let model = LinearLegModel::quadruped();
        let mut q = DVector::zeros(12);
        q[3] = 0.1;
        let dq = DVector::from_element(12, 1.0);
        let fl = model.frame_kinematics(FrameId(1), &q, &dq);
        let fr = model.frame_kinematics(FrameId(2), &q, &dq);
        assert_eq!(fl.position, model.nominal_foot(0));
        assert_approx_eq!(fr.position[1], -0.13 - 0.03, 1e-12);
        assert_eq!(fr.jacobian.shape(), (3, 12));
        assert_eq!(fr.jacobian.column(0).norm(), 0.0);
        assert!((fr.velocity - fr.jacobian * &dq).norm() < 1e-12);
    }

    #[test]
    fn generated_torques_encode_foot_loads() {
        let model = LinearLegModel::quadruped();
        let mut generator = SampleGenerator::new(model.clone(), SampleNoise::none(), 1);
        generator.set_foot_load(1, 0.0);
        let (imu, joints) = generator.next_sample();
        assert_eq!(imu.accel, Vector3::new(0.0, 0.0, STANDARD_GRAVITY));

        let tau_id = model.inverse_dynamics(
            &BaseMotion::default(),
            &joints.q,
            &joints.dq,
            &DVector::zeros(12),
        );
        let residual = &joints.tau - tau_id;
        let loaded = ContactEstimator::force_from_torque(&model.foot_jacobian(0), &residual).unwrap();
        let lifted = ContactEstimator::force_from_torque(&model.foot_jacobian(1), &residual).unwrap();
        assert!((loaded - Vector3::new(0.0, 0.0, SampleGenerator::NOMINAL_FOOT_LOAD)).norm() < 1e-9);
        assert!(lifted.norm() < 1e-9);
    }

    #[test]
    fn same_seed_same_samples() {
        let mut a = SampleGenerator::new(LinearLegModel::quadruped(), SampleNoise::default(), 42);
        let mut b = SampleGenerator::new(LinearLegModel::quadruped(), SampleNoise::default(), 42);
        for _ in 0..5 {
            assert_eq!(a.next_sample(), b.next_sample());
        }
        assert_eq!(a.ticks(), 5);
    }

    #[test]
    fn tilted_base_rotates_specific_force() {
        let tilt = Rotation3::from_euler_angles(0.1, 0.0, 0.0);
        let mut generator =
            SampleGenerator::new(LinearLegModel::quadruped(), SampleNoise::none(), 0)
                .with_base_rotation(tilt);
        let (imu, _) = generator.next_sample();
        assert!((tilt * imu.accel - Vector3::new(0.0, 0.0, STANDARD_GRAVITY)).norm() < 1e-12);
    }

    #[test]
    fn estimate_log_csv_round_trip() {
        let mut state = InEKFState::identity(4);
        state.set_position(Vector3::new(1.0, -2.0, 0.3));
        state.set_velocity(Vector3::new(0.1, 0.0, 0.0));
        let mut contacts = vec![ContactEstimate::default(); 4];
        contacts[0].state = ContactState::Stance;
        contacts[1].state = ContactState::Swing;
        let snapshot = EstimateSnapshot { state, contacts };

        let mut log = EstimateLog::new();
        log.push(0.0, &snapshot);
        log.push(0.002, &snapshot);
        let file = NamedTempFile::new().unwrap();
        log.to_csv(file.path()).unwrap();
        let read = EstimateLog::from_csv(file.path()).unwrap();
        assert_eq!(read.len(), 2);
        let last = read.last().unwrap();
        assert_approx_eq!(last.time, 0.002, 1e-15);
        assert_eq!(last.position(), Vector3::new(1.0, -2.0, 0.3));
        assert_eq!(last.stance, "10??");
        assert_eq!(last.contacts, 0);
    }

    #[test]
    fn missing_csv_is_an_error() {
        assert!(EstimateLog::from_csv("/definitely/not/here.csv").is_err());
    }
}
