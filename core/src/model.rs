//! Capability interfaces onto the rigid-body model.
//!
//! The estimator never parses a URDF or evaluates kinematics itself. It talks to whatever
//! library backs the robot model through two narrow traits:
//! - [`KinematicsProvider`]: pose, velocity and linear Jacobian of a named frame relative to the
//!   floating base, evaluated at given joint positions/velocities.
//! - [`DynamicsProvider`]: the joint-space inverse-dynamics torque of the legs for given base
//!   motion and joint accelerations, without contact forces. Only needed for the dynamic contact
//!   estimation mode.

use nalgebra::{DMatrix, DVector, Rotation3, Vector3};

/// Opaque handle of a frame, resolved once at construction from its name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameId(pub usize);

/// Kinematic quantities of one frame, all expressed in the base frame.
#[derive(Clone, Debug)]
pub struct FrameKinematics {
    /// Frame origin relative to the base
    pub position: Vector3<f64>,
    /// Frame orientation relative to the base
    pub rotation: Rotation3<f64>,
    /// Linear velocity of the frame origin relative to the base (J dq)
    pub velocity: Vector3<f64>,
    /// Linear Jacobian of the frame origin w.r.t. the joint positions (3 x nJ)
    pub jacobian: DMatrix<f64>,
}

impl FrameKinematics {
    /// A frame rigidly attached to the base.
    pub fn fixed(position: Vector3<f64>, rotation: Rotation3<f64>, num_joints: usize) -> Self {
        FrameKinematics {
            position,
            rotation,
            velocity: Vector3::zeros(),
            jacobian: DMatrix::zeros(3, num_joints),
        }
    }
}

/// Motion of the floating base consumed by the inverse dynamics, world frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct BaseMotion {
    pub rotation: Rotation3<f64>,
    pub linear_velocity: Vector3<f64>,
    pub angular_velocity: Vector3<f64>,
    pub linear_acceleration: Vector3<f64>,
    pub angular_acceleration: Vector3<f64>,
}

/// "Pose + Jacobian at a named frame"
pub trait KinematicsProvider {
    /// Number of actuated joints
    fn num_joints(&self) -> usize;
    /// Look up a frame by name. `None` is a configuration error for the caller.
    fn frame_id(&self, name: &str) -> Option<FrameId>;
    /// Evaluate the frame at the given joint positions and velocities.
    fn frame_kinematics(&self, frame: FrameId, q: &DVector<f64>, dq: &DVector<f64>)
    -> FrameKinematics;
}

/// "Joint-space inverse-dynamics residual"
pub trait DynamicsProvider {
    /// Torque the joints would need to produce the given motion with no contact forces:
    /// `τ_id = M(q) [a_base; ddq] + h(q, v)` restricted to the actuated joints.
    fn inverse_dynamics(
        &self,
        base: &BaseMotion,
        q: &DVector<f64>,
        dq: &DVector<f64>,
        ddq: &DVector<f64>,
    ) -> DVector<f64>;
}
