//! Continuous-time noise model and initial covariance prior of the invariant filter.
use std::fmt::{self, Display};

use nalgebra::{DMatrix, Matrix3};
use serde::{Deserialize, Serialize};

use crate::errors::EstimatorError;

/// Process noise spectral densities (as 3x3 covariances) consumed by the propagation step.
///
/// The values are covariances, not standard deviations; the `set_*_noise` helpers take a
/// standard deviation and store `std² I`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseParams {
    pub gyroscope_cov: Matrix3<f64>,
    pub accelerometer_cov: Matrix3<f64>,
    pub gyroscope_bias_cov: Matrix3<f64>,
    pub accelerometer_bias_cov: Matrix3<f64>,
    /// Random walk of a tracked contact point while it is in stance (slip)
    pub contact_cov: Matrix3<f64>,
    pub prior: InitialCovariance,
}

impl Default for NoiseParams {
    fn default() -> Self {
        let mut params = NoiseParams {
            gyroscope_cov: Matrix3::zeros(),
            accelerometer_cov: Matrix3::zeros(),
            gyroscope_bias_cov: Matrix3::zeros(),
            accelerometer_bias_cov: Matrix3::zeros(),
            contact_cov: Matrix3::zeros(),
            prior: InitialCovariance::default(),
        };
        params.set_gyroscope_noise(0.01);
        params.set_accelerometer_noise(0.1);
        params.set_gyroscope_bias_noise(0.00001);
        params.set_accelerometer_bias_noise(0.0001);
        params.set_contact_noise(0.1);
        params
    }
}

impl Display for NoiseParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoiseParams")
            .field("gyroscope_cov", &self.gyroscope_cov.diagonal().as_slice())
            .field("accelerometer_cov", &self.accelerometer_cov.diagonal().as_slice())
            .field("gyroscope_bias_cov", &self.gyroscope_bias_cov.diagonal().as_slice())
            .field(
                "accelerometer_bias_cov",
                &self.accelerometer_bias_cov.diagonal().as_slice(),
            )
            .field("contact_cov", &self.contact_cov.diagonal().as_slice())
            .finish()
    }
}

fn isotropic(std: f64) -> Matrix3<f64> {
    Matrix3::identity() * std * std
}

impl NoiseParams {
    /// All densities zero, prior untouched. Useful for deterministic scenarios.
    pub fn noiseless() -> Self {
        NoiseParams {
            gyroscope_cov: Matrix3::zeros(),
            accelerometer_cov: Matrix3::zeros(),
            gyroscope_bias_cov: Matrix3::zeros(),
            accelerometer_bias_cov: Matrix3::zeros(),
            contact_cov: Matrix3::zeros(),
            prior: InitialCovariance::default(),
        }
    }

    pub fn set_gyroscope_noise(&mut self, std: f64) {
        self.gyroscope_cov = isotropic(std);
    }

    pub fn set_accelerometer_noise(&mut self, std: f64) {
        self.accelerometer_cov = isotropic(std);
    }

    pub fn set_gyroscope_bias_noise(&mut self, std: f64) {
        self.gyroscope_bias_cov = isotropic(std);
    }

    pub fn set_accelerometer_bias_noise(&mut self, std: f64) {
        self.accelerometer_bias_cov = isotropic(std);
    }

    pub fn set_contact_noise(&mut self, std: f64) {
        self.contact_cov = isotropic(std);
    }

    /// Every block must be a finite, symmetric PSD matrix.
    pub fn validate(&self) -> Result<(), EstimatorError> {
        let blocks = [
            ("gyroscope_cov", &self.gyroscope_cov),
            ("accelerometer_cov", &self.accelerometer_cov),
            ("gyroscope_bias_cov", &self.gyroscope_bias_cov),
            ("accelerometer_bias_cov", &self.accelerometer_bias_cov),
            ("contact_cov", &self.contact_cov),
            ("prior.orientation", &self.prior.orientation),
            ("prior.velocity", &self.prior.velocity),
            ("prior.position", &self.prior.position),
            ("prior.gyroscope_bias", &self.prior.gyroscope_bias),
            ("prior.accelerometer_bias", &self.prior.accelerometer_bias),
        ];
        for (name, block) in blocks {
            let dynamic = DMatrix::from_column_slice(3, 3, block.as_slice());
            if !crate::linalg::is_positive_semidefinite(&dynamic, 1e-12) {
                return Err(EstimatorError::Configuration(format!(
                    "noise block {} is not a symmetric positive semi-definite matrix",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Prior covariance of the base state, one 3x3 block per error component.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialCovariance {
    pub orientation: Matrix3<f64>,
    pub velocity: Matrix3<f64>,
    pub position: Matrix3<f64>,
    pub gyroscope_bias: Matrix3<f64>,
    pub accelerometer_bias: Matrix3<f64>,
}

impl Default for InitialCovariance {
    fn default() -> Self {
        InitialCovariance {
            orientation: isotropic(0.03),
            velocity: isotropic(0.1),
            position: isotropic(0.01),
            gyroscope_bias: isotropic(0.01),
            accelerometer_bias: isotropic(0.05),
        }
    }
}

impl InitialCovariance {
    /// The 15x15 base covariance ordered `[R, v, p, bg, ba]`.
    pub fn to_matrix(&self) -> DMatrix<f64> {
        let mut p = DMatrix::zeros(15, 15);
        let blocks = [
            &self.orientation,
            &self.velocity,
            &self.position,
            &self.gyroscope_bias,
            &self.accelerometer_bias,
        ];
        for (k, block) in blocks.into_iter().enumerate() {
            p.view_mut((3 * k, 3 * k), (3, 3)).copy_from(block);
        }
        p
    }
}
