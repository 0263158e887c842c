//! Twiss (Courant-Snyder) parameter propagation
//!
//! A 2x2 first-order transfer matrix `[[a, b], [c, d]]` induces a linear
//! map on the (beta, alpha, gamma) ellipse parameters of the beam. This is
//! the standard second-order (sigma-matrix) transform:
//!
//! ```text
//! | beta1  |   |  a^2   -2ab      b^2 | | beta0  |
//! | alpha1 | = | -ac    ad + bc  -bd  | | alpha0 |
//! | gamma1 |   |  c^2   -2cd      d^2 | | gamma0 |
//! ```
//!
//! with the invariant `gamma = (1 + alpha^2) / beta`.

use nalgebra::{Matrix2, Matrix3, Vector3};
use thiserror::Error;

/// Error when Twiss parameters are outside their physical domain.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("beta must be positive, got {beta:.6e}")]
pub struct TwissError {
    /// The rejected beta value.
    pub beta: f64,
}

/// Ellipse parameters of the beam phase-space distribution at one location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TwissVector {
    /// Beta function (m); always positive.
    pub beta: f64,
    /// Alpha (correlation) parameter.
    pub alpha: f64,
    /// Gamma parameter, `(1 + alpha^2) / beta`.
    pub gamma: f64,
}

impl TwissVector {
    /// Build a Twiss vector from beta and alpha, deriving gamma.
    ///
    /// # Errors
    ///
    /// Returns [`TwissError`] if `beta <= 0` or not finite.
    pub fn new(beta: f64, alpha: f64) -> Result<Self, TwissError> {
        if !(beta.is_finite() && beta > 0.0) {
            return Err(TwissError { beta });
        }
        Ok(Self {
            beta,
            alpha,
            gamma: (1.0 + alpha * alpha) / beta,
        })
    }
}

/// Expand a 2x2 transfer matrix into the 3x3 matrix acting on
/// `(beta, alpha, gamma)`.
pub fn sigma_propagator(transfer: &Matrix2<f64>) -> Matrix3<f64> {
    let (a, b) = (transfer[(0, 0)], transfer[(0, 1)]);
    let (c, d) = (transfer[(1, 0)], transfer[(1, 1)]);
    Matrix3::new(
        a * a,
        -2.0 * a * b,
        b * b,
        -a * c,
        a * d + b * c,
        -b * d,
        c * c,
        -2.0 * c * d,
        d * d,
    )
}

/// Transport `(beta0, alpha0)` through a transfer matrix.
///
/// # Errors
///
/// Returns [`TwissError`] if `beta0 <= 0`; the sigma-matrix transform is
/// meaningless for a non-positive beta.
pub fn propagate(
    beta0: f64,
    alpha0: f64,
    transfer: &Matrix2<f64>,
) -> Result<TwissVector, TwissError> {
    let input = TwissVector::new(beta0, alpha0)?;
    let output =
        sigma_propagator(transfer) * Vector3::new(input.beta, input.alpha, input.gamma);
    Ok(TwissVector {
        beta: output[0],
        alpha: output[1],
        gamma: output[2],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::{LatticeConfig, Plane};
    use approx::assert_relative_eq;

    #[test]
    fn test_identity_transfer_preserves_twiss() {
        let out = propagate(12.49, 7.075, &Matrix2::identity()).unwrap();
        assert_relative_eq!(out.beta, 12.49, max_relative = 1e-12);
        assert_relative_eq!(out.alpha, 7.075, max_relative = 1e-12);
        assert_relative_eq!(out.gamma, (1.0 + 7.075_f64.powi(2)) / 12.49, max_relative = 1e-12);
    }

    #[test]
    fn test_propagator_roundtrip_through_inverse() {
        let lattice = LatticeConfig::default();
        let transfer = lattice.reference_transfer(Plane::Vertical, 0.73);
        let inverse = transfer.try_inverse().unwrap();

        let roundtrip = sigma_propagator(&inverse) * sigma_propagator(&transfer);
        let identity = Matrix3::identity();
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(roundtrip[(i, j)], identity[(i, j)], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_gamma_invariant_preserved() {
        // beta * gamma - alpha^2 = 1 is invariant under symplectic
        // transport up to the (tiny) non-unimodularity of the fringe field.
        let lattice = LatticeConfig::default();
        let transfer = lattice.reference_transfer(Plane::Horizontal, lattice.k_prime_l());
        let out = propagate(12.49, 7.075, &transfer).unwrap();
        let det = transfer.determinant();
        assert_relative_eq!(
            out.beta * out.gamma - out.alpha * out.alpha,
            det * det,
            max_relative = 1e-9
        );
    }

    #[test]
    fn test_reference_transform_horizontal() {
        // Reference values computed with the original GSI constants at the
        // nominal quadrupole working point.
        let lattice = LatticeConfig::default();
        let transfer = lattice.reference_transfer(Plane::Horizontal, lattice.k_prime_l());
        let out = propagate(12.49, 7.075, &transfer).unwrap();
        assert_relative_eq!(out.beta, 1.240400877034375, max_relative = 1e-9);
        assert_relative_eq!(out.alpha, -0.8010125378228885, max_relative = 1e-9);
        assert_relative_eq!(out.gamma, 1.3234598117390872, max_relative = 1e-9);
    }

    #[test]
    fn test_reference_transform_vertical() {
        let lattice = LatticeConfig::default();
        let transfer = lattice.reference_transfer(Plane::Vertical, lattice.k_prime_l());
        let out = propagate(115.597, -26.909, &transfer).unwrap();
        assert_relative_eq!(out.beta, 73.02455770151336, max_relative = 1e-9);
        assert_relative_eq!(out.alpha, 10.92203454525434, max_relative = 1e-9);
        assert_relative_eq!(out.gamma, 1.6472655503764528, max_relative = 1e-9);
    }

    #[test]
    fn test_non_positive_beta_rejected() {
        let err = propagate(0.0, 1.0, &Matrix2::identity()).unwrap_err();
        assert_eq!(err, TwissError { beta: 0.0 });
        assert!(propagate(-3.0, 0.0, &Matrix2::identity()).is_err());
    }
}
