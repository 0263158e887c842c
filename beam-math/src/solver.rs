//! Least-squares Twiss parameter recovery from a quadrupole scan
//!
//! Each measurement contributes one linear equation per plane. With the
//! transfer matrix row `[a^2, -2ab, b^2]` of the sigma-propagator (the row
//! that maps to the output beta) and the measured beam size sigma:
//!
//! ```text
//! [a^2, -2ab, b^2] . [beta*eps, alpha*eps, gamma*eps]^T = sigma^2
//! ```
//!
//! Stacking N >= 3 such equations gives an overdetermined system `A X = b`
//! solved by SVD least squares; more measurements average out fit noise.
//! The emittance follows from the Courant-Snyder invariant,
//! `eps = sqrt(X0 * X2 - X1^2)`, which also serves as the physical sanity
//! check: a degenerate or insufficiently varied scan yields a non-positive
//! radicand, not a fabricated emittance.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use crate::lattice::{LatticeConfig, Plane};
use crate::twiss::sigma_propagator;

/// Unknowns per plane: beta*eps, alpha*eps, gamma*eps.
pub const MIN_MEASUREMENTS: usize = 3;

/// Numerical rank cutoff for the SVD least-squares solve.
const SVD_EPSILON: f64 = 1e-12;

/// Errors from the Twiss solve.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolveError {
    /// Fewer measurements than unknowns.
    #[error("need at least {required} measurements, got {supplied}")]
    InsufficientMeasurements {
        /// Minimum number of measurements.
        required: usize,
        /// Number actually supplied.
        supplied: usize,
    },

    /// A measurement holds a non-finite K'L or a non-positive sigma.
    #[error("invalid measurement at index {index}: k'l={k_prime_l}, sigma={sigma}")]
    InvalidMeasurement {
        /// Index of the offending measurement.
        index: usize,
        /// Its quadrupole strength.
        k_prime_l: f64,
        /// Its beam size for the solved plane.
        sigma: f64,
    },

    /// The SVD least-squares solve failed.
    #[error("least-squares solve failed: {0}")]
    LeastSquaresFailed(String),

    /// The solution violates `beta*gamma - alpha^2 > 0`; the scan is
    /// degenerate (e.g. all measurements at the same K'L).
    #[error("non-physical solution for {plane} plane: emittance discriminant {discriminant:.6e}")]
    NonPhysicalSolution {
        /// Plane that failed.
        plane: Plane,
        /// The non-positive radicand `X0*X2 - X1^2`.
        discriminant: f64,
    },
}

/// One quadrupole-scan point: strength setting plus the fitted beam sizes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Integrated quadrupole strength K'L for this scan point.
    pub k_prime_l: f64,
    /// Fitted horizontal RMS beam size (mm).
    pub sigma_x: f64,
    /// Fitted vertical RMS beam size (mm).
    pub sigma_y: f64,
}

impl Measurement {
    fn sigma(&self, plane: Plane) -> f64 {
        match plane {
            Plane::Horizontal => self.sigma_x,
            Plane::Vertical => self.sigma_y,
        }
    }
}

/// Solved Twiss parameters for one plane at the reference location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TwissSolution {
    /// Plane this solution belongs to.
    pub plane: Plane,
    /// Beta function at the reference location.
    pub beta: f64,
    /// Alpha parameter.
    pub alpha: f64,
    /// Emittance; strictly positive.
    pub emittance: f64,
}

impl TwissSolution {
    /// Gamma parameter, `(1 + alpha^2) / beta`.
    pub fn gamma(&self) -> f64 {
        (1.0 + self.alpha * self.alpha) / self.beta
    }
}

/// Per-plane solve results.
///
/// The two planes are solved independently; one plane failing (degenerate
/// scan, bad fits) does not block the other.
#[derive(Debug, Clone)]
pub struct PlaneSolutions {
    /// Horizontal-plane outcome.
    pub horizontal: Result<TwissSolution, SolveError>,
    /// Vertical-plane outcome.
    pub vertical: Result<TwissSolution, SolveError>,
}

/// Solve one plane's Twiss parameters from a quadrupole scan.
///
/// # Errors
///
/// Returns [`SolveError`] when fewer than [`MIN_MEASUREMENTS`] scan points
/// are supplied, a measurement is malformed, the least-squares solve fails,
/// or the solution has a non-positive emittance discriminant.
pub fn solve_plane(
    lattice: &LatticeConfig,
    plane: Plane,
    measurements: &[Measurement],
) -> Result<TwissSolution, SolveError> {
    if measurements.len() < MIN_MEASUREMENTS {
        return Err(SolveError::InsufficientMeasurements {
            required: MIN_MEASUREMENTS,
            supplied: measurements.len(),
        });
    }
    for (index, m) in measurements.iter().enumerate() {
        let sigma = m.sigma(plane);
        if !m.k_prime_l.is_finite() || !sigma.is_finite() || sigma <= 0.0 {
            return Err(SolveError::InvalidMeasurement {
                index,
                k_prime_l: m.k_prime_l,
                sigma,
            });
        }
    }

    let n = measurements.len();
    let mut system = DMatrix::zeros(n, 3);
    let mut observed = DVector::zeros(n);
    for (row, m) in measurements.iter().enumerate() {
        let transfer = lattice.reference_transfer(plane, m.k_prime_l);
        let propagator = sigma_propagator(&transfer);
        // Only the row mapping to the output beta is constrained by a
        // beam-size measurement.
        for col in 0..3 {
            system[(row, col)] = propagator[(0, col)];
        }
        let sigma = m.sigma(plane);
        observed[row] = sigma * sigma;
    }

    let solution = system
        .svd(true, true)
        .solve(&observed, SVD_EPSILON)
        .map_err(|e| SolveError::LeastSquaresFailed(e.to_string()))?;

    let (beta_eps, alpha_eps, gamma_eps) = (solution[0], solution[1], solution[2]);
    log::debug!(
        "{plane} plane emittance-weighted products: beta*eps={beta_eps:.6e} alpha*eps={alpha_eps:.6e} gamma*eps={gamma_eps:.6e}"
    );

    let discriminant = beta_eps * gamma_eps - alpha_eps * alpha_eps;
    if !(discriminant.is_finite() && discriminant > 0.0) {
        return Err(SolveError::NonPhysicalSolution {
            plane,
            discriminant,
        });
    }

    let emittance = discriminant.sqrt();
    Ok(TwissSolution {
        plane,
        beta: beta_eps / emittance,
        alpha: alpha_eps / emittance,
        emittance,
    })
}

/// Solve both planes independently from the same scan.
pub fn solve_both(lattice: &LatticeConfig, measurements: &[Measurement]) -> PlaneSolutions {
    PlaneSolutions {
        horizontal: solve_plane(lattice, Plane::Horizontal, measurements),
        vertical: solve_plane(lattice, Plane::Vertical, measurements),
    }
}
