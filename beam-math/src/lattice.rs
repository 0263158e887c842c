//! Quadrupole-plus-drift lattice optics
//!
//! First-order (x, x') transfer matrices for a single quadrupole with
//! fringe-field correction followed by a drift, the lattice used for
//! profile-grid quadrupole scans. All geometry and field constants live in
//! an explicit [`LatticeConfig`] so alternate lattices can be modeled
//! without process-wide state.
//!
//! The two transverse planes compose the fringe-field matrix and its
//! flipped transpose on opposite sides of the quadrupole matrix. This
//! asymmetry reflects the opposite focusing sign of a quadrupole in the two
//! planes and must not be "simplified" into a symmetric form:
//!
//! - horizontal: `D * flip(F)^T * Q_h * F` (hyperbolic, defocusing)
//! - vertical:   `D * F * Q_v * flip(F)^T` (circular, focusing)

use nalgebra::Matrix2;

/// Below this value of `kappa * L` the quadrupole matrix is replaced by its
/// zero-strength limit, a pure drift of the quad length. Removes the
/// 1/kappa singularity at K'L = 0.
const THIN_QUAD_THRESHOLD: f64 = 1e-9;

/// Transverse plane selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    /// Horizontal (x, x'); the quadrupole defocuses here.
    Horizontal,
    /// Vertical (y, y'); the quadrupole focuses here.
    Vertical,
}

impl std::fmt::Display for Plane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Plane::Horizontal => write!(f, "horizontal"),
            Plane::Vertical => write!(f, "vertical"),
        }
    }
}

/// Geometry and field constants of the measurement lattice.
///
/// `Default` yields the GSI profile-grid setup the analysis was written
/// for; tests and other beamlines construct their own values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatticeConfig {
    /// Drift length from quadrupole exit to the profile grid (m).
    pub drift_length: f64,
    /// Geometric length of the quadrupole (m).
    pub quad_length: f64,
    /// Aperture radius of the quadrupole (m).
    pub quad_radius: f64,
    /// Fringe-field (edge focusing) normalization constant.
    pub fringe_norm: f64,
    /// Magnetic rigidity B*rho of the beam (T m).
    pub rigidity: f64,
    /// Pole-tip field of the quadrupole at the nominal working point (T).
    pub field: f64,
}

impl Default for LatticeConfig {
    fn default() -> Self {
        Self {
            drift_length: 2.216,
            quad_length: 1.0,
            quad_radius: 0.085,
            fringe_norm: 0.00092,
            rigidity: 8.151048,
            field: -0.23044572,
        }
    }
}

impl LatticeConfig {
    /// Integrated quadrupole strength K'L at the nominal working point,
    /// `B * L / R / (B rho)`.
    pub fn k_prime_l(&self) -> f64 {
        self.field * self.quad_length / self.quad_radius / self.rigidity
    }

    /// Focusing wavenumber `sqrt(|K'L| / L_quad)`.
    pub fn kappa(&self, k_prime_l: f64) -> f64 {
        (k_prime_l.abs() / self.quad_length).sqrt()
    }

    /// Fringe-field (edge focusing) correction matrix,
    /// `diag(1 - c*K'L/L, 1 + c*K'L/L)`.
    pub fn fringe_field(&self, k_prime_l: f64) -> Matrix2<f64> {
        let correction = self.fringe_norm * k_prime_l / self.quad_length;
        Matrix2::new(1.0 - correction, 0.0, 0.0, 1.0 + correction)
    }

    /// Quadrupole matrix in the horizontal (defocusing, hyperbolic) plane.
    pub fn quad_horizontal(&self, kappa: f64) -> Matrix2<f64> {
        let phase = kappa * self.quad_length;
        if phase < THIN_QUAD_THRESHOLD {
            return drift_matrix(self.quad_length);
        }
        Matrix2::new(
            phase.cosh(),
            phase.sinh() / kappa,
            kappa * phase.sinh(),
            phase.cosh(),
        )
    }

    /// Quadrupole matrix in the vertical (focusing, circular) plane.
    pub fn quad_vertical(&self, kappa: f64) -> Matrix2<f64> {
        let phase = kappa * self.quad_length;
        if phase < THIN_QUAD_THRESHOLD {
            return drift_matrix(self.quad_length);
        }
        Matrix2::new(
            phase.cos(),
            phase.sin() / kappa,
            -kappa * phase.sin(),
            phase.cos(),
        )
    }

    /// Full transfer matrix for one plane: fringe-corrected quadrupole at
    /// strength `k_prime_l` followed by a drift of `drift_length` meters.
    pub fn transfer(&self, plane: Plane, k_prime_l: f64, drift_length: f64) -> Matrix2<f64> {
        let fringe = self.fringe_field(k_prime_l);
        let kappa = self.kappa(k_prime_l);
        let drift = drift_matrix(drift_length);
        match plane {
            Plane::Horizontal => {
                drift * flipped_transpose(&fringe) * self.quad_horizontal(kappa) * fringe
            }
            Plane::Vertical => {
                drift * fringe * self.quad_vertical(kappa) * flipped_transpose(&fringe)
            }
        }
    }

    /// Transfer matrix at the configured reference drift length.
    pub fn reference_transfer(&self, plane: Plane, k_prime_l: f64) -> Matrix2<f64> {
        self.transfer(plane, k_prime_l, self.drift_length)
    }
}

/// Field-free drift matrix `[[1, length], [0, 1]]`.
pub fn drift_matrix(length: f64) -> Matrix2<f64> {
    Matrix2::new(1.0, length, 0.0, 1.0)
}

/// Reverse both axes of a 2x2 matrix, then transpose.
///
/// For the diagonal fringe matrix this swaps the two diagonal entries; kept
/// general so the composition reads exactly like the transport formula.
fn flipped_transpose(m: &Matrix2<f64>) -> Matrix2<f64> {
    Matrix2::new(m[(1, 1)], m[(1, 0)], m[(0, 1)], m[(0, 0)]).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_nominal_k_prime_l() {
        let lattice = LatticeConfig::default();
        assert_relative_eq!(lattice.k_prime_l(), -0.3326107412994082, max_relative = 1e-12);
    }

    #[test]
    fn test_kappa_uses_magnitude() {
        let lattice = LatticeConfig::default();
        assert_relative_eq!(lattice.kappa(0.81), 0.9, max_relative = 1e-12);
        assert_relative_eq!(lattice.kappa(-0.81), 0.9, max_relative = 1e-12);
    }

    #[test]
    fn test_drift_matrix_shape() {
        let d = drift_matrix(2.216);
        assert_eq!(d[(0, 0)], 1.0);
        assert_eq!(d[(0, 1)], 2.216);
        assert_eq!(d[(1, 0)], 0.0);
        assert_eq!(d[(1, 1)], 1.0);
    }

    #[test]
    fn test_quad_matrices_are_unimodular() {
        let lattice = LatticeConfig::default();
        let kappa = lattice.kappa(0.7);
        assert_relative_eq!(lattice.quad_horizontal(kappa).determinant(), 1.0, max_relative = 1e-12);
        assert_relative_eq!(lattice.quad_vertical(kappa).determinant(), 1.0, max_relative = 1e-12);
    }

    #[test]
    fn test_zero_strength_limit_is_a_drift() {
        let lattice = LatticeConfig::default();
        let q = lattice.quad_horizontal(lattice.kappa(0.0));
        assert_eq!(q, drift_matrix(lattice.quad_length));

        // The full transfer at K'L = 0 is two stacked drifts.
        let expected = drift_matrix(lattice.drift_length) * drift_matrix(lattice.quad_length);
        let transfer = lattice.reference_transfer(Plane::Horizontal, 0.0);
        for i in 0..2 {
            for j in 0..2 {
                assert_relative_eq!(transfer[(i, j)], expected[(i, j)], max_relative = 1e-12);
            }
        }
    }

    #[test]
    fn test_flipped_transpose_swaps_fringe_diagonal() {
        let lattice = LatticeConfig::default();
        let fringe = lattice.fringe_field(0.5);
        let flipped = flipped_transpose(&fringe);
        assert_eq!(flipped[(0, 0)], fringe[(1, 1)]);
        assert_eq!(flipped[(1, 1)], fringe[(0, 0)]);
        assert_eq!(flipped[(0, 1)], 0.0);
        assert_eq!(flipped[(1, 0)], 0.0);
    }

    #[test]
    fn test_plane_asymmetry_of_transfer_composition() {
        // The planes sandwich the fringe matrix in opposite order; with a
        // nonzero fringe correction the two compositions must differ even
        // after accounting for the cosh/cos difference.
        let lattice = LatticeConfig::default();
        let k = lattice.k_prime_l();
        let hor = lattice.reference_transfer(Plane::Horizontal, k);

        let fringe = lattice.fringe_field(k);
        let swapped = drift_matrix(lattice.drift_length)
            * fringe
            * lattice.quad_horizontal(lattice.kappa(k))
            * flipped_transpose(&fringe);
        assert!((hor - swapped).abs().max() > 0.0);
    }
}
