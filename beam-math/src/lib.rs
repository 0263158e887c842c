//! beam-math - Numeric core for profile-grid beam analysis
//!
//! This crate provides the computational building blocks for extracting
//! transverse beam sizes from profile-grid measurements and solving for the
//! Twiss (Courant-Snyder) parameters of the beam:
//!
//! - **Peak fitting** - constrained line-plus-Gaussian fits of wire-grid
//!   intensity profiles
//! - **Lattice optics** - quadrupole, fringe-field and drift transfer
//!   matrices for both transverse planes
//! - **Twiss propagation** - second-order (sigma-matrix) transport of
//!   (beta, alpha, gamma) through a transfer matrix
//! - **Twiss solving** - overdetermined least-squares recovery of
//!   (beta, alpha, epsilon) from a quadrupole scan
//! - **Scan prediction** - beam size as a function of quadrupole strength
//!   or drift distance
//!
//! All operations are pure, synchronous computations over in-memory arrays;
//! file reading, user interaction and plotting live in the `twissfit` crate.

pub mod lattice;
pub mod peak_fit;
pub mod scan;
pub mod solver;
pub mod twiss;

// Re-export commonly used types
pub use lattice::{drift_matrix, LatticeConfig, Plane};
pub use peak_fit::{fit_profile, FitConfig, FitError, FitParameters, FitResult, FitSeed};
pub use scan::{predict_vs_distance, predict_vs_strength, DistanceScan, ScanError, StrengthScan};
pub use solver::{solve_both, solve_plane, Measurement, PlaneSolutions, SolveError, TwissSolution};
pub use twiss::{propagate, sigma_propagator, TwissError, TwissVector};
