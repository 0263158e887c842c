//! Simulated quadrupole-scan data
//!
//! Forward-generates what the instrument would measure for a beam with
//! known Twiss parameters: per-strength beam sizes through the lattice
//! model, and synthetic wire-grid profiles with reproducible Gaussian
//! noise. Used by the `--simulate` driver mode and the integration tests.

use beam_math::scan::predicted_sigma;
use beam_math::solver::{Measurement, TwissSolution};
use beam_math::{FitParameters, LatticeConfig, TwissError};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::grid::{GridVariant, ProfileSample};

/// Evenly spaced wire positions for a grid variant, 1 mm pitch centered on
/// the beam axis.
pub fn wire_positions(variant: GridVariant) -> Array1<f64> {
    let n = variant.points();
    let half_span = (n as f64 - 1.0) / 2.0;
    Array1::from_iter((0..n).map(|i| i as f64 - half_span))
}

/// Noise-free measurements a quadrupole scan would produce for known
/// per-plane Twiss parameters.
///
/// The ground truth is expressed as a [`TwissSolution`] per plane (the same
/// type the solver outputs), so round-trip tests read naturally.
///
/// # Errors
///
/// Returns [`TwissError`] when a truth beta is non-positive; bad truth
/// parameters are rejected here rather than surfacing later as invalid
/// measurements.
pub fn simulated_scan(
    lattice: &LatticeConfig,
    truth_x: &TwissSolution,
    truth_y: &TwissSolution,
    strengths: &[f64],
) -> Result<Vec<Measurement>, TwissError> {
    strengths
        .iter()
        .map(|&k| {
            Ok(Measurement {
                k_prime_l: k,
                sigma_x: predicted_sigma(lattice, truth_x, k, lattice.drift_length)?,
                sigma_y: predicted_sigma(lattice, truth_y, k, lattice.drift_length)?,
            })
        })
        .collect()
}

/// Synthesize one wire-grid profile from model parameters plus seeded
/// Gaussian noise.
///
/// A zero `noise_sigma` yields the exact model values; the seed makes noisy
/// profiles reproducible across runs, which keeps tests deterministic.
pub fn synthetic_profile(
    parameters: &FitParameters,
    positions: &Array1<f64>,
    noise_sigma: f64,
    seed: u64,
) -> ProfileSample {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = if noise_sigma > 0.0 {
        Normal::new(0.0, noise_sigma).ok()
    } else {
        None
    };

    let intensities = positions.mapv(|x| {
        let jitter = noise.as_ref().map_or(0.0, |n| n.sample(&mut rng));
        parameters.evaluate(x) + jitter
    });
    ProfileSample {
        positions: positions.clone(),
        intensities,
    }
}
