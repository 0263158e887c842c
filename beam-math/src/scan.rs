//! Beam-size prediction curves from solved Twiss parameters
//!
//! Once (beta, alpha, epsilon) are known at the reference plane, the beam
//! size anywhere downstream follows from transporting beta and taking
//! `sigma = sqrt(beta * epsilon)`. Two sweeps are provided: sigma as a
//! function of quadrupole strength at the reference drift, and sigma as a
//! function of drift distance at a fixed strength.

use thiserror::Error;

use crate::lattice::LatticeConfig;
use crate::solver::{Measurement, TwissSolution};
use crate::twiss::{propagate, TwissError};

/// Number of samples in the strength sweep.
pub const STRENGTH_POINTS: usize = 200;

/// Lower edge of the strength sweep; a small positive floor keeps the sweep
/// away from the K'L = 0 singularity of kappa.
pub const STRENGTH_FLOOR: f64 = 1e-3;

/// Drift-distance grid: 0.1 m to 5.0 m in 0.1 m steps.
const DISTANCE_STEP: f64 = 0.1;
const DISTANCE_POINTS: usize = 50;

/// Errors from prediction sweeps.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    /// No measurements to derive the strength range from.
    #[error("cannot derive a strength range from an empty measurement set")]
    NoMeasurements,

    /// All supplied strengths are zero; the sweep range would be empty.
    #[error("all measurements have K'L = 0, strength range is empty")]
    ZeroStrengthRange,

    /// Transporting the solved Twiss parameters failed.
    #[error(transparent)]
    Propagation(#[from] TwissError),
}

/// Predicted sigma vs quadrupole strength, one value per plane per point.
#[derive(Debug, Clone, PartialEq)]
pub struct StrengthScan {
    /// Swept K'L values.
    pub k_prime_l: Vec<f64>,
    /// Predicted horizontal beam size at each strength.
    pub sigma_x: Vec<f64>,
    /// Predicted vertical beam size at each strength.
    pub sigma_y: Vec<f64>,
}

/// Predicted sigma vs drift distance at fixed quadrupole strength.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceScan {
    /// Swept drift lengths (m).
    pub distance: Vec<f64>,
    /// Predicted horizontal beam size at each distance.
    pub sigma_x: Vec<f64>,
    /// Predicted vertical beam size at each distance.
    pub sigma_y: Vec<f64>,
}

/// Beam size predicted by a solved Twiss triple after transport through the
/// lattice at strength `k_prime_l` and drift `drift_length`.
pub fn predicted_sigma(
    lattice: &LatticeConfig,
    solution: &TwissSolution,
    k_prime_l: f64,
    drift_length: f64,
) -> Result<f64, TwissError> {
    let transfer = lattice.transfer(solution.plane, k_prime_l, drift_length);
    let transported = propagate(solution.beta, solution.alpha, &transfer)?;
    Ok((transported.beta * solution.emittance).sqrt())
}

/// Sweep sigma vs K'L over 200 points from [`STRENGTH_FLOOR`] up to 1.1
/// times the largest strength magnitude in `measurements`, at the reference
/// drift length.
pub fn predict_vs_strength(
    lattice: &LatticeConfig,
    twiss_x: &TwissSolution,
    twiss_y: &TwissSolution,
    measurements: &[Measurement],
) -> Result<StrengthScan, ScanError> {
    if measurements.is_empty() {
        return Err(ScanError::NoMeasurements);
    }
    let max_strength = measurements
        .iter()
        .map(|m| m.k_prime_l.abs())
        .fold(0.0_f64, f64::max);
    if max_strength == 0.0 {
        return Err(ScanError::ZeroStrengthRange);
    }

    let top = 1.1 * max_strength;
    let step = (top - STRENGTH_FLOOR) / (STRENGTH_POINTS - 1) as f64;

    let mut scan = StrengthScan {
        k_prime_l: Vec::with_capacity(STRENGTH_POINTS),
        sigma_x: Vec::with_capacity(STRENGTH_POINTS),
        sigma_y: Vec::with_capacity(STRENGTH_POINTS),
    };
    for i in 0..STRENGTH_POINTS {
        let k = STRENGTH_FLOOR + step * i as f64;
        scan.k_prime_l.push(k);
        scan.sigma_x
            .push(predicted_sigma(lattice, twiss_x, k, lattice.drift_length)?);
        scan.sigma_y
            .push(predicted_sigma(lattice, twiss_y, k, lattice.drift_length)?);
    }
    Ok(scan)
}

/// Sweep sigma vs drift distance (0.1 m to 5.0 m in 0.1 m steps) at a fixed
/// quadrupole strength.
pub fn predict_vs_distance(
    lattice: &LatticeConfig,
    twiss_x: &TwissSolution,
    twiss_y: &TwissSolution,
    k_prime_l: f64,
) -> Result<DistanceScan, ScanError> {
    let mut scan = DistanceScan {
        distance: Vec::with_capacity(DISTANCE_POINTS),
        sigma_x: Vec::with_capacity(DISTANCE_POINTS),
        sigma_y: Vec::with_capacity(DISTANCE_POINTS),
    };
    for i in 0..DISTANCE_POINTS {
        let length = DISTANCE_STEP * (i + 1) as f64;
        scan.distance.push(length);
        scan.sigma_x
            .push(predicted_sigma(lattice, twiss_x, k_prime_l, length)?);
        scan.sigma_y
            .push(predicted_sigma(lattice, twiss_y, k_prime_l, length)?);
    }
    Ok(scan)
}
