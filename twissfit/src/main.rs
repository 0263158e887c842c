use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use beam_math::{
    fit_profile, predict_vs_distance, predict_vs_strength, solve_both, DistanceScan, FitConfig,
    FitResult, FitSeed, LatticeConfig, Measurement, Plane, StrengthScan, TwissSolution,
};
use clap::Parser;
use twissfit::grid::{k_prime_l_from_filename, read_profile_grid, GridVariant, ProfileSample};
use twissfit::sim::{simulated_scan, synthetic_profile, wire_positions};

/// Command line arguments for the profile-grid Twiss analysis
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Fit profile-grid measurements and solve Twiss parameters from a quadrupole scan"
)]
struct Args {
    /// Profile grid CSV export files, one per scan point
    files: Vec<PathBuf>,

    /// Explicit K'L value per file, in file order (overrides filename
    /// prefixes and the interactive prompt)
    #[arg(long = "k-prime-l", value_name = "K")]
    k_prime_l: Vec<f64>,

    /// Seed estimate for the profile sigma in mm
    #[arg(long, default_value_t = 20.0)]
    sigma_estimate: f64,

    /// Seed estimate for the Gaussian amplitude
    #[arg(long, default_value_t = 1000.0)]
    amplitude_estimate: f64,

    /// Fitting window half-width in mm (default: twice the sigma seed)
    #[arg(long)]
    cut_range: Option<f64>,

    /// Drift length from quadrupole to grid in meters
    #[arg(long, default_value_t = 2.216)]
    drift_length: f64,

    /// Generate and analyze N simulated scan points instead of reading files
    #[arg(long, value_name = "N")]
    simulate: Option<usize>,

    /// Intensity noise sigma for simulated profiles
    #[arg(long, default_value_t = 5.0)]
    noise: f64,

    /// RNG seed for simulated profiles
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Directory for CSV reports and prediction curves
    #[arg(long, default_value = "twissfit-out")]
    output_dir: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let lattice = LatticeConfig {
        drift_length: args.drift_length,
        ..LatticeConfig::default()
    };
    let fit_config = FitConfig {
        sigma_estimate: args.sigma_estimate,
        amplitude_estimate: args.amplitude_estimate,
        ..FitConfig::default()
    };
    let seed = FitSeed {
        cut_range: args.cut_range,
        ..FitSeed::default()
    };

    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating output directory {}", args.output_dir.display()))?;

    let measurements = if let Some(points) = args.simulate {
        simulate_measurements(&lattice, &fit_config, points, args.noise, args.seed)?
    } else {
        if args.files.is_empty() {
            bail!("no input files; pass profile grid exports or use --simulate");
        }
        process_files(&args, &fit_config, &seed)?
    };

    println!("\nResult matrix ({} measurements):", measurements.len());
    println!("{:>10} {:>12} {:>12}", "K'L", "sigma_x", "sigma_y");
    for m in &measurements {
        println!("{:>10.4} {:>12.4} {:>12.4}", m.k_prime_l, m.sigma_x, m.sigma_y);
    }
    write_measurements_csv(&args.output_dir.join("result_matrix.csv"), &measurements)?;

    if measurements.len() < beam_math::solver::MIN_MEASUREMENTS {
        log::warn!(
            "only {} measurements collected, need at least {} to solve for Twiss parameters",
            measurements.len(),
            beam_math::solver::MIN_MEASUREMENTS
        );
        return Ok(());
    }

    let solutions = solve_both(&lattice, &measurements);
    report_solution(&solutions.horizontal);
    report_solution(&solutions.vertical);

    // Prediction curves need both planes; each plane's report above stands
    // on its own if the other failed.
    if let (Ok(twiss_x), Ok(twiss_y)) = (&solutions.horizontal, &solutions.vertical) {
        let strength = predict_vs_strength(&lattice, twiss_x, twiss_y, &measurements)?;
        write_strength_scan_csv(&args.output_dir.join("sigma_vs_strength.csv"), &strength)?;

        let distance = predict_vs_distance(&lattice, twiss_x, twiss_y, lattice.k_prime_l())?;
        write_distance_scan_csv(&args.output_dir.join("sigma_vs_distance.csv"), &distance)?;

        println!(
            "\nPrediction curves written to {}",
            args.output_dir.display()
        );
    }

    Ok(())
}

fn report_solution(solution: &std::result::Result<TwissSolution, beam_math::SolveError>) {
    match solution {
        Ok(s) => println!(
            "{} plane: beta = {:.4}, alpha = {:.4}, emittance = {:.4e}",
            s.plane, s.beta, s.alpha, s.emittance
        ),
        Err(e) => log::warn!("plane solve failed: {e}"),
    }
}

/// Fit every input file; a file whose fit fails is logged and skipped so
/// the remaining scan points still reach the solver.
fn process_files(args: &Args, fit_config: &FitConfig, seed: &FitSeed) -> Result<Vec<Measurement>> {
    let mut measurements = Vec::with_capacity(args.files.len());
    for (index, path) in args.files.iter().enumerate() {
        let k_prime_l = strength_for_file(path, index, &args.k_prime_l)?;
        match process_file(path, k_prime_l, fit_config, seed, &args.output_dir) {
            Ok(measurement) => measurements.push(measurement),
            Err(e) => log::warn!("skipping {}: {e:#}", path.display()),
        }
    }
    Ok(measurements)
}

/// K'L lookup order: explicit --k-prime-l list, filename prefix,
/// interactive prompt.
fn strength_for_file(path: &Path, index: usize, explicit: &[f64]) -> Result<f64> {
    if let Some(&k) = explicit.get(index) {
        return Ok(k);
    }
    if let Some(k) = k_prime_l_from_filename(path) {
        log::info!("{}: K'L = {k} from filename prefix", path.display());
        return Ok(k);
    }
    prompt_for_strength(path)
}

fn prompt_for_strength(path: &Path) -> Result<f64> {
    print!("Enter K'L for {}: ", path.display());
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("reading K'L from stdin")?;
    line.trim()
        .parse::<f64>()
        .with_context(|| format!("invalid K'L value {:?}", line.trim()))
}

fn process_file(
    path: &Path,
    k_prime_l: f64,
    fit_config: &FitConfig,
    seed: &FitSeed,
    output_dir: &Path,
) -> Result<Measurement> {
    let data = read_profile_grid(path)?;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("profile");

    let horizontal = fit_plane(&data.horizontal, Plane::Horizontal, fit_config, seed, stem)?;
    let vertical = fit_plane(&data.vertical, Plane::Vertical, fit_config, seed, stem)?;

    write_profile_csv(
        &output_dir.join(format!("{stem}_horizontal.csv")),
        &data.horizontal,
        &horizontal,
    )?;
    write_profile_csv(
        &output_dir.join(format!("{stem}_vertical.csv")),
        &data.vertical,
        &vertical,
    )?;

    Ok(Measurement {
        k_prime_l,
        sigma_x: horizontal.parameters.sigma,
        sigma_y: vertical.parameters.sigma,
    })
}

fn fit_plane(
    sample: &ProfileSample,
    plane: Plane,
    fit_config: &FitConfig,
    seed: &FitSeed,
    stem: &str,
) -> Result<FitResult> {
    let result = fit_profile(
        sample.positions.view(),
        sample.intensities.view(),
        seed,
        fit_config,
    )
    .with_context(|| format!("{plane} fit of {stem}"))?;
    println!(
        "{stem} {plane}: mean = {:.3e} mm, sigma = {:.3e} mm, area = {:.3e}",
        result.parameters.mean, result.parameters.sigma, result.area
    );
    Ok(result)
}

/// Generate a simulated quadrupole scan, fit the synthetic profiles and
/// return the fitted measurements, printing the ground truth for
/// comparison.
fn simulate_measurements(
    lattice: &LatticeConfig,
    fit_config: &FitConfig,
    points: usize,
    noise: f64,
    rng_seed: u64,
) -> Result<Vec<Measurement>> {
    if points < beam_math::solver::MIN_MEASUREMENTS {
        bail!("--simulate needs at least {} points", beam_math::solver::MIN_MEASUREMENTS);
    }

    let truth_x = TwissSolution {
        plane: Plane::Horizontal,
        beta: 6.0,
        alpha: -1.2,
        emittance: 4.0,
    };
    let truth_y = TwissSolution {
        plane: Plane::Vertical,
        beta: 14.0,
        alpha: -2.0,
        emittance: 6.0,
    };
    println!(
        "simulating {points}-point scan from beta_x = {}, alpha_x = {}, eps_x = {}, beta_y = {}, alpha_y = {}, eps_y = {}",
        truth_x.beta, truth_x.alpha, truth_x.emittance, truth_y.beta, truth_y.alpha, truth_y.emittance
    );

    let strengths: Vec<f64> = (0..points)
        .map(|i| 0.2 + 1.2 * i as f64 / (points - 1) as f64)
        .collect();
    let ideal = simulated_scan(lattice, &truth_x, &truth_y, &strengths)
        .context("propagating simulation ground truth")?;

    let positions = wire_positions(GridVariant::Wires96);
    let seed = FitSeed {
        sigma: Some(10.0),
        ..FitSeed::default()
    };

    let mut measurements = Vec::with_capacity(points);
    for (i, ideal_point) in ideal.iter().enumerate() {
        let mut fitted = [0.0; 2];
        for (slot, (plane, sigma)) in [
            (Plane::Horizontal, ideal_point.sigma_x),
            (Plane::Vertical, ideal_point.sigma_y),
        ]
        .iter()
        .enumerate()
        {
            let parameters = beam_math::FitParameters {
                offset: 10.0,
                slope: 0.3,
                amplitude: 1200.0,
                mean: 2.0,
                sigma: *sigma,
            };
            let profile = synthetic_profile(&parameters, &positions, noise, rng_seed.wrapping_add((2 * i + slot) as u64));
            let result = fit_profile(
                profile.positions.view(),
                profile.intensities.view(),
                &seed,
                fit_config,
            )
            .with_context(|| format!("{plane} fit of simulated point {i}"))?;
            fitted[slot] = result.parameters.sigma;
        }
        measurements.push(Measurement {
            k_prime_l: ideal_point.k_prime_l,
            sigma_x: fitted[0],
            sigma_y: fitted[1],
        });
    }
    Ok(measurements)
}

fn write_measurements_csv(path: &Path, measurements: &[Measurement]) -> Result<()> {
    let mut writer = csv_writer(path)?;
    writeln!(writer, "k_prime_l,sigma_x_mm,sigma_y_mm")?;
    for m in measurements {
        writeln!(writer, "{},{},{}", m.k_prime_l, m.sigma_x, m.sigma_y)?;
    }
    Ok(())
}

/// Raw samples next to the fitted model so an external plotter can overlay
/// data and fit.
fn write_profile_csv(path: &Path, sample: &ProfileSample, fit: &FitResult) -> Result<()> {
    let mut writer = csv_writer(path)?;
    writeln!(writer, "position_mm,intensity,fitted")?;
    for (&x, &y) in sample.positions.iter().zip(sample.intensities.iter()) {
        writeln!(writer, "{x},{y},{}", fit.parameters.evaluate(x))?;
    }
    Ok(())
}

fn write_strength_scan_csv(path: &Path, scan: &StrengthScan) -> Result<()> {
    let mut writer = csv_writer(path)?;
    writeln!(writer, "k_prime_l,sigma_x_mm,sigma_y_mm")?;
    for i in 0..scan.k_prime_l.len() {
        writeln!(writer, "{},{},{}", scan.k_prime_l[i], scan.sigma_x[i], scan.sigma_y[i])?;
    }
    Ok(())
}

fn write_distance_scan_csv(path: &Path, scan: &DistanceScan) -> Result<()> {
    let mut writer = csv_writer(path)?;
    writeln!(writer, "distance_m,sigma_x_mm,sigma_y_mm")?;
    for i in 0..scan.distance.len() {
        writeln!(writer, "{},{},{}", scan.distance[i], scan.sigma_x[i], scan.sigma_y[i])?;
    }
    Ok(())
}

fn csv_writer(path: &Path) -> Result<BufWriter<File>> {
    let file =
        File::create(path).with_context(|| format!("creating report file {}", path.display()))?;
    Ok(BufWriter::new(file))
}
