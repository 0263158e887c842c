//! Profile-grid CSV export reader
//!
//! A profile-grid export holds a few header lines followed by two stacked
//! `position,intensity` blocks, horizontal first, then a second header and
//! the vertical block. The grids come in several hardware variants that
//! differ only in wire count (47, 77 or 96); the reader detects the variant
//! from the data instead of branching on a format tag.
//!
//! The measurement's quadrupole strength is not part of the export. It may
//! be encoded as a numeric prefix of the file name (`0.75_PG42.csv`); the
//! driver falls back to an interactive prompt when it is not.

use std::fs;
use std::path::Path;

use ndarray::Array1;
use thiserror::Error;

/// Errors from reading a profile-grid export.
#[derive(Error, Debug)]
pub enum GridError {
    /// The file could not be read.
    #[error("failed to read profile grid file: {0}")]
    Io(#[from] std::io::Error),

    /// A data row holds a non-finite value.
    #[error("non-finite value in data row at line {line}: {content:?}")]
    NonFiniteRow {
        /// 1-based line number in the file.
        line: usize,
        /// The offending line.
        content: String,
    },

    /// The file does not split into exactly two data blocks.
    #[error("expected 2 data blocks (horizontal, vertical), found {blocks}")]
    UnexpectedBlockCount {
        /// Number of contiguous data blocks found.
        blocks: usize,
    },

    /// A block's wire count matches no known grid hardware.
    #[error("unknown profile grid variant with {points} wires (known: 47, 77, 96)")]
    UnknownVariant {
        /// Number of data rows in the block.
        points: usize,
    },
}

/// Known profile-grid hardware variants, keyed by wire count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridVariant {
    /// 47-wire grid.
    Wires47,
    /// 77-wire grid.
    Wires77,
    /// 96-wire grid.
    Wires96,
}

impl GridVariant {
    /// Number of wires (data rows per plane block).
    pub fn points(&self) -> usize {
        match self {
            GridVariant::Wires47 => 47,
            GridVariant::Wires77 => 77,
            GridVariant::Wires96 => 96,
        }
    }

    /// Variant for a given wire count, if it matches known hardware.
    pub fn from_points(points: usize) -> Option<Self> {
        match points {
            47 => Some(GridVariant::Wires47),
            77 => Some(GridVariant::Wires77),
            96 => Some(GridVariant::Wires96),
            _ => None,
        }
    }
}

/// One plane's wire positions and intensities, immutable once read.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSample {
    /// Wire positions (mm).
    pub positions: Array1<f64>,
    /// Measured intensity per wire.
    pub intensities: Array1<f64>,
}

/// Both planes of one profile-grid measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileGridData {
    /// Detected hardware variant (from the horizontal block).
    pub variant: GridVariant,
    /// Horizontal-plane profile.
    pub horizontal: ProfileSample,
    /// Vertical-plane profile.
    pub vertical: ProfileSample,
}

/// Read and parse a profile-grid export file.
///
/// # Errors
///
/// Returns [`GridError`] on I/O failure, non-finite data values, a block
/// structure other than horizontal-then-vertical, or an unknown wire count.
pub fn read_profile_grid(path: &Path) -> Result<ProfileGridData, GridError> {
    let content = fs::read_to_string(path)?;
    parse_profile_grid(&content)
}

/// Parse profile-grid export text. See [`read_profile_grid`].
pub fn parse_profile_grid(content: &str) -> Result<ProfileGridData, GridError> {
    let mut blocks: Vec<Vec<(f64, f64)>> = Vec::new();
    let mut in_block = false;

    for (index, line) in content.lines().enumerate() {
        match parse_data_row(line) {
            Some((position, intensity)) => {
                if !position.is_finite() || !intensity.is_finite() {
                    return Err(GridError::NonFiniteRow {
                        line: index + 1,
                        content: line.to_string(),
                    });
                }
                if !in_block {
                    blocks.push(Vec::new());
                    in_block = true;
                }
                if let Some(block) = blocks.last_mut() {
                    block.push((position, intensity));
                }
            }
            None => in_block = false,
        }
    }

    if blocks.len() != 2 {
        return Err(GridError::UnexpectedBlockCount {
            blocks: blocks.len(),
        });
    }

    let variant = GridVariant::from_points(blocks[0].len())
        .ok_or(GridError::UnknownVariant { points: blocks[0].len() })?;
    if GridVariant::from_points(blocks[1].len()).is_none() {
        return Err(GridError::UnknownVariant { points: blocks[1].len() });
    }

    let mut blocks = blocks.into_iter();
    let (Some(horizontal_rows), Some(vertical_rows)) = (blocks.next(), blocks.next()) else {
        return Err(GridError::UnexpectedBlockCount { blocks: 0 });
    };
    let horizontal = block_to_sample(horizontal_rows);
    let vertical = block_to_sample(vertical_rows);

    log::debug!(
        "parsed {variant:?} profile grid: {} horizontal, {} vertical wires",
        horizontal.positions.len(),
        vertical.positions.len()
    );

    Ok(ProfileGridData {
        variant,
        horizontal,
        vertical,
    })
}

/// A line is a data row iff its first two comma-separated fields parse as
/// floats. Header and separator lines never do.
fn parse_data_row(line: &str) -> Option<(f64, f64)> {
    let mut fields = line.split(',');
    let position = fields.next()?.trim().parse::<f64>().ok()?;
    let intensity = fields.next()?.trim().parse::<f64>().ok()?;
    Some((position, intensity))
}

fn block_to_sample(rows: Vec<(f64, f64)>) -> ProfileSample {
    ProfileSample {
        positions: rows.iter().map(|r| r.0).collect(),
        intensities: rows.iter().map(|r| r.1).collect(),
    }
}

/// Extract the quadrupole strength from a file name prefix such as
/// `0.75_PG42.csv`. Returns `None` when the stem has no numeric prefix.
pub fn k_prime_l_from_filename(path: &Path) -> Option<f64> {
    let stem = path.file_stem()?.to_str()?;
    let prefix = stem.split('_').next()?;
    prefix.parse::<f64>().ok().filter(|k| k.is_finite())
}
