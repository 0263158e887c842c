//! twissfit - Profile-grid quadrupole-scan analysis
//!
//! The application layer around the `beam-math` core: reading profile-grid
//! CSV exports (several wire-count variants), acquiring the quadrupole
//! strength for each measurement, generating simulated scan data, and the
//! command-line driver that ties fitting, solving and prediction together.

pub mod grid;
pub mod sim;

pub use grid::{k_prime_l_from_filename, read_profile_grid, GridError, GridVariant, ProfileGridData, ProfileSample};
pub use sim::{simulated_scan, synthetic_profile, wire_positions};
