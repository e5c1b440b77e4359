//! Configuration of the placement tool, built once from the command line and passed down to the
//! stages that need it.

use anyhow::{anyhow, bail, Context, Result};
use meshpnr_common::design::ReservedCore;
use meshpnr_common::machine::ChipCoord;
use std::path::PathBuf;

/// Configuration variables related to input/output operations
#[derive(Clone, Debug)]
pub struct IOConfig {
    /// Input file name (a JSON problem description)
    pub input_file: PathBuf,
    /// Output file name (a JSON placed design)
    pub output_file: PathBuf,
}

/// Configuration of the space-search placer
#[derive(Clone, Debug)]
pub struct PlacerConfig {
    /// Chip the placement cursor starts from. Defaults to the first ethernet connected chip.
    pub start_chip: Option<ChipCoord>,
    /// Cores taken by the system before placement, on top of those listed in the problem
    /// description
    pub reserved_cores: Vec<ReservedCore>,
    /// Where the report goes if placement fails. The command line defaults this to the current
    /// directory, library callers get the system temporary directory.
    pub report_directory: PathBuf,
}

impl Default for PlacerConfig {
    fn default() -> Self {
        Self {
            start_chip: None,
            reserved_cores: Vec::new(),
            report_directory: std::env::temp_dir(),
        }
    }
}

/// Overall placement configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub io: IOConfig,
    pub placer: PlacerConfig,
}

/// Parse a chip coordinate written as `X,Y`
pub fn parse_chip(value: &str) -> Result<ChipCoord> {
    let (x, y) = match value.split_once(',') {
        Some(parts) => parts,
        None => bail!("Expected a chip as X,Y, got {:?}", value),
    };
    Ok(ChipCoord::new(
        x.trim().parse().with_context(|| anyhow!("Parse chip x {:?}", x))?,
        y.trim().parse().with_context(|| anyhow!("Parse chip y {:?}", y))?,
    ))
}

impl Config {
    /// Construct a baseline configuration from the clap argument matches
    pub fn from_args(matches: &clap::ArgMatches) -> Result<Self> {
        let path_of = |name: &str| -> Result<PathBuf> {
            matches
                .value_of_os(name)
                .map(PathBuf::from)
                .ok_or_else(|| anyhow!("Missing argument {}", name))
        };

        Ok(Config {
            io: IOConfig {
                input_file: path_of("INPUT")?,
                output_file: path_of("OUTPUT")?,
            },
            placer: PlacerConfig {
                start_chip: matches
                    .value_of("START_CHIP")
                    .map(parse_chip)
                    .transpose()
                    .context("Parse START_CHIP")?,
                reserved_cores: Vec::new(),
                report_directory: path_of("REPORT_DIR")?,
            },
        })
    }
}
