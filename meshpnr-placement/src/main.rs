use anyhow::{Context, Result};
use log::info;
use meshpnr_common::design::ProblemDescription;
use meshpnr_placement::config::Config;

fn parse_args() -> Result<Config> {
    use clap::{App, Arg};
    let matches = App::new("MeshPNR Placer")
        .version(env!("CARGO_PKG_VERSION"))
        .author(clap::crate_authors!())
        .about("Partitioning and placement phase for the MeshPNR flow")
        .arg(
            Arg::with_name("INPUT")
                .help("Input problem description (JSON)")
                .index(1)
                .required(true),
        )
        .arg(
            Arg::with_name("OUTPUT")
                .help("Output placed design location")
                .index(2)
                .required(true),
        )
        .arg(
            Arg::with_name("START_CHIP")
                .long("start-chip")
                .value_name("X,Y")
                .help("Chip the placer starts filling from")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("REPORT_DIR")
                .long("report-dir")
                .value_name("DIR")
                .help("Directory for the report written when placement fails")
                .default_value("."),
        )
        .get_matches();

    Config::from_args(&matches)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = parse_args()?;

    let problem = ProblemDescription::load(&config.io.input_file)?;
    let design = meshpnr_placement::place_design(&problem, &config.placer)
        .with_context(|| format!("Placing {:?}", config.io.input_file))?;
    info!(
        "Writing {} placements to {:?}",
        design.placements.len(),
        config.io.output_file
    );
    design.save(&config.io.output_file)
}
