mod compressor;
mod router;
mod routing_info;
mod routing_table;
mod table_generator;
mod validator;

#[cfg(test)]
mod tests;

use anyhow::{anyhow, bail, Context, Result};
use compressor::checker::check_tables;
use compressor::{compress_tables, Compressor, MAX_ROUTING_ENTRIES};
use log::info;
use meshpnr_common::design::{save_json, PlacedDesign};
use meshpnr_common::machine::Machine;
use router::{DijkstraConfig, DijkstraRouter, MulticastRouter, SteinerRouter};
use routing_info::RoutingInfo;
use routing_table::MulticastRoutingTables;
use std::path::PathBuf;
use std::str::FromStr;
use table_generator::generate_tables;
use validator::validate_routes;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RouterKind {
    Dijkstra,
    Steiner,
}

impl FromStr for RouterKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dijkstra" => Ok(Self::Dijkstra),
            "steiner" => Ok(Self::Steiner),
            _ => bail!("Unknown router {:?}", s),
        }
    }
}

#[derive(Clone, Debug)]
struct RoutingOptions {
    router: RouterKind,
    dijkstra: DijkstraConfig,
    compressor: Compressor,
    max_entries: usize,
    /// Check the tables against the graph, and the compressed tables against the uncompressed
    validate: bool,
}

impl Default for RoutingOptions {
    fn default() -> Self {
        Self {
            router: RouterKind::Dijkstra,
            dijkstra: DijkstraConfig::default(),
            compressor: Compressor::OrderedCovering,
            max_entries: MAX_ROUTING_ENTRIES,
            validate: true,
        }
    }
}

#[derive(Clone, Debug)]
struct Config {
    input_file: PathBuf,
    output_file: PathBuf,
    routing_info_file: Option<PathBuf>,
    uncompressed_file: Option<PathBuf>,
    options: RoutingOptions,
}

fn value_of<'a>(matches: &'a clap::ArgMatches, name: &str) -> Result<&'a str> {
    matches
        .value_of(name)
        .ok_or_else(|| anyhow!("Missing argument {}", name))
}

fn parse_args() -> Result<Config> {
    use clap::{App, Arg};
    let matches = App::new("MeshPNR Router")
        .version(env!("CARGO_PKG_VERSION"))
        .author(clap::crate_authors!())
        .about("Key allocation, routing and table compression phase for the MeshPNR flow")
        .arg(
            Arg::with_name("ROUTER")
                .long("router")
                .value_name("ROUTER")
                .possible_values(["dijkstra", "steiner"])
                .default_value("dijkstra"),
        )
        .arg(
            Arg::with_name("COMPRESSOR")
                .long("compressor")
                .value_name("COMPRESSOR")
                .possible_values(["ordered-covering", "unordered", "none"])
                .default_value("ordered-covering"),
        )
        .arg(
            Arg::with_name("MAX_ENTRIES")
                .long("max-entries")
                .value_name("N")
                .help("Entries each router holds")
                .default_value("1023"),
        )
        .arg(
            Arg::with_name("ROUTING_INFO")
                .long("routing-info")
                .value_name("FILE")
                .help("Also write the allocated keys and masks")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("UNCOMPRESSED")
                .long("uncompressed")
                .value_name("FILE")
                .help("Also write the tables as generated, before compression")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("NO_VALIDATE")
                .long("no-validate")
                .help("Skip the route validator and the compression check"),
        )
        .arg(
            Arg::with_name("INPUT")
                .help("Input placed design, as written by meshpnr-placement")
                .index(1)
                .required(true),
        )
        .arg(
            Arg::with_name("OUTPUT")
                .help("Output routing tables location")
                .index(2)
                .required(true),
        )
        .get_matches();

    let path_of = |name: &str| -> Result<PathBuf> {
        matches
            .value_of_os(name)
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("Missing argument {}", name))
    };

    Ok(Config {
        input_file: path_of("INPUT")?,
        output_file: path_of("OUTPUT")?,
        routing_info_file: matches.value_of_os("ROUTING_INFO").map(PathBuf::from),
        uncompressed_file: matches.value_of_os("UNCOMPRESSED").map(PathBuf::from),
        options: RoutingOptions {
            router: value_of(&matches, "ROUTER")?.parse()?,
            compressor: value_of(&matches, "COMPRESSOR")?.parse()?,
            max_entries: value_of(&matches, "MAX_ENTRIES")?
                .parse()
                .with_context(|| anyhow!("Parsing max entries argument"))?,
            validate: !matches.is_present("NO_VALIDATE"),
            ..RoutingOptions::default()
        },
    })
}

struct RoutedDesign {
    routing_info: RoutingInfo,
    uncompressed: MulticastRoutingTables,
    tables: MulticastRoutingTables,
}

fn route_design(design: &PlacedDesign, options: &RoutingOptions) -> Result<RoutedDesign> {
    let machine = Machine::new(&design.machine).context("Building machine from description")?;
    let graph = &design.machine_graph;

    let routing_info = routing_info::allocate(&design.application_graph, graph)
        .context("Allocating keys")?;

    let mut multicast_router: Box<dyn MulticastRouter> = match options.router {
        RouterKind::Dijkstra => Box::new(DijkstraRouter::new(options.dijkstra)),
        RouterKind::Steiner => Box::new(SteinerRouter::new()),
    };
    let by_partition =
        router::route(multicast_router.as_mut(), &machine, graph, &design.placements)
            .context("Routing")?;

    let uncompressed =
        generate_tables(&routing_info, &by_partition).context("Generating routing tables")?;
    if options.validate {
        validate_routes(&machine, graph, &design.placements, &routing_info, &uncompressed)
            .context("Validating generated tables")?;
    }

    let tables = compress_tables(&uncompressed, options.compressor, options.max_entries)
        .context("Compressing routing tables")?;
    if options.validate {
        check_tables(&uncompressed, &tables)?;
        validate_routes(&machine, graph, &design.placements, &routing_info, &tables)
            .context("Validating compressed tables")?;
    }

    Ok(RoutedDesign {
        routing_info,
        uncompressed,
        tables,
    })
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config = parse_args()?;

    let design = PlacedDesign::load(&config.input_file)?;
    info!(
        "Routing {} placed vertices with {:?}",
        design.placements.len(),
        config.options.router
    );
    let routed = route_design(&design, &config.options)
        .with_context(|| format!("Routing {:?}", config.input_file))?;

    if let Some(path) = config.routing_info_file.as_ref() {
        save_json(path, &routed.routing_info.records(&design.machine_graph)?)?;
    }
    if let Some(path) = config.uncompressed_file.as_ref() {
        save_json(path, &routed.uncompressed)?;
    }
    info!(
        "Writing {} routing tables to {:?}",
        routed.tables.len(),
        config.output_file
    );
    save_json(&config.output_file, &routed.tables)
}
