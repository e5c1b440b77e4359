//! Independent check of the final tables: every key a source can send is followed through the
//! routers it reaches, and must arrive at exactly the cores its partition targets.

use anyhow::{Context, Result};
use log::{debug, info};
use meshpnr_common::graph::{EdgePartition, MachineGraph};
use meshpnr_common::machine::{ChipCoord, Link, Machine};
use meshpnr_common::placements::Placements;
use std::collections::{BTreeSet, HashSet};
use std::fmt::Display;

use crate::routing_info::RoutingInfo;
use crate::routing_table::{MulticastRoutingTables, Route};

#[derive(Debug, PartialEq, Eq)]
pub enum ValidationError {
    /// A packet reached the same router twice
    CycleDetected { chip: ChipCoord, key: u32 },
    MissingDestination { chip: ChipCoord, p: u8, key: u32 },
    ExtraDestination { chip: ChipCoord, p: u8, key: u32 },
    NoEntry { chip: ChipCoord, key: u32 },
    /// Keys of one source slice take different routes through one router
    PartialCoverage {
        chip: ChipCoord,
        key: u32,
        first_key: u32,
    },
    DeadLink { chip: ChipCoord, link: Link },
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CycleDetected { chip, key } => {
                write!(f, "key {:#010x} reaches {} twice", key, chip)
            }
            Self::MissingDestination { chip, p, key } => write!(
                f,
                "key {:#010x} never reaches processor {} of {}",
                key, p, chip
            ),
            Self::ExtraDestination { chip, p, key } => write!(
                f,
                "key {:#010x} reaches processor {} of {}, which does not expect it",
                key, p, chip
            ),
            Self::NoEntry { chip, key } => {
                write!(f, "no entry on {} matches key {:#010x}", chip, key)
            }
            Self::PartialCoverage {
                chip,
                key,
                first_key,
            } => write!(
                f,
                "keys {:#010x} and {:#010x} of one slice are routed differently by {}",
                first_key, key, chip
            ),
            Self::DeadLink { chip, link } => {
                write!(f, "route leaves {} over missing link {:?}", chip, link)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Follow every multicast partition of `graph` through `tables`
pub fn validate_routes(
    machine: &Machine,
    graph: &MachineGraph,
    placements: &Placements,
    routing_info: &RoutingInfo,
    tables: &MulticastRoutingTables,
) -> Result<()> {
    let mut n_checked = 0;
    for partition in graph.multicast_partitions() {
        let label = &graph.vertex(partition.pre())?.label;
        validate_partition(machine, graph, placements, routing_info, tables, partition)
            .with_context(|| {
                format!(
                    "Validating routes of partition {:?} of {}",
                    partition.identifier(),
                    label
                )
            })?;
        n_checked += 1;
    }
    info!("Validated the routes of {} partitions", n_checked);
    Ok(())
}

fn validate_partition(
    machine: &Machine,
    graph: &MachineGraph,
    placements: &Placements,
    routing_info: &RoutingInfo,
    tables: &MulticastRoutingTables,
    partition: &EdgePartition,
) -> Result<()> {
    let source = placements.placement_of(partition.pre())?.chip();
    let expected = partition
        .destinations()
        .into_iter()
        .map(|post| placements.placement_of(post).map(|p| (p.chip(), p.p)))
        .collect::<Result<BTreeSet<_>>>()?;

    let n_atoms = graph.vertex(partition.pre())?.slice.n_atoms();
    let key_and_mask = routing_info
        .machine_info(partition.pre(), partition.identifier())?
        .key_and_mask;
    let keys = (0..n_atoms as u64)
        .map(|i| key_and_mask.key_at(i))
        .collect::<Vec<_>>();
    let first_key = key_and_mask.key();

    let reached = trace(machine, tables, source, &keys)?;

    if let Some((chip, p)) = expected.difference(&reached).next() {
        Err(ValidationError::MissingDestination {
            chip: *chip,
            p: *p,
            key: first_key,
        })?
    }
    if let Some((chip, p)) = reached.difference(&expected).next() {
        Err(ValidationError::ExtraDestination {
            chip: *chip,
            p: *p,
            key: first_key,
        })?
    }
    debug!(
        "Keys from {:#010x} reach {} cores",
        first_key,
        reached.len()
    );
    Ok(())
}

/// Cores reached by the first of `keys`. Every other key must take the same route on every
/// router on the way.
fn trace(
    machine: &Machine,
    tables: &MulticastRoutingTables,
    source: ChipCoord,
    keys: &[u32],
) -> Result<BTreeSet<(ChipCoord, u8)>> {
    let first_key = match keys.first() {
        Some(key) => *key,
        None => return Ok(BTreeSet::new()),
    };
    let lookup = |chip: ChipCoord, key: u32| -> Result<Route> {
        match tables.table(chip).and_then(|t| t.lookup(key)) {
            Some(entry) => Ok(entry.route),
            None => Err(ValidationError::NoEntry { chip, key })?,
        }
    };

    let mut reached = BTreeSet::new();
    let mut visited = HashSet::new();
    let mut pending = vec![source];
    while let Some(chip) = pending.pop() {
        if !visited.insert(chip) {
            Err(ValidationError::CycleDetected {
                chip,
                key: first_key,
            })?
        }
        let route = lookup(chip, first_key)?;
        for key in keys[1..].iter().copied() {
            if lookup(chip, key)? != route {
                Err(ValidationError::PartialCoverage {
                    chip,
                    key,
                    first_key,
                })?
            }
        }

        reached.extend(route.processors().map(|p| (chip, p)));
        for link in route.links() {
            match machine.link_target(chip, link) {
                Some(next) => pending.push(next),
                None => Err(ValidationError::DeadLink { chip, link })?,
            }
        }
    }
    Ok(reached)
}
