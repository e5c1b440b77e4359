//! Multicast routing: for every partition, a tree over live links from the source core's chip to
//! the chips of all of its destinations.
//!
//! Both routers build the tree as a predecessor map (each chip remembers the chip and link it is
//! reached from) and share the code that turns that map into path entries.

mod dijkstra;
mod steiner;

#[cfg(test)]
mod tests;

pub use dijkstra::{DijkstraConfig, DijkstraRouter};
pub use steiner::SteinerRouter;

use anyhow::{Context, Result};
use log::{debug, info};
use meshpnr_common::graph::{EdgePartition, MachineGraph};
use meshpnr_common::machine::{ChipCoord, Link, Machine};
use meshpnr_common::placements::Placements;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::Display;

use crate::routing_table::{
    Incoming, PartitionSource, Route, RoutingPathEntry, RoutingTableByPartition,
};

#[derive(Debug, PartialEq, Eq)]
pub enum RoutingError {
    /// No path of live links joins the chips
    Unreachable {
        source: ChipCoord,
        destination: ChipCoord,
    },
    /// Tracing a route back to its source visited a chip twice
    CycleDetected { chip: ChipCoord },
    BandwidthExhausted { chip: ChipCoord, link: Link },
    EntriesExhausted { chip: ChipCoord },
    /// One partition entering a chip from two directions
    ConflictingEntry {
        chip: ChipCoord,
        partition: String,
        existing: String,
        new: String,
    },
}

impl Display for RoutingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable {
                source,
                destination,
            } => write!(f, "{} can not be reached from {}", destination, source),
            Self::CycleDetected { chip } => {
                write!(f, "cycle detected at {} while tracing a route", chip)
            }
            Self::BandwidthExhausted { chip, link } => {
                write!(f, "no bandwidth left on link {:?} of {}", link, chip)
            }
            Self::EntriesExhausted { chip } => {
                write!(f, "no routing entries left on {}", chip)
            }
            Self::ConflictingEntry {
                chip,
                partition,
                existing,
                new,
            } => write!(
                f,
                "partition {:?} enters {} from {} and from {}",
                partition, chip, existing, new
            ),
        }
    }
}

impl std::error::Error for RoutingError {}

/// A multicast routing algorithm. Routers may keep state between partitions, such as the load
/// already put on each link.
pub trait MulticastRouter {
    /// Build the tree of one partition. `tables` holds the entries of the partitions routed so
    /// far.
    fn route_partition(
        &mut self,
        machine: &Machine,
        source: ChipCoord,
        destinations: &BTreeSet<ChipCoord>,
        tables: &RoutingTableByPartition,
    ) -> Result<RoutingTree>;

    /// Called with the links of each tree committed to the tables
    fn claim_links(&mut self, _links: &[(ChipCoord, Link)]) -> Result<()> {
        Ok(())
    }
}

/// Chips reached by a routing tree, each with the chip and link it is reached from
#[derive(Clone, Debug)]
pub struct RoutingTree {
    pub source: ChipCoord,
    pub came_from: HashMap<ChipCoord, (ChipCoord, Link)>,
}

impl RoutingTree {
    pub fn new(source: ChipCoord) -> Self {
        Self {
            source,
            came_from: HashMap::new(),
        }
    }

    pub fn contains(&self, chip: ChipCoord) -> bool {
        chip == self.source || self.came_from.contains_key(&chip)
    }
}

/// Route every multicast partition of `graph`, one after another in graph order
pub fn route(
    router: &mut dyn MulticastRouter,
    machine: &Machine,
    graph: &MachineGraph,
    placements: &Placements,
) -> Result<RoutingTableByPartition> {
    let mut tables = RoutingTableByPartition::new();
    let mut n_routed = 0;
    for partition in graph.multicast_partitions() {
        let label = &graph.vertex(partition.pre())?.label;
        route_one(router, machine, graph, placements, partition, &mut tables).with_context(
            || format!("Routing partition {:?} of {}", partition.identifier(), label),
        )?;
        n_routed += 1;
    }
    info!(
        "Routed {} partitions through {} routers",
        n_routed,
        tables.n_routers()
    );
    Ok(tables)
}

fn route_one(
    router: &mut dyn MulticastRouter,
    machine: &Machine,
    graph: &MachineGraph,
    placements: &Placements,
    partition: &EdgePartition,
    tables: &mut RoutingTableByPartition,
) -> Result<()> {
    let pre = graph.vertex(partition.pre())?;
    let source_placement = placements.placement_of(partition.pre())?;
    let source = source_placement.chip();

    let mut destinations: BTreeMap<ChipCoord, BTreeSet<u8>> = BTreeMap::new();
    for post in partition.destinations() {
        let placement = placements.placement_of(post)?;
        destinations
            .entry(placement.chip())
            .or_default()
            .insert(placement.p);
    }
    let chips = destinations.keys().copied().collect::<BTreeSet<_>>();

    let tree = router.route_partition(machine, source, &chips, tables)?;

    let partition_source = PartitionSource {
        app_vertex: pre.app_vertex,
        identifier: partition.identifier().to_string(),
        vertex: partition.pre(),
    };
    let claimed = commit_tree(
        &tree,
        &destinations,
        source_placement.p,
        &partition_source,
        tables,
    )?;
    debug!(
        "{} {:?}: {} destination chips over {} links",
        pre.label,
        partition.identifier(),
        destinations.len(),
        claimed.len()
    );
    router.claim_links(&claimed)
}

/// Trace every destination back to the source, adding path entries on the way. Returns the links
/// used, each once.
pub fn commit_tree(
    tree: &RoutingTree,
    destinations: &BTreeMap<ChipCoord, BTreeSet<u8>>,
    source_processor: u8,
    partition: &PartitionSource,
    tables: &mut RoutingTableByPartition,
) -> Result<Vec<(ChipCoord, Link)>> {
    let incoming_of = |chip: ChipCoord| -> Result<Incoming> {
        if chip == tree.source {
            Ok(Incoming::Processor(source_processor))
        } else {
            match tree.came_from.get(&chip) {
                Some((_, link)) => Ok(Incoming::Link(link.opposite())),
                None => Err(RoutingError::Unreachable {
                    source: tree.source,
                    destination: chip,
                })?,
            }
        }
    };

    let mut claimed = Vec::new();
    let mut claimed_set = HashSet::new();
    for (chip, processors) in destinations.iter() {
        let route = Route::from_parts([], processors.iter().copied())?;
        tables.add_path_entry(
            *chip,
            partition,
            RoutingPathEntry::new(route, Some(incoming_of(*chip)?)),
        )?;

        let mut visited = HashSet::new();
        let mut current = *chip;
        while current != tree.source {
            if !visited.insert(current) {
                Err(RoutingError::CycleDetected { chip: current })?
            }
            let (previous, link) = match tree.came_from.get(&current) {
                Some(step) => *step,
                None => Err(RoutingError::Unreachable {
                    source: tree.source,
                    destination: *chip,
                })?,
            };
            let route = Route::from_parts([link], [])?;
            tables.add_path_entry(
                previous,
                partition,
                RoutingPathEntry::new(route, Some(incoming_of(previous)?)),
            )?;
            if claimed_set.insert((previous, link)) {
                claimed.push((previous, link));
            }
            current = previous;
        }
    }
    Ok(claimed)
}
