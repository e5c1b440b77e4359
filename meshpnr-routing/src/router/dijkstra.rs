use anyhow::Result;
use log::trace;
use meshpnr_common::machine::{ChipCoord, Link, Machine, ALL_LINKS};
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

use super::{MulticastRouter, RoutingError, RoutingTree};
use crate::routing_table::RoutingTableByPartition;

/// Weights of the link cost `k + l * (1/free - 1/available) + m * (1/bw - 1/max_bw)`, where
/// `free` and `available` count entries of the router at the far end of the link and `bw` is
/// what is left of the link's bandwidth.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DijkstraConfig {
    /// Cost of a hop
    pub k: f64,
    /// Weight of routing entry scarcity
    pub l: f64,
    /// Weight of bandwidth already used
    pub m: f64,
    /// Bandwidth taken from a link by every route over it
    pub bandwidth_per_route_entry: f64,
    pub max_bandwidth: f64,
}

impl Default for DijkstraConfig {
    fn default() -> Self {
        Self {
            k: 1.0,
            l: 0.0,
            m: 0.0,
            bandwidth_per_route_entry: 0.01,
            max_bandwidth: 250.0,
        }
    }
}

/// Shortest path tree per partition. Link bandwidth is used up as partitions are routed, so with
/// a non-zero `m` later partitions are pushed away from busy links.
pub struct DijkstraRouter {
    config: DijkstraConfig,
    bandwidth: HashMap<(ChipCoord, Link), f64>,
}

#[derive(PartialEq)]
struct RouteQueueItem {
    cost: f64,
    chip: ChipCoord,
}

impl Eq for RouteQueueItem {}

impl PartialOrd for RouteQueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RouteQueueItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed, the heap pops the lowest cost first. Ties go to the lowest chip.
        other
            .cost
            .partial_cmp(&self.cost)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| other.chip.cmp(&self.chip))
    }
}

impl DijkstraRouter {
    pub fn new(config: DijkstraConfig) -> Self {
        Self {
            config,
            bandwidth: HashMap::new(),
        }
    }

    pub fn bandwidth(&self, chip: ChipCoord, link: Link) -> f64 {
        self.bandwidth
            .get(&(chip, link))
            .copied()
            .unwrap_or(self.config.max_bandwidth)
    }

    /// Cost of sending from `chip` over `link` to `to`
    pub fn link_weight(
        &self,
        machine: &Machine,
        tables: &RoutingTableByPartition,
        chip: ChipCoord,
        link: Link,
        to: ChipCoord,
    ) -> Result<f64> {
        let mut weight = self.config.k;
        if self.config.l != 0.0 {
            let available = machine.get_chip(to)?.router_entries as f64;
            let free = available - tables.n_entries(to) as f64;
            if free <= 0.0 {
                Err(RoutingError::EntriesExhausted { chip: to })?
            }
            weight += self.config.l * (1.0 / free - 1.0 / available);
        }
        if self.config.m != 0.0 {
            let bandwidth = self.bandwidth(chip, link);
            weight += self.config.m * (1.0 / bandwidth - 1.0 / self.config.max_bandwidth);
        }
        Ok(weight)
    }
}

impl MulticastRouter for DijkstraRouter {
    fn route_partition(
        &mut self,
        machine: &Machine,
        source: ChipCoord,
        destinations: &BTreeSet<ChipCoord>,
        tables: &RoutingTableByPartition,
    ) -> Result<RoutingTree> {
        machine.get_chip(source)?;
        let mut tree = RoutingTree::new(source);
        let mut remaining = destinations.clone();
        let mut lowest_cost: HashMap<ChipCoord, f64> = HashMap::new();
        let mut settled = HashSet::new();
        let mut queue = BinaryHeap::new();

        lowest_cost.insert(source, 0.0);
        queue.push(RouteQueueItem {
            cost: 0.0,
            chip: source,
        });

        while !remaining.is_empty() {
            let item = match queue.pop() {
                Some(item) => item,
                None => break,
            };
            if !settled.insert(item.chip) {
                continue;
            }
            remaining.remove(&item.chip);

            for link in ALL_LINKS {
                let neighbour = match machine.link_target(item.chip, link) {
                    Some(neighbour) => neighbour,
                    None => continue,
                };
                if settled.contains(&neighbour) {
                    continue;
                }
                let cost =
                    item.cost + self.link_weight(machine, tables, item.chip, link, neighbour)?;
                if lowest_cost.get(&neighbour).map_or(true, |c| cost < *c) {
                    lowest_cost.insert(neighbour, cost);
                    tree.came_from.insert(neighbour, (item.chip, link));
                    queue.push(RouteQueueItem {
                        cost,
                        chip: neighbour,
                    });
                }
            }
        }

        if let Some(destination) = remaining.iter().next() {
            Err(RoutingError::Unreachable {
                source,
                destination: *destination,
            })?
        }

        // Anything not settled is not part of the tree
        tree.came_from.retain(|chip, _| settled.contains(chip));
        trace!("Settled {} chips from {}", settled.len(), source);
        Ok(tree)
    }

    fn claim_links(&mut self, links: &[(ChipCoord, Link)]) -> Result<()> {
        for (chip, link) in links.iter().copied() {
            let left = self.bandwidth(chip, link) - self.config.bandwidth_per_route_entry;
            if left <= 0.0 {
                Err(RoutingError::BandwidthExhausted { chip, link })?
            }
            self.bandwidth.insert((chip, link), left);
        }
        Ok(())
    }
}
