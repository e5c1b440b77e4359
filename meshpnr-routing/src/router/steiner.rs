use anyhow::{Context, Result};
use meshpnr_common::machine::{ChipCoord, Machine, ALL_LINKS};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use super::{MulticastRouter, RoutingError, RoutingTree};
use crate::routing_table::RoutingTableByPartition;

/// Grows one tree per partition: repeatedly finds the destination closest to the tree built so
/// far and grafts on the shortest path to it. Destinations sharing a direction share links.
#[derive(Default)]
pub struct SteinerRouter;

impl SteinerRouter {
    pub fn new() -> Self {
        Self
    }
}

impl MulticastRouter for SteinerRouter {
    fn route_partition(
        &mut self,
        machine: &Machine,
        source: ChipCoord,
        destinations: &BTreeSet<ChipCoord>,
        _tables: &RoutingTableByPartition,
    ) -> Result<RoutingTree> {
        machine.get_chip(source)?;
        let mut tree = RoutingTree::new(source);
        let mut pending = destinations.clone();
        pending.retain(|c| !tree.contains(*c));

        while let Some(first_pending) = pending.iter().next().copied() {
            // Breadth first from every chip of the tree at once
            let mut seeds = tree.came_from.keys().copied().collect::<Vec<_>>();
            seeds.sort();
            seeds.insert(0, source);

            let mut seen: HashSet<ChipCoord> = seeds.iter().copied().collect();
            let mut reached_from = HashMap::new();
            let mut queue: VecDeque<ChipCoord> = seeds.into();
            let mut found = None;
            while let Some(chip) = queue.pop_front() {
                if pending.contains(&chip) {
                    found = Some(chip);
                    break;
                }
                for link in ALL_LINKS {
                    if let Some(neighbour) = machine.link_target(chip, link) {
                        if seen.insert(neighbour) {
                            reached_from.insert(neighbour, (chip, link));
                            queue.push_back(neighbour);
                        }
                    }
                }
            }

            let found = match found {
                Some(found) => found,
                None => Err(RoutingError::Unreachable {
                    source,
                    destination: first_pending,
                })?,
            };

            let mut current = found;
            while !tree.contains(current) {
                let step = *reached_from
                    .get(&current)
                    .with_context(|| format!("Search lost the way back from {}", current))?;
                tree.came_from.insert(current, step);
                current = step.0;
            }
            pending.retain(|c| !tree.contains(*c));
        }

        Ok(tree)
    }
}
