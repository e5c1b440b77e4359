//! Turns the routers' per-partition entries into one table per chip.

use anyhow::{Context, Result};
use itertools::Itertools;
use log::{debug, info};
use meshpnr_common::machine::ChipCoord;

use crate::routing_info::RoutingInfo;
use crate::routing_table::{
    MulticastRoutingEntry, MulticastRoutingTable, MulticastRoutingTables, PartitionSource,
    RoutingPathEntry, RoutingTableByPartition,
};

pub fn generate_tables(
    routing_info: &RoutingInfo,
    by_partition: &RoutingTableByPartition,
) -> Result<MulticastRoutingTables> {
    let mut tables = MulticastRoutingTables::new();
    for chip in by_partition.chips() {
        let table = chip_table(chip, routing_info, by_partition)
            .with_context(|| format!("Generating the routing table of {}", chip))?;
        tables.add_table(table)?;
    }
    info!(
        "Generated {} routing tables with {} entries, at most {} on one chip",
        tables.len(),
        tables.n_entries(),
        tables.max_entries()
    );
    Ok(tables)
}

fn chip_table(
    chip: ChipCoord,
    routing_info: &RoutingInfo,
    by_partition: &RoutingTableByPartition,
) -> Result<MulticastRoutingTable> {
    let mut table = MulticastRoutingTable::new(chip);

    // Siblings of one application vertex sending the same way end up next to each other
    let groups = by_partition.entries_for_chip(chip).group_by(|(source, entry)| {
        (
            source.app_vertex,
            source.identifier.clone(),
            source.app_vertex.map_or(Some(source.vertex), |_| None),
            entry.route(),
            entry.defaultable(),
        )
    });

    for (_, group) in &groups {
        let group = group.collect_vec();
        for entry in merged_entries(&group, routing_info)? {
            table.add_entry(entry);
        }
    }
    debug!("{} has {} entries", chip, table.len());
    Ok(table)
}

fn merged_entries(
    group: &[(&PartitionSource, &RoutingPathEntry)],
    routing_info: &RoutingInfo,
) -> Result<Vec<MulticastRoutingEntry>> {
    let single = |source: &PartitionSource, entry: &RoutingPathEntry| -> Result<_> {
        let info = routing_info.machine_info(source.vertex, &source.identifier)?;
        Ok(MulticastRoutingEntry::new(
            info.key_and_mask.key(),
            info.key_and_mask.mask(),
            entry.route(),
            entry.defaultable(),
        ))
    };

    let source = match group {
        [] => return Ok(Vec::new()),
        [(source, entry)] => return Ok(vec![single(source, entry)?]),
        [(source, _), ..] => *source,
    };
    let app_info = match source
        .app_vertex
        .and_then(|app| routing_info.app_info(app, &source.identifier))
    {
        Some(app_info) => app_info,
        None => return group.iter().map(|(s, e)| single(s, e)).collect(),
    };

    let infos = group
        .iter()
        .map(|(source, _)| routing_info.machine_info(source.vertex, &source.identifier))
        .collect::<Result<Vec<_>>>()?;
    let pairs = infos
        .into_iter()
        .zip(group.iter().map(|(_, entry)| *entry))
        .collect_vec();
    let merged = app_info.merge_machine_entries(&pairs);
    debug!(
        "Merged {} entries of partition {:?} into {}",
        group.len(),
        source.identifier,
        merged.len()
    );
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing_info::{AppVertexRoutingInfo, KeyAndMask, MachineVertexRoutingInfo};
    use crate::routing_table::{Incoming, Route};
    use meshpnr_common::graph::{ApplicationVertexId, MachineVertexId};
    use meshpnr_common::machine::Link;

    const POP: ApplicationVertexId = ApplicationVertexId(0);

    /// Eight machine vertices of sixteen atoms each in the block at 0, and two vertices without
    /// an application vertex at 0x100 and 0x101
    fn routing_info() -> Result<RoutingInfo> {
        let mut info = RoutingInfo::new();
        for i in 0..8u32 {
            info.add_machine_info(MachineVertexRoutingInfo {
                vertex: MachineVertexId(i),
                partition: "spikes".into(),
                key_and_mask: KeyAndMask::new(i << 4, 0xffff_fff0)?,
                index: i,
            });
        }
        info.add_app_info(AppVertexRoutingInfo {
            vertex: POP,
            partition: "spikes".into(),
            key_and_mask: KeyAndMask::new(0, 0xffff_ff80)?,
            machine_mask: 0xffff_fff0,
            n_bits_atoms: 4,
            max_machine_index: 7,
        });
        for (vertex, key) in [(10, 0x100), (11, 0x101)] {
            info.add_machine_info(MachineVertexRoutingInfo {
                vertex: MachineVertexId(vertex),
                partition: "spikes".into(),
                key_and_mask: KeyAndMask::new(key, u32::MAX)?,
                index: 0,
            });
        }
        Ok(info)
    }

    fn source(app_vertex: Option<ApplicationVertexId>, vertex: u32) -> PartitionSource {
        PartitionSource {
            app_vertex,
            identifier: "spikes".into(),
            vertex: MachineVertexId(vertex),
        }
    }

    fn key_masks(tables: &MulticastRoutingTables, chip: ChipCoord) -> Result<Vec<(u32, u32)>> {
        let table = tables.table(chip).context("No table generated")?;
        Ok(table.entries().iter().map(|e| (e.key, e.mask)).collect())
    }

    #[test]
    fn differently_routed_siblings_stay_apart() -> Result<()> {
        let chip = ChipCoord::new(0, 0);
        let east = RoutingPathEntry::new(Route::from_parts([Link::East], [])?, None);
        let north = RoutingPathEntry::new(Route::from_parts([Link::North], [])?, None);
        let mut by_partition = RoutingTableByPartition::new();
        for (vertex, entry) in [(0, east), (1, east), (2, north), (3, east)] {
            by_partition.add_path_entry(chip, &source(Some(POP), vertex), entry)?;
        }

        let tables = generate_tables(&routing_info()?, &by_partition)?;
        assert_eq!(
            key_masks(&tables, chip)?,
            vec![
                (0x00, 0xffff_ffe0),
                (0x20, 0xffff_fff0),
                (0x30, 0xffff_fff0)
            ]
        );
        let table = tables.table(chip).context("No table generated")?;
        assert_eq!(table.lookup(0x25).map(|e| e.route), Some(north.route()));
        assert_eq!(table.lookup(0x15).map(|e| e.route), Some(east.route()));
        assert!(table.lookup(0x45).is_none());
        Ok(())
    }

    #[test]
    fn gaps_between_siblings_split_the_merge() -> Result<()> {
        let chip = ChipCoord::new(0, 0);
        let local = RoutingPathEntry::new(Route::from_parts([], [2])?, None);
        let mut by_partition = RoutingTableByPartition::new();
        for vertex in [0, 1, 2, 3, 5, 6] {
            by_partition.add_path_entry(chip, &source(Some(POP), vertex), local)?;
        }

        let tables = generate_tables(&routing_info()?, &by_partition)?;
        assert_eq!(
            key_masks(&tables, chip)?,
            vec![
                (0x00, 0xffff_ffc0),
                (0x50, 0xffff_fff0),
                (0x60, 0xffff_fff0)
            ]
        );
        // The missing sibling is not caught by its neighbours' entries
        let table = tables.table(chip).context("No table generated")?;
        assert!(table.lookup(0x45).is_none());
        Ok(())
    }

    #[test]
    fn vertices_without_an_application_vertex_get_an_entry_each() -> Result<()> {
        let chip = ChipCoord::new(1, 1);
        let west = RoutingPathEntry::new(Route::from_parts([Link::West], [])?, None);
        let mut by_partition = RoutingTableByPartition::new();
        by_partition.add_path_entry(chip, &source(None, 10), west)?;
        by_partition.add_path_entry(chip, &source(None, 11), west)?;

        let tables = generate_tables(&routing_info()?, &by_partition)?;
        assert_eq!(
            key_masks(&tables, chip)?,
            vec![(0x100, u32::MAX), (0x101, u32::MAX)]
        );
        Ok(())
    }

    #[test]
    fn lone_entries_keep_the_machine_key_and_mask() -> Result<()> {
        let chip = ChipCoord::new(1, 0);
        // Straight through from the west, so the entry is defaultable
        let through = RoutingPathEntry::new(
            Route::from_parts([Link::East], [])?,
            Some(Incoming::Link(Link::West)),
        );
        let mut by_partition = RoutingTableByPartition::new();
        by_partition.add_path_entry(chip, &source(Some(POP), 7), through)?;

        let tables = generate_tables(&routing_info()?, &by_partition)?;
        let table = tables.table(chip).context("No table generated")?;
        assert_eq!(table.len(), 1);
        let entry = &table.entries()[0];
        // The last sibling alone does not spread over the unused top of the block
        assert_eq!((entry.key, entry.mask), (0x70, 0xffff_fff0));
        assert_eq!(entry.route, through.route());
        assert!(entry.defaultable);
        Ok(())
    }
}
