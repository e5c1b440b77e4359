//! Multicast routing tables, both in their final per-chip form and in the per-partition form the
//! routers build them in.

use anyhow::{bail, ensure, Result};
use meshpnr_common::graph::{ApplicationVertexId, MachineVertexId};
use meshpnr_common::machine::{ChipCoord, Link, ALL_LINKS};
use meshpnr_common::{LINKS_PER_ROUTER, MAX_PROCESSORS_PER_CHIP};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt::Display;

use crate::router::RoutingError;

/// Where a router copies a packet to. Bit `l` is link `l`, bit `6 + p` is processor `p`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Route(u32);

impl Route {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn from_parts(
        links: impl IntoIterator<Item = Link>,
        processors: impl IntoIterator<Item = u8>,
    ) -> Result<Self> {
        let mut route = Self::empty();
        for link in links {
            route.add_link(link);
        }
        for p in processors {
            route.add_processor(p)?;
        }
        Ok(route)
    }

    pub fn add_link(&mut self, link: Link) {
        self.0 |= 1 << link.id();
    }

    pub fn add_processor(&mut self, p: u8) -> Result<()> {
        ensure!(
            p < MAX_PROCESSORS_PER_CHIP,
            "Processor {} can not be routed to, routers address at most {} processors",
            p,
            MAX_PROCESSORS_PER_CHIP
        );
        self.0 |= 1 << (LINKS_PER_ROUTER + p);
        Ok(())
    }

    #[inline]
    pub fn has_link(self, link: Link) -> bool {
        self.0 & (1 << link.id()) != 0
    }

    pub fn links(self) -> impl Iterator<Item = Link> {
        ALL_LINKS.into_iter().filter(move |l| self.has_link(*l))
    }

    pub fn processors(self) -> impl Iterator<Item = u8> {
        (0..MAX_PROCESSORS_PER_CHIP).filter(move |p| self.0 & (1 << (LINKS_PER_ROUTER + p)) != 0)
    }

    pub fn link_ids(self) -> Vec<u8> {
        self.links().map(|l| l.id()).collect()
    }

    pub fn processor_ids(self) -> Vec<u8> {
        self.processors().collect()
    }

    pub fn n_links(self) -> u32 {
        (self.0 & ((1 << LINKS_PER_ROUTER) - 1)).count_ones()
    }

    pub fn n_processors(self) -> u32 {
        (self.0 >> LINKS_PER_ROUTER).count_ones()
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: Route) -> Route {
        Route(self.0 | other.0)
    }
}

impl Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "links {:?} processors {:?}",
            self.link_ids(),
            self.processor_ids()
        )
    }
}

/// A single `(key, mask) -> route` rule. A key matches when `key & mask == self.key`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MulticastRoutingEntry {
    pub key: u32,
    pub mask: u32,
    pub route: Route,
    /// The entry only passes packets straight through, so a router could do without it
    pub defaultable: bool,
}

impl MulticastRoutingEntry {
    pub fn new(key: u32, mask: u32, route: Route, defaultable: bool) -> Self {
        Self {
            key,
            mask,
            route,
            defaultable,
        }
    }

    #[inline]
    pub fn matches(&self, key: u32) -> bool {
        key & self.mask == self.key
    }

    /// Whether some key is matched by both entries
    #[inline]
    pub fn intersects(&self, other: &MulticastRoutingEntry) -> bool {
        (self.key & other.mask) == (other.key & self.mask)
    }
}

#[derive(Serialize)]
struct EntryRecord {
    key: u32,
    mask: u32,
    link_ids: Vec<u8>,
    processor_ids: Vec<u8>,
    defaultable: bool,
}

impl Serialize for MulticastRoutingEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        EntryRecord {
            key: self.key,
            mask: self.mask,
            link_ids: self.route.link_ids(),
            processor_ids: self.route.processor_ids(),
            defaultable: self.defaultable,
        }
        .serialize(serializer)
    }
}

/// The ordered entries of one chip's router. Lookup takes the first matching entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MulticastRoutingTable {
    chip: ChipCoord,
    entries: Vec<MulticastRoutingEntry>,
}

impl MulticastRoutingTable {
    pub fn new(chip: ChipCoord) -> Self {
        Self::with_entries(chip, Vec::new())
    }

    pub fn with_entries(chip: ChipCoord, entries: Vec<MulticastRoutingEntry>) -> Self {
        Self { chip, entries }
    }

    pub fn chip(&self) -> ChipCoord {
        self.chip
    }

    pub fn entries(&self) -> &[MulticastRoutingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add_entry(&mut self, entry: MulticastRoutingEntry) {
        self.entries.push(entry);
    }

    pub fn lookup(&self, key: u32) -> Option<&MulticastRoutingEntry> {
        self.entries.iter().find(|e| e.matches(key))
    }
}

impl Serialize for MulticastRoutingTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct TableRecord<'a> {
            x: u32,
            y: u32,
            entries: &'a [MulticastRoutingEntry],
        }

        TableRecord {
            x: self.chip.x,
            y: self.chip.y,
            entries: &self.entries,
        }
        .serialize(serializer)
    }
}

/// One table per chip that has any entries, in chip order
#[derive(Clone, Debug, Default)]
pub struct MulticastRoutingTables {
    tables: BTreeMap<ChipCoord, MulticastRoutingTable>,
}

impl MulticastRoutingTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, table: MulticastRoutingTable) -> Result<()> {
        if self.tables.contains_key(&table.chip) {
            bail!("A routing table for {} already exists", table.chip);
        }
        self.tables.insert(table.chip, table);
        Ok(())
    }

    pub fn table(&self, chip: ChipCoord) -> Option<&MulticastRoutingTable> {
        self.tables.get(&chip)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MulticastRoutingTable> {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.iter().map(|t| t.len()).max().unwrap_or(0)
    }

    pub fn n_entries(&self) -> usize {
        self.iter().map(|t| t.len()).sum()
    }
}

impl Serialize for MulticastRoutingTables {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.tables.values())
    }
}

/// Where a partition's packets enter a chip
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Incoming {
    Link(Link),
    Processor(u8),
}

/// What one partition's routing tree does on one chip
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoutingPathEntry {
    route: Route,
    incoming: Option<Incoming>,
}

impl RoutingPathEntry {
    pub fn new(route: Route, incoming: Option<Incoming>) -> Self {
        Self { route, incoming }
    }

    pub fn route(&self) -> Route {
        self.route
    }

    pub fn incoming(&self) -> Option<Incoming> {
        self.incoming
    }

    /// A packet arriving on a link and leaving on the opposite link with no local delivery is
    /// what a router does with unmatched packets anyway
    pub fn defaultable(&self) -> bool {
        let incoming = match self.incoming {
            Some(Incoming::Link(link)) => link,
            _ => return false,
        };
        if self.route.n_processors() != 0 || self.route.n_links() != 1 {
            return false;
        }
        self.route.has_link(incoming.opposite())
    }

    /// Combine two entries of the same partition on the same chip
    pub fn merge(
        &self,
        other: &RoutingPathEntry,
        chip: ChipCoord,
        partition: &str,
    ) -> Result<RoutingPathEntry> {
        let incoming = match (self.incoming, other.incoming) {
            (Some(a), Some(b)) if a != b => Err(RoutingError::ConflictingEntry {
                chip,
                partition: partition.into(),
                existing: format!("{:?}", a),
                new: format!("{:?}", b),
            })?,
            (a, b) => a.or(b),
        };
        Ok(RoutingPathEntry {
            route: self.route.union(other.route),
            incoming,
        })
    }
}

/// Identifies a partition's entries on a chip. The ordering keeps the partitions of the machine
/// vertices of one application vertex next to each other, in slice order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionSource {
    pub app_vertex: Option<ApplicationVertexId>,
    pub identifier: String,
    pub vertex: MachineVertexId,
}

/// The routers' output: for every chip, the path entry of each partition passing through it
#[derive(Clone, Debug, Default)]
pub struct RoutingTableByPartition {
    chips: BTreeMap<ChipCoord, BTreeMap<PartitionSource, RoutingPathEntry>>,
}

impl RoutingTableByPartition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, merging it with any entry the partition already has on the chip
    pub fn add_path_entry(
        &mut self,
        chip: ChipCoord,
        source: &PartitionSource,
        entry: RoutingPathEntry,
    ) -> Result<()> {
        let entries = self.chips.entry(chip).or_default();
        let merged = match entries.get(source) {
            Some(existing) => existing.merge(&entry, chip, &source.identifier)?,
            None => entry,
        };
        entries.insert(source.clone(), merged);
        Ok(())
    }

    pub fn entries_for_chip(
        &self,
        chip: ChipCoord,
    ) -> impl Iterator<Item = (&PartitionSource, &RoutingPathEntry)> {
        self.chips.get(&chip).into_iter().flatten()
    }

    pub fn entry(&self, chip: ChipCoord, source: &PartitionSource) -> Option<&RoutingPathEntry> {
        self.chips.get(&chip).and_then(|e| e.get(source))
    }

    pub fn n_entries(&self, chip: ChipCoord) -> usize {
        self.chips.get(&chip).map_or(0, |e| e.len())
    }

    pub fn chips(&self) -> impl Iterator<Item = ChipCoord> + '_ {
        self.chips.keys().copied()
    }

    pub fn n_routers(&self) -> usize {
        self.chips.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_bits_split_links_and_processors() -> Result<()> {
        let route = Route::from_parts([Link::West, Link::East], [0, 17])?;
        assert_eq!(route.link_ids(), vec![0, 3]);
        assert_eq!(route.processor_ids(), vec![0, 17]);
        assert_eq!(route.n_links(), 2);
        assert_eq!(route.n_processors(), 2);
        assert!(Route::from_parts([], [18]).is_err());
        Ok(())
    }

    #[test]
    fn straight_through_entries_are_defaultable() -> Result<()> {
        let east = Route::from_parts([Link::East], [])?;
        let through = RoutingPathEntry::new(east, Some(Incoming::Link(Link::West)));
        assert!(through.defaultable());

        let turn = RoutingPathEntry::new(east, Some(Incoming::Link(Link::South)));
        assert!(!turn.defaultable());

        let local = RoutingPathEntry::new(
            Route::from_parts([Link::East], [3])?,
            Some(Incoming::Link(Link::West)),
        );
        assert!(!local.defaultable());

        let from_core = RoutingPathEntry::new(east, Some(Incoming::Processor(1)));
        assert!(!from_core.defaultable());
        Ok(())
    }

    #[test]
    fn merging_requires_one_incoming_direction() -> Result<()> {
        let chip = ChipCoord::new(1, 1);
        let source = PartitionSource {
            app_vertex: Some(ApplicationVertexId(0)),
            identifier: "spikes".into(),
            vertex: MachineVertexId(4),
        };
        let mut tables = RoutingTableByPartition::new();
        tables.add_path_entry(
            chip,
            &source,
            RoutingPathEntry::new(Route::from_parts([Link::East], [])?, Some(Incoming::Link(Link::West))),
        )?;
        tables.add_path_entry(
            chip,
            &source,
            RoutingPathEntry::new(Route::from_parts([Link::North], [2])?, None),
        )?;
        let merged = tables.entry(chip, &source).copied();
        assert_eq!(
            merged,
            Some(RoutingPathEntry::new(
                Route::from_parts([Link::East, Link::North], [2])?,
                Some(Incoming::Link(Link::West))
            ))
        );

        let err = tables
            .add_path_entry(
                chip,
                &source,
                RoutingPathEntry::new(Route::empty(), Some(Incoming::Processor(1))),
            )
            .expect_err("Second incoming direction accepted");
        assert!(matches!(
            err.downcast_ref::<RoutingError>(),
            Some(RoutingError::ConflictingEntry { .. })
        ));
        Ok(())
    }

    #[test]
    fn lookup_takes_the_first_match() {
        let mut table = MulticastRoutingTable::new(ChipCoord::new(0, 0));
        let a = Route(1);
        let b = Route(2);
        table.add_entry(MulticastRoutingEntry::new(0b0000, 0b1100, a, false));
        table.add_entry(MulticastRoutingEntry::new(0b0000, 0b0000, b, false));
        assert_eq!(table.lookup(0b0011).map(|e| e.route), Some(a));
        assert_eq!(table.lookup(0b0100).map(|e| e.route), Some(b));
    }
}
