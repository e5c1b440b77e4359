//! Keys and masks of the multicast partitions.
//!
//! Every application vertex gets one aligned block of keys per outgoing partition. Inside the
//! block the top bits pick the machine vertex and the bottom `n_bits_atoms` bits pick the atom,
//! which lets the table generator cover runs of sibling machine vertices with a single entry.

mod allocator;


pub use allocator::allocate;

use anyhow::{ensure, Context, Result};
use meshpnr_common::graph::{ApplicationVertexId, MachineGraph, MachineVertexId};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;

use crate::routing_table::{MulticastRoutingEntry, RoutingPathEntry};

#[derive(Debug, PartialEq, Eq)]
pub enum KeyAllocationError {
    /// The blocks do not fit in 32 bits of key space
    KeySpaceExhausted {
        vertex: String,
        partition: String,
        n_bits: u32,
    },
    /// Two fixed keys and masks match common keys
    FixedKeyConflict {
        vertex: String,
        partition: String,
        other: String,
    },
    /// A key with bits set outside its mask, or a fixed mask unable to hold a vertex
    InvalidKeyAndMask { key: u32, mask: u32, reason: String },
}

impl Display for KeyAllocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeySpaceExhausted {
                vertex,
                partition,
                n_bits,
            } => write!(
                f,
                "no space left for the {}-bit key block of partition {:?} of {}",
                n_bits, partition, vertex
            ),
            Self::FixedKeyConflict {
                vertex,
                partition,
                other,
            } => write!(
                f,
                "fixed keys of partition {:?} of {} overlap those of {}",
                partition, vertex, other
            ),
            Self::InvalidKeyAndMask { key, mask, reason } => {
                write!(f, "invalid key {:#010x} mask {:#010x}: {}", key, mask, reason)
            }
        }
    }
}

impl std::error::Error for KeyAllocationError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct KeyAndMask {
    key: u32,
    mask: u32,
}

impl KeyAndMask {
    pub fn new(key: u32, mask: u32) -> Result<Self> {
        ensure!(
            key & !mask == 0,
            KeyAllocationError::InvalidKeyAndMask {
                key,
                mask,
                reason: "key has bits set outside the mask".into(),
            }
        );
        Ok(Self { key, mask })
    }

    /// The aligned block of `2^n_bits` keys starting at `base`
    pub fn block(base: u32, n_bits: u32) -> Result<Self> {
        Self::new(base, low_bits_clear_mask(n_bits))
    }

    #[inline]
    pub fn key(&self) -> u32 {
        self.key
    }

    #[inline]
    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn n_keys(&self) -> u64 {
        1u64 << self.mask.count_zeros()
    }

    #[inline]
    pub fn matches(&self, key: u32) -> bool {
        key & self.mask == self.key
    }

    /// Whether the two match at least one common key
    pub fn overlaps(&self, other: &KeyAndMask) -> bool {
        (self.key ^ other.key) & self.mask & other.mask == 0
    }

    /// The `index`th key matched, counting through the unmasked bits from the bottom up
    pub fn key_at(&self, index: u64) -> u32 {
        let mut key = self.key;
        let mut remaining = index;
        for bit in 0..32 {
            if remaining == 0 {
                break;
            }
            if self.mask & (1 << bit) == 0 {
                if remaining & 1 != 0 {
                    key |= 1 << bit;
                }
                remaining >>= 1;
            }
        }
        key
    }
}

/// Mask with the bottom `n_bits` clear
pub(crate) fn low_bits_clear_mask(n_bits: u32) -> u32 {
    u32::MAX.checked_shl(n_bits).unwrap_or(0)
}

/// Number of bits needed to count `n` things
pub(crate) fn bits_needed(n: u64) -> u32 {
    if n <= 1 {
        0
    } else {
        64 - (n - 1).leading_zeros()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MachineVertexRoutingInfo {
    pub vertex: MachineVertexId,
    pub partition: String,
    pub key_and_mask: KeyAndMask,
    /// Index of the vertex among its application vertex's machine vertices
    pub index: u32,
}

/// The block of an application vertex's partition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppVertexRoutingInfo {
    pub vertex: ApplicationVertexId,
    pub partition: String,
    pub key_and_mask: KeyAndMask,
    /// Mask matching the keys of exactly one machine vertex
    pub machine_mask: u32,
    pub n_bits_atoms: u32,
    pub max_machine_index: u32,
}

impl AppVertexRoutingInfo {
    /// Cover a run of sibling entries sharing one route with as few entries as possible. The
    /// entries must be in index order. Runs that reach the last machine vertex may over-cover
    /// into the unused part of the block.
    pub fn merge_machine_entries(
        &self,
        entries: &[(&MachineVertexRoutingInfo, &RoutingPathEntry)],
    ) -> Vec<MulticastRoutingEntry> {
        let mut out = Vec::new();
        // Indices with gaps between them can not share a mask
        let mut start = 0;
        for i in 1..=entries.len() {
            if i == entries.len() || entries[i].0.index != entries[i - 1].0.index + 1 {
                self.merge_run(&entries[start..i], &mut out);
                start = i;
            }
        }
        out
    }

    fn merge_run(
        &self,
        entries: &[(&MachineVertexRoutingInfo, &RoutingPathEntry)],
        out: &mut Vec<MulticastRoutingEntry>,
    ) {
        let n_entries = entries.len();
        let is_last = entries
            .last()
            .map_or(false, |(info, _)| info.index == self.max_machine_index);

        let mut i = 0;
        while i < n_entries {
            let (info, entry) = entries[i];
            let next_entries = n_sequential_entries(info.index, n_entries);
            if next_entries <= n_entries - i || is_last {
                out.push(self.group_entry(info, entry, next_entries));
                i += next_entries;
            } else {
                let mut entries_to_go = n_entries - i;
                while entries_to_go > 0 {
                    let next_entries = 1 << (usize::BITS - 1 - entries_to_go.leading_zeros());
                    let (info, entry) = entries[i];
                    out.push(self.group_entry(info, entry, next_entries));
                    entries_to_go -= next_entries;
                    i += next_entries;
                }
            }
        }
    }

    fn group_entry(
        &self,
        info: &MachineVertexRoutingInfo,
        entry: &RoutingPathEntry,
        n_entries: usize,
    ) -> MulticastRoutingEntry {
        let spread = ((n_entries - 1) as u32)
            .checked_shl(self.n_bits_atoms)
            .unwrap_or(0);
        MulticastRoutingEntry::new(
            info.key_and_mask.key(),
            self.machine_mask - spread,
            entry.route(),
            entry.defaultable(),
        )
    }
}

/// How many entries starting at `index` can share one mask: the lowest set bit of the index, or
/// for index 0 enough to cover all of them
fn n_sequential_entries(index: u32, n_entries: usize) -> usize {
    if index > 0 {
        (index & index.wrapping_neg()) as usize
    } else {
        n_entries.next_power_of_two()
    }
}

/// Allocated keys of every multicast partition
#[derive(Clone, Debug, Default)]
pub struct RoutingInfo {
    machine: HashMap<(MachineVertexId, String), MachineVertexRoutingInfo>,
    app: HashMap<(ApplicationVertexId, String), AppVertexRoutingInfo>,
}

#[derive(Serialize)]
pub struct RoutingInfoRecord<'a> {
    pub vertex: &'a str,
    pub partition: &'a str,
    pub key: u32,
    pub mask: u32,
}

impl RoutingInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_machine_info(&mut self, info: MachineVertexRoutingInfo) {
        self.machine
            .insert((info.vertex, info.partition.clone()), info);
    }

    pub fn add_app_info(&mut self, info: AppVertexRoutingInfo) {
        self.app.insert((info.vertex, info.partition.clone()), info);
    }

    pub fn machine_info(
        &self,
        vertex: MachineVertexId,
        partition: &str,
    ) -> Result<&MachineVertexRoutingInfo> {
        self.machine
            .get(&(vertex, partition.to_string()))
            .with_context(|| format!("No keys allocated to partition {:?} of {}", partition, vertex))
    }

    pub fn app_info(
        &self,
        vertex: ApplicationVertexId,
        partition: &str,
    ) -> Option<&AppVertexRoutingInfo> {
        self.app.get(&(vertex, partition.to_string()))
    }

    /// Machine-level infos, sorted by vertex then partition
    pub fn machine_infos(&self) -> Vec<&MachineVertexRoutingInfo> {
        let sorted: BTreeMap<_, _> = self
            .machine
            .iter()
            .map(|((v, p), info)| ((*v, p.as_str()), info))
            .collect();
        sorted.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.machine.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machine.is_empty()
    }

    /// Flat listing for the routing info dump, with the vertices named by label
    pub fn records<'a>(&'a self, graph: &'a MachineGraph) -> Result<Vec<RoutingInfoRecord<'a>>> {
        self.machine_infos()
            .into_iter()
            .map(|info| -> Result<RoutingInfoRecord<'a>> {
                Ok(RoutingInfoRecord {
                    vertex: &graph.vertex(info.vertex)?.label,
                    partition: &info.partition,
                    key: info.key_and_mask.key(),
                    mask: info.key_and_mask.mask(),
                })
            })
            .collect()
    }
}
