//! Routing table minimisation, so that every chip's table fits its router.

pub mod checker;
mod ordered_covering;
mod unordered;

#[cfg(test)]
mod tests;

use anyhow::{bail, Context, Result};
use log::{debug, info};
use meshpnr_common::machine::ChipCoord;
use std::fmt::Display;
use std::str::FromStr;

use crate::routing_table::{MulticastRoutingTable, MulticastRoutingTables};

/// Entries a router can hold
pub const MAX_ROUTING_ENTRIES: usize = 1023;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compressor {
    /// Order sensitive merging, the result relies on first-match lookup
    OrderedCovering,
    /// Merges only entries with the same route whose union catches no other route's keys, so
    /// the result can be looked up in any order
    Unordered,
    /// Keep tables as generated
    None,
}

impl FromStr for Compressor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ordered-covering" => Ok(Self::OrderedCovering),
            "unordered" => Ok(Self::Unordered),
            "none" => Ok(Self::None),
            _ => bail!("Unknown compressor {:?}", s),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct MinimisationFailed {
    pub chip: ChipCoord,
    pub n_entries: usize,
    pub max_entries: usize,
}

impl Display for MinimisationFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "the table of {} still has {} entries after compression, the router holds {}",
            self.chip, self.n_entries, self.max_entries
        )
    }
}

impl std::error::Error for MinimisationFailed {}

/// Key and mask of the narrowest entry matching every key either input matches. A bit stays
/// fixed only where both masks fix it and both keys agree.
pub(crate) fn merge_key_and_mask(a: (u32, u32), b: (u32, u32)) -> (u32, u32) {
    let any_ones = a.0 | b.0;
    let all_ones = a.0 & b.0;
    let all_selected = a.1 & b.1;
    let new_xs = any_ones ^ !all_ones;
    let mask = all_selected & new_xs;
    (all_ones & mask, mask)
}

pub fn compress_table(
    table: &MulticastRoutingTable,
    compressor: Compressor,
    max_entries: usize,
) -> Result<MulticastRoutingTable> {
    let entries = match compressor {
        Compressor::OrderedCovering => ordered_covering::minimise(table.entries()),
        Compressor::Unordered => unordered::minimise(table.entries()),
        Compressor::None => table.entries().to_vec(),
    };
    debug!(
        "Compressed the table of {} from {} to {} entries",
        table.chip(),
        table.len(),
        entries.len()
    );
    if entries.len() > max_entries {
        Err(MinimisationFailed {
            chip: table.chip(),
            n_entries: entries.len(),
            max_entries,
        })?
    }
    Ok(MulticastRoutingTable::with_entries(table.chip(), entries))
}

pub fn compress_tables(
    tables: &MulticastRoutingTables,
    compressor: Compressor,
    max_entries: usize,
) -> Result<MulticastRoutingTables> {
    let mut out = MulticastRoutingTables::new();
    for table in tables.iter() {
        let compressed = compress_table(table, compressor, max_entries)
            .with_context(|| format!("Compressing the table of {}", table.chip()))?;
        out.add_table(compressed)?;
    }
    info!(
        "Compressed {} entries to {}, at most {} on one chip",
        tables.n_entries(),
        out.n_entries(),
        out.max_entries()
    );
    Ok(out)
}
