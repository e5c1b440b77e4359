//! Checks that a compressed table sends every key the original table routes the same way.
//!
//! Keys are handled as ternary regions (a key and the mask of its fixed bits). A region is split
//! on one free bit whenever an entry only partly covers it, so the work is bounded by the number
//! of entries rather than the number of keys.

use anyhow::{bail, Context, Result};
use log::debug;
use meshpnr_common::machine::ChipCoord;
use std::fmt::Display;

use crate::routing_table::{
    MulticastRoutingEntry, MulticastRoutingTable, MulticastRoutingTables, Route,
};

#[derive(Debug, PartialEq, Eq)]
pub enum CompressionMismatch {
    /// Keys the original table routes match nothing in the compressed one
    KeyLost { chip: ChipCoord, key: u32, mask: u32 },
    RouteChanged {
        chip: ChipCoord,
        key: u32,
        mask: u32,
        expected: Route,
        found: Route,
    },
    MissingTable { chip: ChipCoord },
}

impl Display for CompressionMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyLost { chip, key, mask } => write!(
                f,
                "keys {:#010x}/{:#010x} are no longer routed by {}",
                key, mask, chip
            ),
            Self::RouteChanged {
                chip,
                key,
                mask,
                expected,
                found,
            } => write!(
                f,
                "keys {:#010x}/{:#010x} go to {} on {} instead of {}",
                key, mask, found, chip, expected
            ),
            Self::MissingTable { chip } => write!(f, "no compressed table for {}", chip),
        }
    }
}

impl std::error::Error for CompressionMismatch {}

#[derive(Clone, Copy, Debug)]
struct Region {
    key: u32,
    mask: u32,
}

impl Region {
    fn intersects(&self, entry: &MulticastRoutingEntry) -> bool {
        (self.key & entry.mask) == (entry.key & self.mask)
    }

    fn covered_by(&self, entry: &MulticastRoutingEntry) -> bool {
        entry.mask & !self.mask == 0 && self.key & entry.mask == entry.key
    }

    /// Halves on the lowest bit `entry` fixes and the region leaves free
    fn split(&self, entry: &MulticastRoutingEntry) -> Option<[Region; 2]> {
        let free = entry.mask & !self.mask;
        if free == 0 {
            return None;
        }
        let bit = 1 << free.trailing_zeros();
        let mask = self.mask | bit;
        Some([
            Region {
                key: self.key & !bit,
                mask,
            },
            Region {
                key: self.key | bit,
                mask,
            },
        ])
    }
}

pub fn check_table(
    original: &MulticastRoutingTable,
    compressed: &MulticastRoutingTable,
) -> Result<()> {
    let chip = original.chip();
    let entries = original.entries();
    for (i, entry) in entries.iter().enumerate() {
        let earlier = &entries[..i];
        let mut pending = vec![Region {
            key: entry.key & entry.mask,
            mask: entry.mask,
        }];

        while let Some(region) = pending.pop() {
            // Keys caught by an earlier entry are that entry's business
            match earlier.iter().find(|e| region.intersects(e)) {
                Some(e) if region.covered_by(e) => continue,
                Some(e) => {
                    match region.split(e) {
                        Some(halves) => pending.extend(halves),
                        None => bail!("Region {:?} can not be split on {:?}", region, e),
                    }
                    continue;
                }
                None => {}
            }

            match compressed.entries().iter().find(|c| region.intersects(c)) {
                None => Err(CompressionMismatch::KeyLost {
                    chip,
                    key: region.key,
                    mask: region.mask,
                })?,
                Some(c) if region.covered_by(c) => {
                    if c.route != entry.route {
                        Err(CompressionMismatch::RouteChanged {
                            chip,
                            key: region.key,
                            mask: region.mask,
                            expected: entry.route,
                            found: c.route,
                        })?
                    }
                }
                Some(c) => match region.split(c) {
                    Some(halves) => pending.extend(halves),
                    None => bail!("Region {:?} can not be split on {:?}", region, c),
                },
            }
        }
    }
    Ok(())
}

pub fn check_tables(
    original: &MulticastRoutingTables,
    compressed: &MulticastRoutingTables,
) -> Result<()> {
    for table in original.iter() {
        let chip = table.chip();
        let other = match compressed.table(chip) {
            Some(other) => other,
            None => Err(CompressionMismatch::MissingTable { chip })?,
        };
        check_table(table, other)
            .with_context(|| format!("Checking the compressed table of {}", chip))?;
    }
    debug!("Checked {} compressed tables", original.len());
    Ok(())
}
