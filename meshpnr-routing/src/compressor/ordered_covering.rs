//! Ordered covering: entries are kept sorted by generality (number of don't-care bits), and
//! groups of entries with a shared route are replaced by a single more general entry placed
//! below everything it must not shadow.
//!
//! A merge is only taken if it can not change where any key goes. The down-check drops entries
//! from a merge until the merged entry covers nothing further down the table; the up-check drops
//! entries that would move below an entry they currently shadow.

use log::trace;
use std::collections::{BTreeSet, HashMap};

use super::merge_key_and_mask;
use crate::routing_table::{MulticastRoutingEntry, Route};

type KeyMask = (u32, u32);

fn generality(mask: u32) -> u32 {
    mask.count_zeros()
}

fn intersect(a: KeyMask, b: KeyMask) -> bool {
    (a.0 & b.1) == (b.0 & a.1)
}

/// A prospective replacement of `entries` (indices into `table`) with one entry
struct Merge<'a> {
    table: &'a [MulticastRoutingEntry],
    entries: BTreeSet<usize>,
    key: u32,
    mask: u32,
    insertion_index: usize,
}

impl<'a> Merge<'a> {
    fn new(table: &'a [MulticastRoutingEntry], entries: BTreeSet<usize>) -> Self {
        let (key, mask) = entries
            .iter()
            .map(|i| (table[*i].key, table[*i].mask))
            .reduce(merge_key_and_mask)
            .unwrap_or((0, u32::MAX));
        let g = generality(mask);
        let insertion_index = table
            .iter()
            .position(|e| generality(e.mask) > g)
            .unwrap_or(table.len());
        Self {
            table,
            entries,
            key,
            mask,
            insertion_index,
        }
    }

    fn empty(table: &'a [MulticastRoutingEntry]) -> Self {
        Self::new(table, BTreeSet::new())
    }

    fn goodness(&self) -> isize {
        self.entries.len() as isize - 1
    }

    fn without(self, remove: &BTreeSet<usize>) -> Self {
        let table = self.table;
        Self::new(table, self.entries.difference(remove).copied().collect())
    }

    fn apply(
        &self,
        aliases: &mut HashMap<KeyMask, Vec<KeyMask>>,
    ) -> Vec<MulticastRoutingEntry> {
        let mut covered = Vec::new();
        let mut route = Route::empty();
        let mut defaultable = true;
        for i in self.entries.iter() {
            let entry = &self.table[*i];
            route = entry.route;
            defaultable &= entry.defaultable;
            let km = (entry.key, entry.mask);
            match aliases.remove(&km) {
                Some(mut originals) => covered.append(&mut originals),
                None => covered.push(km),
            }
        }
        aliases
            .entry((self.key, self.mask))
            .or_default()
            .extend(covered);

        let merged = MulticastRoutingEntry::new(self.key, self.mask, route, defaultable);
        let mut out = Vec::with_capacity(self.table.len() + 1 - self.entries.len());
        for (i, entry) in self.table.iter().enumerate() {
            if i == self.insertion_index {
                out.push(merged);
            }
            if !self.entries.contains(&i) {
                out.push(*entry);
            }
        }
        if self.insertion_index == self.table.len() {
            out.push(merged);
        }
        out
    }
}

/// Merge entries of `table` until no merge helps. Routes seen by any key are left unchanged
/// under first-match lookup.
pub fn minimise(table: &[MulticastRoutingEntry]) -> Vec<MulticastRoutingEntry> {
    let mut table = table.to_vec();
    table.sort_by_key(|e| generality(e.mask));
    let mut aliases: HashMap<KeyMask, Vec<KeyMask>> = HashMap::new();

    loop {
        let merge = best_merge(&table, &aliases);
        if merge.goodness() <= 0 {
            break;
        }
        trace!(
            "Merging {} entries into {:#010x}/{:#010x}",
            merge.entries.len(),
            merge.key,
            merge.mask
        );
        table = merge.apply(&mut aliases);
    }
    table
}

fn best_merge<'a>(
    table: &'a [MulticastRoutingEntry],
    aliases: &HashMap<KeyMask, Vec<KeyMask>>,
) -> Merge<'a> {
    // Candidate merges: all entries sharing a route, routes in order of first appearance
    let mut by_route: Vec<(Route, BTreeSet<usize>)> = Vec::new();
    for (i, entry) in table.iter().enumerate() {
        match by_route.iter_mut().find(|(r, _)| *r == entry.route) {
            Some((_, entries)) => {
                entries.insert(i);
            }
            None => by_route.push((entry.route, BTreeSet::from([i]))),
        }
    }

    let mut best = Merge::empty(table);
    let mut best_goodness = 0;
    for (_, entries) in by_route {
        let merge = Merge::new(table, entries);
        if merge.goodness() <= best_goodness {
            continue;
        }
        let merge = refine(merge, aliases, best_goodness);
        if merge.goodness() > best_goodness {
            best_goodness = merge.goodness();
            best = merge;
        }
    }
    best
}

fn refine<'a>(
    merge: Merge<'a>,
    aliases: &HashMap<KeyMask, Vec<KeyMask>>,
    min_goodness: isize,
) -> Merge<'a> {
    let merge = down_check(merge, aliases, min_goodness);
    if merge.goodness() <= min_goodness {
        return merge;
    }
    let (merge, changed) = up_check(merge, min_goodness);
    if changed && merge.goodness() > min_goodness {
        // Only the down-check needs repeating: it can only move the merge up the table
        down_check(merge, aliases, min_goodness)
    } else {
        merge
    }
}

/// Drop entries that would end up below an entry they currently shadow
fn up_check(mut merge: Merge<'_>, min_goodness: isize) -> (Merge<'_>, bool) {
    let mut changed = false;
    let members = merge.entries.iter().rev().copied().collect::<Vec<_>>();
    for i in members {
        if i >= merge.insertion_index {
            continue;
        }
        let km = (merge.table[i].key, merge.table[i].mask);
        let shadowed = (i + 1..merge.insertion_index)
            .filter(|j| !merge.entries.contains(j))
            .any(|j| intersect(km, (merge.table[j].key, merge.table[j].mask)));
        if shadowed {
            merge = merge.without(&BTreeSet::from([i]));
            changed = true;
            if merge.goodness() <= min_goodness {
                return (Merge::empty(merge.table), changed);
            }
        }
    }
    (merge, changed)
}

/// Original keys and masks further down the table that the merged entry would catch
fn covered_keys_and_masks(
    merge: &Merge<'_>,
    aliases: &HashMap<KeyMask, Vec<KeyMask>>,
) -> Vec<KeyMask> {
    let mut out = Vec::new();
    for entry in merge.table[merge.insertion_index..].iter() {
        let km = (entry.key, entry.mask);
        let originals = aliases.get(&km).map(|v| v.as_slice()).unwrap_or(&[]);
        let own = [km];
        let originals = if originals.is_empty() { &own[..] } else { originals };
        for original in originals {
            if intersect((merge.key, merge.mask), *original) {
                out.push(*original);
            }
        }
    }
    out
}

/// Drop entries until the merged entry covers none of the entries below it
fn down_check<'a>(
    mut merge: Merge<'a>,
    aliases: &HashMap<KeyMask, Vec<KeyMask>>,
    min_goodness: isize,
) -> Merge<'a> {
    while merge.goodness() > min_goodness {
        let covered = covered_keys_and_masks(&merge, aliases);
        if covered.is_empty() {
            break;
        }

        // The covered entries with the fewest bits we could set in the merge constrain it most
        let settable_of = |mask: u32| mask & !merge.mask;
        let most_stringent = covered
            .iter()
            .map(|(_, mask)| settable_of(*mask).count_ones())
            .min()
            .unwrap_or(0);

        // For each bit we could set to avoid the stringent entries, the entries that would have
        // to leave the merge
        let mut best: Option<BTreeSet<usize>> = None;
        for (key, mask) in covered
            .iter()
            .filter(|(_, mask)| settable_of(*mask).count_ones() == most_stringent)
        {
            let settable = settable_of(*mask);
            for bit in (0..32).map(|b| 1u32 << b).filter(|b| settable & b != 0) {
                // The merge must take the opposite value of the covered key at this bit
                let wanted = !key & bit;
                let remove = merge
                    .entries
                    .iter()
                    .copied()
                    .filter(|i| merge.table[*i].key & bit != wanted)
                    .collect::<BTreeSet<_>>();
                if best.as_ref().map_or(true, |b| remove.len() < b.len()) {
                    best = Some(remove);
                }
            }
        }

        match best {
            Some(remove) if !remove.is_empty() => merge = merge.without(&remove),
            // Nothing to remove means a covered entry can not be avoided
            _ => return Merge::empty(merge.table),
        }
    }

    if merge.goodness() > min_goodness {
        merge
    } else {
        Merge::empty(merge.table)
    }
}
