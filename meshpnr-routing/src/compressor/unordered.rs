use log::trace;

use super::merge_key_and_mask;
use crate::routing_table::{MulticastRoutingEntry, Route};

/// Merge entries sharing a route for as long as the merged entry catches no key of an entry with
/// another route. Tables that start out free of overlaps between routes stay that way.
pub fn minimise(table: &[MulticastRoutingEntry]) -> Vec<MulticastRoutingEntry> {
    // Routes in order of first appearance
    let mut groups: Vec<(Route, Vec<MulticastRoutingEntry>)> = Vec::new();
    for entry in table {
        match groups.iter_mut().find(|(route, _)| *route == entry.route) {
            Some((_, entries)) => entries.push(*entry),
            None => groups.push((entry.route, vec![*entry])),
        }
    }

    for g in 0..groups.len() {
        let mut entries = std::mem::take(&mut groups[g].1);
        let clashes = |candidate: &MulticastRoutingEntry| {
            groups
                .iter()
                .enumerate()
                .filter(|(other, _)| *other != g)
                .flat_map(|(_, (_, others))| others.iter())
                .any(|other| candidate.intersects(other))
        };

        let mut i = 0;
        while i < entries.len() {
            // A merge that clashed can not stop clashing once the entry has grown, so one pass
            // over the later entries is enough
            let mut j = i + 1;
            while j < entries.len() {
                let (key, mask) = merge_key_and_mask(
                    (entries[i].key, entries[i].mask),
                    (entries[j].key, entries[j].mask),
                );
                let merged = MulticastRoutingEntry::new(
                    key,
                    mask,
                    entries[i].route,
                    entries[i].defaultable && entries[j].defaultable,
                );
                if clashes(&merged) {
                    j += 1;
                } else {
                    trace!("Merged {:#010x}/{:#010x}", key, mask);
                    entries[i] = merged;
                    entries.remove(j);
                }
            }
            i += 1;
        }
        groups[g].1 = entries;
    }

    groups.into_iter().flat_map(|(_, entries)| entries).collect()
}
