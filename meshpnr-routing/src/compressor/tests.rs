use super::checker::{check_table, CompressionMismatch};
use super::*;
use crate::routing_table::{MulticastRoutingEntry, Route};
use anyhow::Error;
use meshpnr_common::machine::Link;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn route(links: &[Link], processors: &[u8]) -> Result<Route> {
    Route::from_parts(links.iter().copied(), processors.iter().copied())
}

fn table(entries: &[(u32, u32, Route)]) -> MulticastRoutingTable {
    MulticastRoutingTable::with_entries(
        ChipCoord::new(1, 1),
        entries
            .iter()
            .map(|(key, mask, route)| MulticastRoutingEntry::new(*key, *mask, *route, false))
            .collect(),
    )
}

fn key_masks(table: &MulticastRoutingTable) -> Vec<(u32, u32)> {
    table.entries().iter().map(|e| (e.key, e.mask)).collect()
}

fn find_mismatch(err: &Error) -> Option<&CompressionMismatch> {
    err.chain().find_map(|e| e.downcast_ref::<CompressionMismatch>())
}

#[test]
fn merging_drops_differing_bits() {
    assert_eq!(
        merge_key_and_mask((0b0000, 0b1111), (0b1000, 0b1111)),
        (0b0000, 0b0111)
    );
    // A bit one side ignores stays ignored
    assert_eq!(
        merge_key_and_mask((0b0100, 0b1100), (0b0101, 0b1111)),
        (0b0100, 0b1100)
    );
}

#[test]
fn identical_routes_merge_without_absorbing_others() -> Result<()> {
    init();
    let east = route(&[Link::East], &[])?;
    let local = route(&[], &[3])?;
    let original = table(&[
        (0b0000, 0b1111, east),
        (0b1000, 0b1111, east),
        (0b0100, 0b1111, local),
    ]);

    for compressor in [Compressor::OrderedCovering, Compressor::Unordered] {
        let compressed = compress_table(&original, compressor, MAX_ROUTING_ENTRIES)?;
        assert_eq!(compressed.len(), 2, "{:?}", compressor);
        let keys = key_masks(&compressed);
        assert!(keys.contains(&(0b0000, 0b0111)), "{:?}: {:?}", compressor, keys);
        assert!(keys.contains(&(0b0100, 0b1111)), "{:?}: {:?}", compressor, keys);
        assert_eq!(compressed.lookup(0b0100).map(|e| e.route), Some(local));
        assert_eq!(compressed.lookup(0b1000).map(|e| e.route), Some(east));
        check_table(&original, &compressed)?;
    }
    Ok(())
}

#[test]
fn ordered_covering_relies_on_entry_order() -> Result<()> {
    let east = route(&[Link::East], &[])?;
    let north = route(&[Link::North], &[])?;
    // Merging the two east entries gives 0XX0, which also catches the north key
    let original = table(&[
        (0b0000, 0b1111, east),
        (0b0110, 0b1111, east),
        (0b0100, 0b1111, north),
    ]);

    let ordered = compress_table(&original, Compressor::OrderedCovering, MAX_ROUTING_ENTRIES)?;
    assert_eq!(
        key_masks(&ordered),
        vec![(0b0100, 0b1111), (0b0000, 0b1001)]
    );
    assert_eq!(ordered.lookup(0b0100).map(|e| e.route), Some(north));
    assert_eq!(ordered.lookup(0b0110).map(|e| e.route), Some(east));
    check_table(&original, &ordered)?;

    // Without an order to rely on, the merge is refused
    let unordered = compress_table(&original, Compressor::Unordered, MAX_ROUTING_ENTRIES)?;
    assert_eq!(unordered.len(), 3);
    check_table(&original, &unordered)?;
    Ok(())
}

#[test]
fn merges_stop_above_entries_they_would_cover() -> Result<()> {
    let east = route(&[Link::East], &[])?;
    let west = route(&[Link::West], &[])?;
    // The general west entry sits below anything a merge of the east entries could become
    let original = table(&[
        (0b0000, 0b1111, east),
        (0b0001, 0b1111, east),
        (0b0011, 0b1111, east),
        (0b0010, 0b1110, west),
    ]);
    let compressed = compress_table(&original, Compressor::OrderedCovering, MAX_ROUTING_ENTRIES)?;
    check_table(&original, &compressed)?;
    assert_eq!(compressed.lookup(0b0010).map(|e| e.route), Some(west));
    assert_eq!(compressed.lookup(0b0011).map(|e| e.route), Some(east));
    assert!(compressed.len() < original.len());
    Ok(())
}

#[test]
fn sibling_blocks_collapse() -> Result<()> {
    init();
    let east = route(&[Link::East], &[])?;
    let local = route(&[], &[2, 3])?;
    // Sixteen blocks of 256 keys, every fourth one delivered locally
    let entries = (0..16u32)
        .map(|i| {
            let r = if i % 4 == 3 { local } else { east };
            (i << 8, 0xffff_ff00, r)
        })
        .collect::<Vec<_>>();
    let original = table(&entries);

    for compressor in [Compressor::OrderedCovering, Compressor::Unordered] {
        let compressed = compress_table(&original, compressor, MAX_ROUTING_ENTRIES)?;
        check_table(&original, &compressed)?;
        assert!(
            compressed.len() <= 4,
            "{:?} left {} entries",
            compressor,
            compressed.len()
        );
    }
    Ok(())
}

#[test]
fn tables_over_the_limit_fail() -> Result<()> {
    // Every entry has its own route, nothing can merge
    let entries = (0..6u8)
        .map(|p| Ok((u32::from(p) << 4, 0xffff_fff0, route(&[], &[p])?)))
        .collect::<Result<Vec<_>>>()?;
    let original = table(&entries);

    let err = compress_table(&original, Compressor::OrderedCovering, 5)
        .expect_err("Table over the limit accepted");
    assert_eq!(
        err.downcast_ref::<MinimisationFailed>(),
        Some(&MinimisationFailed {
            chip: ChipCoord::new(1, 1),
            n_entries: 6,
            max_entries: 5,
        })
    );

    let mut tables = MulticastRoutingTables::new();
    tables.add_table(original)?;
    let err = compress_tables(&tables, Compressor::None, 5).expect_err("None checks the limit too");
    assert!(err
        .chain()
        .any(|e| e.downcast_ref::<MinimisationFailed>().is_some()));
    Ok(())
}

#[test]
fn checker_spots_changed_and_lost_keys() -> Result<()> {
    let east = route(&[Link::East], &[])?;
    let north = route(&[Link::North], &[])?;
    let original = table(&[(0b0000, 0b1111, east), (0b0100, 0b1111, north)]);

    // Too greedy: the merge swallows the north key
    let greedy = table(&[(0b0000, 0b1011, east)]);
    let err = check_table(&original, &greedy).expect_err("Changed route accepted");
    assert_eq!(
        find_mismatch(&err),
        Some(&CompressionMismatch::RouteChanged {
            chip: ChipCoord::new(1, 1),
            key: 0b0100,
            mask: 0b1111,
            expected: north,
            found: east,
        })
    );

    let lossy = table(&[(0b0000, 0b1111, east)]);
    let err = check_table(&original, &lossy).expect_err("Lost key accepted");
    assert!(matches!(
        find_mismatch(&err),
        Some(CompressionMismatch::KeyLost { key: 0b0100, .. })
    ));

    // Keys shadowed in the original only need their first match preserved
    let shadowed = table(&[
        (0b0000, 0b1111, east),
        (0b0000, 0b1110, north),
    ]);
    let reordered = table(&[(0b0000, 0b1111, east), (0b0001, 0b1111, north)]);
    check_table(&shadowed, &reordered)?;
    Ok(())
}
