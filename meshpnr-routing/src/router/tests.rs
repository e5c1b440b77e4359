use super::*;
use anyhow::Error;
use approx::assert_relative_eq;
use meshpnr_common::graph::{ApplicationVertexId, MachineVertexId};
use meshpnr_common::machine::MachineDescription;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn find_routing_error(err: &Error) -> Option<&RoutingError> {
    err.chain().find_map(|e| e.downcast_ref::<RoutingError>())
}

fn mesh(width: u32, height: u32) -> Result<Machine> {
    Machine::new(&MachineDescription::mesh(width, height))
}

fn partition_source(vertex: u32) -> PartitionSource {
    PartitionSource {
        app_vertex: Some(ApplicationVertexId(0)),
        identifier: "spikes".into(),
        vertex: MachineVertexId(vertex),
    }
}

fn chips(coords: &[(u32, u32)]) -> BTreeSet<ChipCoord> {
    coords.iter().map(|(x, y)| ChipCoord::new(*x, *y)).collect()
}

/// Route and commit one partition from processor 1 of `source`, delivering to processor 2 of
/// each destination
fn route_and_commit(
    router: &mut dyn MulticastRouter,
    machine: &Machine,
    source: ChipCoord,
    destinations: &BTreeSet<ChipCoord>,
    tables: &mut RoutingTableByPartition,
) -> Result<Vec<(ChipCoord, Link)>> {
    let tree = router.route_partition(machine, source, destinations, tables)?;
    let targets = destinations
        .iter()
        .map(|c| (*c, BTreeSet::from([2u8])))
        .collect();
    let claimed = commit_tree(&tree, &targets, 1, &partition_source(0), tables)?;
    router.claim_links(&claimed)?;
    Ok(claimed)
}

#[test]
fn dijkstra_takes_the_diagonal() -> Result<()> {
    init();
    let machine = mesh(8, 8)?;
    let mut router = DijkstraRouter::new(DijkstraConfig::default());
    let mut tables = RoutingTableByPartition::new();
    let claimed = route_and_commit(
        &mut router,
        &machine,
        ChipCoord::new(0, 0),
        &chips(&[(3, 3)]),
        &mut tables,
    )?;
    assert_eq!(claimed.len(), 3);
    assert!(claimed.iter().all(|(_, link)| *link == Link::NorthEast));

    let source = partition_source(0);
    let first = tables
        .entry(ChipCoord::new(0, 0), &source)
        .context("No entry on the source chip")?;
    assert_eq!(first.incoming(), Some(Incoming::Processor(1)));
    assert!(!first.defaultable());

    let middle = tables
        .entry(ChipCoord::new(1, 1), &source)
        .context("No entry on (1, 1)")?;
    assert_eq!(middle.incoming(), Some(Incoming::Link(Link::SouthWest)));
    assert!(middle.defaultable());

    let last = tables
        .entry(ChipCoord::new(3, 3), &source)
        .context("No entry on the destination")?;
    assert_eq!(last.route().processor_ids(), vec![2]);
    assert_eq!(last.route().n_links(), 0);
    assert_eq!(tables.n_routers(), 4);
    Ok(())
}

#[test]
fn local_destinations_need_no_links() -> Result<()> {
    let machine = mesh(2, 2)?;
    let mut router = DijkstraRouter::new(DijkstraConfig::default());
    let mut tables = RoutingTableByPartition::new();
    let claimed = route_and_commit(
        &mut router,
        &machine,
        ChipCoord::new(1, 1),
        &chips(&[(1, 1)]),
        &mut tables,
    )?;
    assert!(claimed.is_empty());
    let entry = tables
        .entry(ChipCoord::new(1, 1), &partition_source(0))
        .context("No local entry")?;
    assert_eq!(entry.incoming(), Some(Incoming::Processor(1)));
    assert_eq!(entry.route().processor_ids(), vec![2]);
    Ok(())
}

#[test]
fn dead_chips_make_destinations_unreachable() -> Result<()> {
    init();
    let mut desc = MachineDescription::mesh(3, 1);
    desc.dead_chips.push(ChipCoord::new(1, 0));
    let machine = Machine::new(&desc)?;

    for router in [
        &mut DijkstraRouter::new(DijkstraConfig::default()) as &mut dyn MulticastRouter,
        &mut SteinerRouter::new(),
    ] {
        let err = router
            .route_partition(
                &machine,
                ChipCoord::new(0, 0),
                &chips(&[(2, 0)]),
                &RoutingTableByPartition::new(),
            )
            .expect_err("Route found through a dead chip");
        assert_eq!(
            find_routing_error(&err),
            Some(&RoutingError::Unreachable {
                source: ChipCoord::new(0, 0),
                destination: ChipCoord::new(2, 0),
            })
        );
    }
    Ok(())
}

#[test]
fn dead_links_are_routed_around() -> Result<()> {
    let mut desc = MachineDescription::mesh(4, 4);
    desc.dead_links.push((ChipCoord::new(0, 0), Link::East));
    let machine = Machine::new(&desc)?;
    let mut router = DijkstraRouter::new(DijkstraConfig::default());
    let mut tables = RoutingTableByPartition::new();
    let claimed = route_and_commit(
        &mut router,
        &machine,
        ChipCoord::new(0, 0),
        &chips(&[(1, 0)]),
        &mut tables,
    )?;
    assert_eq!(claimed.len(), 2);
    assert!(!claimed.contains(&(ChipCoord::new(0, 0), Link::East)));
    Ok(())
}

#[test]
fn entry_scarcity_and_bandwidth_raise_link_weights() -> Result<()> {
    let machine = mesh(4, 4)?;
    let config = DijkstraConfig {
        l: 1.0,
        m: 1.0,
        ..DijkstraConfig::default()
    };
    let mut router = DijkstraRouter::new(config);
    let mut tables = RoutingTableByPartition::new();
    let (a, b) = (ChipCoord::new(0, 0), ChipCoord::new(1, 0));

    assert_relative_eq!(
        router.link_weight(&machine, &tables, a, Link::East, b)?,
        1.0
    );

    route_and_commit(&mut router, &machine, a, &chips(&[(1, 0)]), &mut tables)?;
    assert_eq!(tables.n_entries(b), 1);
    assert_relative_eq!(router.bandwidth(a, Link::East), 249.99);
    assert_relative_eq!(
        router.link_weight(&machine, &tables, a, Link::East, b)?,
        1.0 + (1.0 / 1023.0 - 1.0 / 1024.0) + (1.0 / 249.99 - 1.0 / 250.0),
        epsilon = 1e-12
    );
    Ok(())
}

#[test]
fn full_routers_and_links_are_errors() -> Result<()> {
    let mut desc = MachineDescription::mesh(2, 2);
    desc.chip.router_entries = 1;
    let machine = Machine::new(&desc)?;
    let mut tables = RoutingTableByPartition::new();
    tables.add_path_entry(
        ChipCoord::new(1, 0),
        &partition_source(7),
        RoutingPathEntry::new(Route::from_parts([], [3])?, None),
    )?;

    let mut router = DijkstraRouter::new(DijkstraConfig {
        l: 1.0,
        ..DijkstraConfig::default()
    });
    let err = router
        .route_partition(&machine, ChipCoord::new(0, 0), &chips(&[(0, 1)]), &tables)
        .expect_err("Routed past a full router");
    assert_eq!(
        find_routing_error(&err),
        Some(&RoutingError::EntriesExhausted {
            chip: ChipCoord::new(1, 0)
        })
    );

    let mut router = DijkstraRouter::new(DijkstraConfig {
        max_bandwidth: 0.02,
        ..DijkstraConfig::default()
    });
    let link = [(ChipCoord::new(0, 0), Link::North)];
    router.claim_links(&link)?;
    let err = router
        .claim_links(&link)
        .expect_err("Link used beyond its bandwidth");
    assert!(matches!(
        find_routing_error(&err),
        Some(RoutingError::BandwidthExhausted { .. })
    ));
    Ok(())
}

#[test]
fn steiner_trees_share_links() -> Result<()> {
    init();
    let machine = mesh(8, 8)?;
    let mut router = SteinerRouter::new();
    let mut tables = RoutingTableByPartition::new();
    let claimed = route_and_commit(
        &mut router,
        &machine,
        ChipCoord::new(0, 0),
        &chips(&[(2, 0), (3, 0), (3, 1)]),
        &mut tables,
    )?;
    // (0,0) -> (1,0) -> (2,0) -> (3,0), with (3,1) branching off at (2,0)
    assert_eq!(claimed.len(), 4);

    let source = partition_source(0);
    let branch = tables
        .entry(ChipCoord::new(2, 0), &source)
        .context("No entry on (2, 0)")?;
    assert_eq!(branch.route().processor_ids(), vec![2]);
    assert_eq!(branch.route().links().collect::<Vec<_>>(), vec![Link::East, Link::NorthEast]);
    assert!(!branch.defaultable());
    let through = tables
        .entry(ChipCoord::new(1, 0), &source)
        .context("No entry on (1, 0)")?;
    assert!(through.defaultable());
    Ok(())
}

#[test]
fn retracing_a_loop_is_detected() -> Result<()> {
    let source = ChipCoord::new(0, 0);
    let (a, b) = (ChipCoord::new(1, 0), ChipCoord::new(2, 0));
    let mut tree = RoutingTree::new(source);
    tree.came_from.insert(a, (b, Link::West));
    tree.came_from.insert(b, (a, Link::East));

    let targets = BTreeMap::from([(a, BTreeSet::from([1u8]))]);
    let err = commit_tree(
        &tree,
        &targets,
        1,
        &partition_source(0),
        &mut RoutingTableByPartition::new(),
    )
    .expect_err("Loop committed");
    assert!(matches!(
        find_routing_error(&err),
        Some(RoutingError::CycleDetected { .. })
    ));
    Ok(())
}
