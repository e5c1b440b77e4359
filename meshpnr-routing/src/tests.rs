use super::*;
use compressor::MinimisationFailed;
use meshpnr_common::design::{EdgeDescription, ProblemDescription};
use meshpnr_common::graph::{ApplicationVertex, ApplicationVertexId, Constraint, TrafficType};
use meshpnr_common::machine::MachineDescription;
use meshpnr_placement::config::PlacerConfig;
use meshpnr_placement::place_design;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn population(label: &str, n_atoms: u32) -> ApplicationVertex {
    let mut v = ApplicationVertex::new(label, n_atoms);
    v.max_atoms_per_core = Some(100);
    v
}

/// Two populations of 1000 atoms joined by one edge, on an 8x8 mesh of chips with 16 user cores
/// and 128MB of SDRAM
fn round_trip_problem(pre: ApplicationVertex, post: ApplicationVertex) -> ProblemDescription {
    let mut machine = MachineDescription::mesh(8, 8);
    machine.chip.n_processors = 17;
    machine.chip.n_monitors = 1;
    machine.chip.sdram = 128 * 1024 * 1024;
    ProblemDescription {
        machine,
        edges: vec![EdgeDescription {
            pre: pre.label.clone(),
            post: post.label.clone(),
            partition: "spikes".into(),
            traffic: TrafficType::Multicast,
        }],
        vertices: vec![pre, post],
        reserved_cores: Vec::new(),
    }
}

fn placed_round_trip() -> Result<PlacedDesign> {
    let problem = round_trip_problem(population("pre", 1000), population("post", 1000));
    place_design(&problem, &PlacerConfig::default())
}

#[test]
fn round_trip() -> Result<()> {
    init();
    let design = placed_round_trip()?;
    let graph = &design.machine_graph;
    assert_eq!(graph.n_vertices(), 20);
    let pre = graph.machine_vertices_of(ApplicationVertexId(0));
    let post = graph.machine_vertices_of(ApplicationVertexId(1));
    assert_eq!(pre.len(), 10);
    assert_eq!(post.len(), 10);

    for router in [RouterKind::Dijkstra, RouterKind::Steiner] {
        for compressor in [Compressor::OrderedCovering, Compressor::Unordered] {
            let options = RoutingOptions {
                router,
                compressor,
                ..RoutingOptions::default()
            };
            let routed = route_design(&design, &options)?;
            assert_eq!(routed.routing_info.len(), 10);
            assert!(routed.tables.max_entries() <= MAX_ROUTING_ENTRIES);
            assert!(routed.tables.n_entries() <= routed.uncompressed.n_entries());

            // Every pre slice reaches every post slice's core
            for source in pre.iter() {
                let key_and_mask = routed
                    .routing_info
                    .machine_info(*source, "spikes")?
                    .key_and_mask;
                for target in post.iter() {
                    let placement = design.placements.placement_of(*target)?;
                    let entry = routed
                        .tables
                        .table(placement.chip())
                        .and_then(|t| t.lookup(key_and_mask.key()))
                        .with_context(|| {
                            format!("{:?} has no entry for {}", router, placement.chip())
                        })?;
                    assert!(
                        entry.route.processors().any(|p| p == placement.p),
                        "{:?}/{:?}: {} misses core {}",
                        router,
                        compressor,
                        placement.chip(),
                        placement.p
                    );
                }
            }
        }
    }
    Ok(())
}

#[test]
fn placed_designs_survive_serialization() -> Result<()> {
    let design = placed_round_trip()?;
    let text = serde_json::to_string(&design)?;
    let reloaded: PlacedDesign = serde_json::from_str(&text)?;

    let options = RoutingOptions::default();
    let first = serde_json::to_value(&route_design(&design, &options)?.tables)?;
    let second = serde_json::to_value(&route_design(&reloaded, &options)?.tables)?;
    assert_eq!(first, second);

    let tables = first.as_array().context("Tables are not a list")?;
    assert!(!tables.is_empty());
    let entry = &tables[0]["entries"][0];
    for field in ["key", "mask", "link_ids", "processor_ids", "defaultable"] {
        assert!(entry.get(field).is_some(), "Entry has no {}", field);
    }
    Ok(())
}

#[test]
fn fixed_keys_reach_the_tables() -> Result<()> {
    let mut pre = population("pre", 1000);
    pre.constraints.push(Constraint::FixedKeyAndMask {
        key: 0x4000_0000,
        mask: 0xffff_f800,
        partition: None,
    });
    let problem = round_trip_problem(pre, population("post", 1000));
    let design = place_design(&problem, &PlacerConfig::default())?;
    let routed = route_design(&design, &RoutingOptions::default())?;

    let first = design.machine_graph.machine_vertices_of(ApplicationVertexId(0))[0];
    let key_and_mask = routed.routing_info.machine_info(first, "spikes")?.key_and_mask;
    assert_eq!(key_and_mask.key(), 0x4000_0000);
    assert!(routed
        .tables
        .iter()
        .flat_map(|t| t.entries().iter())
        .all(|e| e.key & 0xffff_f800 == 0x4000_0000));
    Ok(())
}

#[test]
fn tables_too_big_for_the_router_fail() -> Result<()> {
    let design = placed_round_trip()?;
    let options = RoutingOptions {
        compressor: Compressor::None,
        max_entries: 0,
        ..RoutingOptions::default()
    };
    let err = match route_design(&design, &options) {
        Ok(_) => anyhow::bail!("Tables fit in routers without entries"),
        Err(err) => err,
    };
    assert!(err
        .chain()
        .any(|e| e.downcast_ref::<MinimisationFailed>().is_some()));
    Ok(())
}
