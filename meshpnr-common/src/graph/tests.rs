use anyhow::{Error, Result};

use super::*;

fn check_chain_for_error(err: &Error, expected: &GraphError) -> bool {
    err.chain()
        .any(|e| e.downcast_ref::<GraphError>().map_or(false, |g| g == expected))
}

fn machine_vertex(app: Option<ApplicationVertexId>, lo: u32, hi: u32) -> Result<MachineVertex> {
    Ok(MachineVertex {
        label: format!("{:?}[{}:{}]", app, lo, hi),
        app_vertex: app,
        index: 0,
        slice: Slice::new(lo, hi)?,
        resources: ResourceRequirements::default(),
        fixed_location: None,
    })
}

#[test]
fn slices_count_atoms_inclusively() -> Result<()> {
    let s = Slice::new(10, 19)?;
    assert_eq!(s.n_atoms(), 10);
    assert_eq!(s.atoms().count(), 10);
    assert!(s.overlaps(&Slice::new(19, 30)?));
    assert!(!s.overlaps(&Slice::new(20, 30)?));

    let single = Slice::new(0, 0)?;
    assert_eq!(single.n_atoms(), 1);

    assert!(Slice::new(5, 4).is_err());
    Ok(())
}

#[test]
fn shaped_slices_must_be_consistent() -> Result<()> {
    let s = Slice::with_shape(0, 11, vec![3, 4], vec![0, 0])?;
    assert_eq!(s.shape(), Some(&[3, 4][..]));

    assert!(Slice::with_shape(0, 11, vec![3, 4], vec![0]).is_err());
    assert!(Slice::with_shape(0, 11, vec![3, 3], vec![0, 0]).is_err());

    let parsed: Result<Slice, _> = serde_json::from_str(r#"{"lo": 4, "hi": 2}"#);
    assert!(parsed.is_err());
    Ok(())
}

#[test]
fn max_atoms_is_the_tightest_bound() {
    let mut v = ApplicationVertex::new("pop", 1000);
    assert_eq!(v.max_atoms_per_core(), u32::MAX);

    v.max_atoms_per_core = Some(256);
    v.constraints.push(Constraint::MaxAtomsPerCore { max: 100 });
    v.constraints.push(Constraint::MaxAtomsPerCore { max: 300 });
    assert_eq!(v.max_atoms_per_core(), 100);
}

#[test]
fn conflicting_chip_constraints_are_rejected() {
    let mut v = ApplicationVertex::new("pop", 10);
    v.constraints.push(Constraint::ChipAndCore { x: 1, y: 1, p: None });
    v.constraints.push(Constraint::ChipAndCore { x: 2, y: 1, p: None });
    assert!(v.fixed_location().is_err());
}

#[test]
fn duplicate_application_labels_fail() -> Result<()> {
    let mut graph = ApplicationGraph::new();
    graph.add_vertex(ApplicationVertex::new("a", 1))?;
    let err = graph
        .add_vertex(ApplicationVertex::new("a", 2))
        .expect_err("Duplicate label unexpectedly accepted");
    assert!(check_chain_for_error(
        &err,
        &GraphError::AlreadyExists("vertex \"a\"".into())
    ));
    Ok(())
}

#[test]
fn edges_group_into_partitions() -> Result<()> {
    let mut graph = MachineGraph::new(1);
    let app = Some(ApplicationVertexId(0));
    let a = graph.add_vertex(machine_vertex(app, 0, 9)?)?;
    let b = graph.add_vertex(machine_vertex(app, 10, 19)?)?;
    let c = graph.add_vertex(machine_vertex(None, 0, 0)?)?;

    graph.add_edge(MachineEdge { pre: a, post: b }, "spikes", TrafficType::Multicast)?;
    graph.add_edge(MachineEdge { pre: a, post: c }, "spikes", TrafficType::Multicast)?;
    graph.add_edge(MachineEdge { pre: a, post: c }, "spikes", TrafficType::Multicast)?;
    graph.add_edge(MachineEdge { pre: a, post: b }, "other", TrafficType::Multicast)?;

    assert_eq!(graph.n_partitions(), 2);
    let spikes = graph
        .outgoing_partition(a, "spikes")
        .expect("spikes partition missing");
    assert_eq!(spikes.destinations(), vec![b, c]);
    assert_eq!(spikes.graph_code(), Some(graph.code()));
    assert_eq!(graph.machine_vertices_of(ApplicationVertexId(0)), &[a, b]);

    assert!(graph
        .add_edge(MachineEdge { pre: a, post: b }, "spikes", TrafficType::Sdram)
        .is_err());
    Ok(())
}

#[test]
fn partitions_have_a_single_owner() -> Result<()> {
    let mut first = MachineGraph::new(0);
    let mut second = MachineGraph::new(0);
    let a1 = first.add_vertex(machine_vertex(None, 0, 0)?)?;
    let a2 = second.add_vertex(machine_vertex(None, 0, 0)?)?;
    assert_eq!(a1, a2);

    let mut partition = EdgePartition::new(a1, "spikes", TrafficType::Multicast);
    partition.register_graph_code(first.code())?;
    // Registering with the same graph again is harmless
    partition.register_graph_code(first.code())?;

    let err = second
        .add_outgoing_edge_partition(partition.clone())
        .expect_err("Second graph unexpectedly accepted partition");
    assert!(check_chain_for_error(
        &err,
        &GraphError::PartitionOwnedByOtherGraph {
            identifier: "spikes".into()
        }
    ));

    first.add_outgoing_edge_partition(partition)?;
    let err = first
        .add_outgoing_edge_partition(EdgePartition::new(a1, "spikes", TrafficType::Multicast))
        .expect_err("Duplicate partition unexpectedly accepted");
    assert!(err.downcast_ref::<GraphError>().is_some());
    Ok(())
}

#[test]
fn unknown_vertices_are_reported() -> Result<()> {
    let mut graph = MachineGraph::new(1);
    let a = graph.add_vertex(machine_vertex(None, 0, 0)?)?;
    assert!(graph
        .add_edge(
            MachineEdge {
                pre: a,
                post: MachineVertexId(7)
            },
            "spikes",
            TrafficType::Multicast
        )
        .is_err());
    assert!(graph
        .add_vertex(machine_vertex(Some(ApplicationVertexId(3)), 0, 0)?)
        .is_err());
    Ok(())
}
