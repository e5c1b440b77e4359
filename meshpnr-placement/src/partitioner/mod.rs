//! Cuts application vertices into machine vertices small enough for one core each, and expands
//! application edges into machine edges once the machine vertices exist.

mod splitter;


pub use splitter::{Member, SameChipGroup, SplitContext, SplitterExt};

use anyhow::{Context, Result};
use itertools::Itertools;
use log::{debug, info};
use meshpnr_common::graph::{
    ApplicationGraph, ApplicationVertexId, GraphError, MachineEdge, MachineGraph, MachineVertexId,
    ResourceRequirements, Slice, TrafficType,
};
use meshpnr_common::machine::{CoreBudget, Machine};
use std::fmt::Display;

#[derive(Debug, PartialEq, Eq)]
pub enum PartitionError {
    /// Two vertices constrained to the same slices have different atom counts
    SameSizeMismatch {
        vertex: String,
        n_atoms: u32,
        other: String,
        other_n_atoms: u32,
    },
    /// Even a single atom of the vertex does not fit on a core
    TooBigToPlace {
        vertex: String,
        required: ResourceRequirements,
        budget: CoreBudget,
    },
    SliceDoesNotFit {
        vertex: String,
        slice: Slice,
        required: ResourceRequirements,
        budget: CoreBudget,
    },
    InconsistentSlices {
        vertex: String,
        reason: String,
    },
}

impl Display for PartitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SameSizeMismatch {
                vertex,
                n_atoms,
                other,
                other_n_atoms,
            } => write!(
                f,
                "{} ({} atoms) must be sliced like {} ({} atoms), but the atom counts differ",
                vertex, n_atoms, other, other_n_atoms
            ),
            Self::TooBigToPlace {
                vertex,
                required,
                budget,
            } => write!(
                f,
                "one atom of {} needs {} bytes and {} cycles, but a core only has {} bytes and {} cycles",
                vertex, required.sdram, required.cpu_cycles, budget.sdram, budget.cpu_cycles
            ),
            Self::SliceDoesNotFit {
                vertex,
                slice,
                required,
                budget,
            } => write!(
                f,
                "slice {} of {} needs {} bytes and {} cycles, but a core only has {} bytes and {} cycles",
                slice, vertex, required.sdram, required.cpu_cycles, budget.sdram, budget.cpu_cycles
            ),
            Self::InconsistentSlices { vertex, reason } => {
                write!(f, "bad slices for {}: {}", vertex, reason)
            }
        }
    }
}

impl std::error::Error for PartitionError {}

/// Groups of vertices that must share slice boundaries, each in graph order. Vertices without a
/// same-size constraint form a group of their own.
pub fn same_size_groups(app_graph: &ApplicationGraph) -> Result<Vec<Vec<ApplicationVertexId>>> {
    let n = app_graph.n_vertices();
    let mut group_of: Vec<usize> = (0..n).collect();
    let mut groups: Vec<Vec<ApplicationVertexId>> =
        (0..n).map(|i| vec![ApplicationVertexId(i as u32)]).collect();

    for (id, vertex) in app_graph.vertices() {
        for label in vertex.same_atoms_as() {
            let other = app_graph.vertex_by_label(label).ok_or_else(|| {
                GraphError::NotExist(format!(
                    "vertex {:?} named in a same-size constraint of {}",
                    label, vertex.label
                ))
            })?;
            let (a, b) = (group_of[id.0 as usize], group_of[other.0 as usize]);
            if a == b {
                continue;
            }
            let (keep, absorb) = (std::cmp::min(a, b), std::cmp::max(a, b));
            let moved = std::mem::take(&mut groups[absorb]);
            for v in moved.iter() {
                group_of[v.0 as usize] = keep;
            }
            groups[keep].extend(moved);
        }
    }

    let groups = groups
        .into_iter()
        .filter(|g| !g.is_empty())
        .map(|g| g.into_iter().sorted().collect_vec())
        .collect_vec();

    for group in groups.iter() {
        let reference = app_graph.vertex(group[0])?;
        for other in group.iter().skip(1) {
            let other = app_graph.vertex(*other)?;
            if other.n_atoms != reference.n_atoms {
                Err(PartitionError::SameSizeMismatch {
                    vertex: other.label.clone(),
                    n_atoms: other.n_atoms,
                    other: reference.label.clone(),
                    other_n_atoms: reference.n_atoms,
                })?
            }
        }
    }

    Ok(groups)
}

fn n_incoming_atoms(app_graph: &ApplicationGraph, id: ApplicationVertexId) -> Result<u64> {
    app_graph
        .incoming_edges(id)
        .filter(|e| e.traffic == TrafficType::Multicast)
        .map(|e| -> Result<u64> { Ok(app_graph.vertex(e.pre)?.n_atoms as u64) })
        .sum()
}

/// Split every application vertex into machine vertices. Edges are not expanded; see
/// [expand_edges].
pub fn partition(app_graph: &ApplicationGraph, machine: &Machine) -> Result<MachineGraph> {
    let _span = tracing::info_span!("partition", vertices = app_graph.n_vertices()).entered();
    let budget = machine.core_budget();

    let mut slices_of: Vec<Vec<Slice>> = vec![Vec::new(); app_graph.n_vertices()];
    let mut members_of = Vec::with_capacity(app_graph.n_vertices());
    for (id, vertex) in app_graph.vertices() {
        members_of.push(Member {
            id,
            vertex,
            n_incoming_atoms: n_incoming_atoms(app_graph, id)?,
        });
    }

    for group in same_size_groups(app_graph)? {
        let reference = app_graph.vertex(group[0])?;
        let ctx = SplitContext {
            members: group
                .iter()
                .map(|id| Member {
                    id: *id,
                    vertex: members_of[id.0 as usize].vertex,
                    n_incoming_atoms: members_of[id.0 as usize].n_incoming_atoms,
                })
                .collect(),
            budget,
        };
        let slices = if reference.n_atoms == 0 {
            Vec::new()
        } else {
            reference
                .splitter
                .slices(&ctx)
                .with_context(|| format!("Slicing {}", reference.label))?
        };
        debug!(
            "{} and {} same-size partners use {} slices",
            reference.label,
            group.len() - 1,
            slices.len()
        );
        for id in group {
            slices_of[id.0 as usize] = slices.clone();
        }
    }

    let mut graph = MachineGraph::new(app_graph.n_vertices());
    for member in members_of.iter() {
        let vertices = member
            .vertex
            .splitter
            .create_machine_vertices(member, &slices_of[member.id.0 as usize], &budget)
            .with_context(|| format!("Creating machine vertices of {}", member.vertex.label))?;
        for v in vertices {
            graph.add_vertex(v)?;
        }
    }

    info!(
        "Partitioned {} application vertices into {} machine vertices",
        app_graph.n_vertices(),
        graph.n_vertices()
    );
    Ok(graph)
}

/// Add the machine edges leaving `source`, one per machine vertex of each target application
/// vertex that takes in traffic.
pub fn expand_edges(
    app_graph: &ApplicationGraph,
    graph: &mut MachineGraph,
    source: MachineVertexId,
) -> Result<()> {
    let app = match graph.vertex(source)?.app_vertex {
        Some(app) => app,
        None => return Ok(()),
    };
    let pre = app_graph.vertex(app)?;

    let mut new_edges = Vec::new();
    for edge in app_graph.outgoing_edges(app) {
        let post = app_graph.vertex(edge.post)?;
        for (target, _) in post.splitter.incoming_slices(graph, edge.post)? {
            new_edges.push((MachineEdge { pre: source, post: target }, edge, &post.label));
        }
    }
    for (machine_edge, edge, post_label) in new_edges {
        graph
            .add_edge(machine_edge, &edge.partition, edge.traffic)
            .with_context(|| format!("Expanding edge {} -> {}", pre.label, post_label))?;
    }
    Ok(())
}
