//! Application and machine graphs.
//!
//! An [ApplicationVertex] is a population of atoms. The partitioner splits it into
//! [MachineVertex]s, each owning a contiguous [Slice] of those atoms and small enough for one
//! core. Machine vertices live in an arena inside the [MachineGraph] and are referred to by
//! [MachineVertexId]; application vertices are referred to by [ApplicationVertexId].

mod machine_graph;
mod slice;

#[cfg(test)]
mod tests;

pub use machine_graph::{EdgePartition, MachineEdge, MachineGraph, MachineVertex};
pub use slice::Slice;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::ops::Add;

use crate::machine::{ChipCoord, CoreBudget};

#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplicationVertexId(pub u32);

#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MachineVertexId(pub u32);

impl Display for MachineVertexId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "mv{}", self.0)
    }
}

/// Error generated when a graph is built inconsistently
#[derive(Debug, PartialEq, Eq)]
pub enum GraphError {
    InvalidParameter(String),
    AlreadyExists(String),
    NotExist(String),
    /// A partition can only ever belong to the graph it was first added to
    PartitionOwnedByOtherGraph { identifier: String },
}

impl Display for GraphError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidParameter(s) => write!(f, "invalid parameter: {}", s),
            Self::AlreadyExists(s) => write!(f, "{} already exists", s),
            Self::NotExist(s) => write!(f, "{} does not exist", s),
            Self::PartitionOwnedByOtherGraph { identifier } => write!(
                f,
                "illegal attempt to add partition {:?} to a second graph",
                identifier
            ),
        }
    }
}

impl std::error::Error for GraphError {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cores: u32,
    pub sdram: u64,
    pub cpu_cycles: u64,
}

impl ResourceRequirements {
    /// Whether a single core can host these requirements
    pub fn fits_core(&self, budget: &CoreBudget) -> bool {
        self.cores <= 1 && self.sdram <= budget.sdram && self.cpu_cycles <= budget.cpu_cycles
    }
}

impl Add for ResourceRequirements {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            cores: self.cores + rhs.cores,
            sdram: self.sdram + rhs.sdram,
            cpu_cycles: self.cpu_cycles + rhs.cpu_cycles,
        }
    }
}

/// Linear model of what a slice of an application vertex costs to run on one core.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    pub fixed_sdram: u64,
    pub sdram_per_atom: u64,
    /// Charged once per (incoming source atom, local atom) pair
    pub sdram_per_synapse: u64,
    pub fixed_cpu_cycles: u64,
    pub cpu_cycles_per_atom: u64,
}

impl CostModel {
    pub fn resources(&self, n_atoms: u32, n_incoming_atoms: u64) -> ResourceRequirements {
        let n_atoms = n_atoms as u64;
        ResourceRequirements {
            cores: 1,
            sdram: self.fixed_sdram
                + self.sdram_per_atom * n_atoms
                + self.sdram_per_synapse * n_incoming_atoms * n_atoms,
            cpu_cycles: self.fixed_cpu_cycles + self.cpu_cycles_per_atom * n_atoms,
        }
    }
}

/// How an application vertex is cut into machine vertices.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Splitter {
    /// Largest slices that fit the per-core budget, capped by the max atoms per core
    Legacy,
    /// Slices of exactly `atoms_per_core` atoms (the last one may be shorter)
    FixedSlice { atoms_per_core: u32 },
    /// Slices chosen by the application. With `same_chip` all of them must share one chip.
    ApplicationDefined {
        slices: Vec<(u32, u32)>,
        #[serde(default)]
        same_chip: bool,
    },
}

impl Default for Splitter {
    fn default() -> Self {
        Splitter::Legacy
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Constraint {
    MaxAtomsPerCore { max: u32 },
    /// Use exactly the same slices as the named vertex
    SameAtomsAs { vertex: String },
    /// Place every machine vertex on the given chip, optionally on a given core
    ChipAndCore { x: u32, y: u32, p: Option<u8> },
    /// Use this key and mask for the vertex's outgoing partitions (all of them, or just the
    /// named one)
    FixedKeyAndMask {
        key: u32,
        mask: u32,
        #[serde(default)]
        partition: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedLocation {
    pub chip: ChipCoord,
    pub core: Option<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApplicationVertex {
    pub label: String,
    pub n_atoms: u32,
    #[serde(default)]
    pub max_atoms_per_core: Option<u32>,
    #[serde(default)]
    pub cost: CostModel,
    #[serde(default)]
    pub splitter: Splitter,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl ApplicationVertex {
    pub fn new(label: impl Into<String>, n_atoms: u32) -> Self {
        Self {
            label: label.into(),
            n_atoms,
            max_atoms_per_core: None,
            cost: CostModel::default(),
            splitter: Splitter::default(),
            constraints: Vec::new(),
        }
    }

    /// Smallest of the vertex's own bound and any [Constraint::MaxAtomsPerCore]
    pub fn max_atoms_per_core(&self) -> u32 {
        self.constraints
            .iter()
            .filter_map(|c| match c {
                Constraint::MaxAtomsPerCore { max } => Some(*max),
                _ => None,
            })
            .chain(self.max_atoms_per_core)
            .min()
            .unwrap_or(u32::MAX)
    }

    pub fn same_atoms_as(&self) -> impl Iterator<Item = &str> {
        self.constraints.iter().filter_map(|c| match c {
            Constraint::SameAtomsAs { vertex } => Some(vertex.as_str()),
            _ => None,
        })
    }

    pub fn fixed_location(&self) -> Result<Option<FixedLocation>> {
        let mut found: Option<FixedLocation> = None;
        for c in self.constraints.iter() {
            if let Constraint::ChipAndCore { x, y, p } = c {
                let loc = FixedLocation {
                    chip: ChipCoord::new(*x, *y),
                    core: *p,
                };
                if let Some(prev) = found {
                    ensure!(
                        prev == loc,
                        GraphError::InvalidParameter(format!(
                            "{} has conflicting chip constraints {:?} and {:?}",
                            self.label, prev, loc
                        ))
                    );
                }
                found = Some(loc);
            }
        }
        Ok(found)
    }

    /// The fixed key and mask for the given partition, if constrained
    pub fn fixed_key_and_mask(&self, partition: &str) -> Option<(u32, u32)> {
        self.constraints.iter().find_map(|c| match c {
            Constraint::FixedKeyAndMask {
                key,
                mask,
                partition: p,
            } if p.as_deref().map_or(true, |p| p == partition) => Some((*key, *mask)),
            _ => None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficType {
    Multicast,
    /// Shared memory between vertices on one chip. Never routed.
    Sdram,
}

impl Default for TrafficType {
    fn default() -> Self {
        TrafficType::Multicast
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationEdge {
    pub pre: ApplicationVertexId,
    pub post: ApplicationVertexId,
    /// Identifier of the outgoing partition of `pre` this edge belongs to
    pub partition: String,
    #[serde(default)]
    pub traffic: TrafficType,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ApplicationGraph {
    vertices: Vec<ApplicationVertex>,
    edges: Vec<ApplicationEdge>,
}

impl ApplicationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vertex(&mut self, vertex: ApplicationVertex) -> Result<ApplicationVertexId> {
        ensure!(
            self.vertex_by_label(&vertex.label).is_none(),
            GraphError::AlreadyExists(format!("vertex {:?}", vertex.label))
        );
        let id = ApplicationVertexId(self.vertices.len() as u32);
        self.vertices.push(vertex);
        Ok(id)
    }

    pub fn add_edge(
        &mut self,
        pre: ApplicationVertexId,
        post: ApplicationVertexId,
        partition: impl Into<String>,
        traffic: TrafficType,
    ) -> Result<()> {
        for v in [pre, post] {
            ensure!(
                (v.0 as usize) < self.vertices.len(),
                GraphError::NotExist(format!("application vertex {:?}", v))
            );
        }
        self.edges.push(ApplicationEdge {
            pre,
            post,
            partition: partition.into(),
            traffic,
        });
        Ok(())
    }

    pub fn vertex(&self, id: ApplicationVertexId) -> Result<&ApplicationVertex> {
        match self.vertices.get(id.0 as usize) {
            Some(v) => Ok(v),
            None => Err(GraphError::NotExist(format!("application vertex {:?}", id)))?,
        }
    }

    pub fn vertex_by_label(&self, label: &str) -> Option<ApplicationVertexId> {
        self.vertices
            .iter()
            .position(|v| v.label == label)
            .map(|i| ApplicationVertexId(i as u32))
    }

    pub fn vertices(&self) -> impl Iterator<Item = (ApplicationVertexId, &ApplicationVertex)> {
        self.vertices
            .iter()
            .enumerate()
            .map(|(i, v)| (ApplicationVertexId(i as u32), v))
    }

    pub fn n_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn edges(&self) -> impl Iterator<Item = &ApplicationEdge> {
        self.edges.iter()
    }

    pub fn outgoing_edges(
        &self,
        pre: ApplicationVertexId,
    ) -> impl Iterator<Item = &ApplicationEdge> {
        self.edges.iter().filter(move |e| e.pre == pre)
    }

    pub fn incoming_edges(
        &self,
        post: ApplicationVertexId,
    ) -> impl Iterator<Item = &ApplicationEdge> {
        self.edges.iter().filter(move |e| e.post == post)
    }
}
