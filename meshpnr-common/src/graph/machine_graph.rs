use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{
    ApplicationVertexId, FixedLocation, GraphError, MachineVertexId, ResourceRequirements, Slice,
    TrafficType,
};

/// Source of the codes that tie a partition to the one graph allowed to own it
static NEXT_GRAPH_CODE: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MachineVertex {
    pub label: String,
    /// `None` for vertices that were not split out of an application vertex
    pub app_vertex: Option<ApplicationVertexId>,
    /// Position among the machine vertices of `app_vertex`
    pub index: u32,
    pub slice: Slice,
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub fixed_location: Option<FixedLocation>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineEdge {
    pub pre: MachineVertexId,
    pub post: MachineVertexId,
}

/// Edges leaving one machine vertex under one identifier. A multicast partition gets exactly
/// one key range.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgePartition {
    pre: MachineVertexId,
    identifier: String,
    traffic: TrafficType,
    edges: Vec<MachineEdge>,
    graph_code: Option<u64>,
}

impl EdgePartition {
    pub fn new(pre: MachineVertexId, identifier: impl Into<String>, traffic: TrafficType) -> Self {
        Self {
            pre,
            identifier: identifier.into(),
            traffic,
            edges: Vec::new(),
            graph_code: None,
        }
    }

    pub fn pre(&self) -> MachineVertexId {
        self.pre
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn traffic(&self) -> TrafficType {
        self.traffic
    }

    pub fn edges(&self) -> &[MachineEdge] {
        &self.edges
    }

    /// Distinct destination vertices, in edge insertion order
    pub fn destinations(&self) -> Vec<MachineVertexId> {
        let mut out: Vec<MachineVertexId> = Vec::with_capacity(self.edges.len());
        for e in self.edges.iter() {
            if !out.contains(&e.post) {
                out.push(e.post);
            }
        }
        out
    }

    /// Bind this partition to a graph. Registering the same graph twice is fine, a second
    /// graph is not.
    pub fn register_graph_code(&mut self, code: u64) -> Result<()> {
        match self.graph_code {
            Some(existing) if existing != code => Err(GraphError::PartitionOwnedByOtherGraph {
                identifier: self.identifier.clone(),
            })?,
            _ => {
                self.graph_code = Some(code);
                Ok(())
            }
        }
    }

    pub fn graph_code(&self) -> Option<u64> {
        self.graph_code
    }

    /// Add an edge on behalf of the graph with the given code
    pub fn add_edge(&mut self, edge: MachineEdge, graph_code: u64) -> Result<()> {
        ensure!(
            self.graph_code == Some(graph_code),
            GraphError::PartitionOwnedByOtherGraph {
                identifier: self.identifier.clone()
            }
        );
        ensure!(
            edge.pre == self.pre,
            GraphError::InvalidParameter(format!(
                "edge from {} added to partition {:?} of {}",
                edge.pre, self.identifier, self.pre
            ))
        );
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
        Ok(())
    }
}

/// Arena of machine vertices and their outgoing partitions
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MachineGraph {
    code: u64,
    vertices: Vec<MachineVertex>,
    /// Machine vertices of each application vertex, in slice order
    by_app_vertex: Vec<Vec<MachineVertexId>>,
    partitions: Vec<EdgePartition>,
    /// Indices into `partitions` for each vertex
    outgoing: Vec<Vec<usize>>,
}

impl MachineGraph {
    pub fn new(n_app_vertices: usize) -> Self {
        Self {
            code: NEXT_GRAPH_CODE.fetch_add(1, Ordering::Relaxed),
            vertices: Vec::new(),
            by_app_vertex: vec![Vec::new(); n_app_vertices],
            partitions: Vec::new(),
            outgoing: Vec::new(),
        }
    }

    pub fn code(&self) -> u64 {
        self.code
    }

    pub fn add_vertex(&mut self, vertex: MachineVertex) -> Result<MachineVertexId> {
        let id = MachineVertexId(self.vertices.len() as u32);
        if let Some(app) = vertex.app_vertex {
            match self.by_app_vertex.get_mut(app.0 as usize) {
                Some(list) => list.push(id),
                None => Err(GraphError::NotExist(format!("application vertex {:?}", app)))?,
            }
        }
        self.vertices.push(vertex);
        self.outgoing.push(Vec::new());
        Ok(id)
    }

    pub fn vertex(&self, id: MachineVertexId) -> Result<&MachineVertex> {
        match self.vertices.get(id.0 as usize) {
            Some(v) => Ok(v),
            None => Err(GraphError::NotExist(format!("machine vertex {}", id)))?,
        }
    }

    pub fn vertices(&self) -> impl Iterator<Item = (MachineVertexId, &MachineVertex)> {
        self.vertices
            .iter()
            .enumerate()
            .map(|(i, v)| (MachineVertexId(i as u32), v))
    }

    pub fn n_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn machine_vertices_of(&self, app: ApplicationVertexId) -> &[MachineVertexId] {
        self.by_app_vertex
            .get(app.0 as usize)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn add_outgoing_edge_partition(&mut self, mut partition: EdgePartition) -> Result<()> {
        let pre = partition.pre;
        self.vertex(pre)?;
        ensure!(
            self.outgoing_partition(pre, &partition.identifier).is_none(),
            GraphError::AlreadyExists(format!(
                "partition {:?} of {}",
                partition.identifier, pre
            ))
        );
        partition.register_graph_code(self.code)?;
        for e in partition.edges.iter() {
            self.vertex(e.post)?;
        }
        self.outgoing[pre.0 as usize].push(self.partitions.len());
        self.partitions.push(partition);
        Ok(())
    }

    /// Add an edge, creating the partition it belongs to if needed
    pub fn add_edge(
        &mut self,
        edge: MachineEdge,
        identifier: &str,
        traffic: TrafficType,
    ) -> Result<()> {
        self.vertex(edge.post)?;
        if self.outgoing_partition(edge.pre, identifier).is_none() {
            self.add_outgoing_edge_partition(EdgePartition::new(edge.pre, identifier, traffic))?;
        }
        let code = self.code;
        let idx = self.outgoing[edge.pre.0 as usize]
            .iter()
            .copied()
            .find(|i| self.partitions[*i].identifier == identifier)
            .ok_or_else(|| GraphError::NotExist(format!("partition {:?}", identifier)))?;
        let partition = &mut self.partitions[idx];
        ensure!(
            partition.traffic == traffic,
            GraphError::InvalidParameter(format!(
                "partition {:?} of {} carries {:?} traffic, not {:?}",
                identifier, edge.pre, partition.traffic, traffic
            ))
        );
        partition.add_edge(edge, code)
    }

    pub fn outgoing_partition(&self, pre: MachineVertexId, identifier: &str) -> Option<&EdgePartition> {
        self.outgoing_partitions(pre)
            .find(|p| p.identifier == identifier)
    }

    pub fn outgoing_partitions(&self, pre: MachineVertexId) -> impl Iterator<Item = &EdgePartition> {
        self.outgoing
            .get(pre.0 as usize)
            .into_iter()
            .flatten()
            .map(move |i| &self.partitions[*i])
    }

    pub fn partitions(&self) -> impl Iterator<Item = &EdgePartition> {
        self.partitions.iter()
    }

    pub fn multicast_partitions(&self) -> impl Iterator<Item = &EdgePartition> {
        self.partitions
            .iter()
            .filter(|p| p.traffic == TrafficType::Multicast && !p.edges.is_empty())
    }

    pub fn n_partitions(&self) -> usize {
        self.partitions.len()
    }
}
