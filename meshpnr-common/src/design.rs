//! File formats passed between the tools of the flow.
//!
//! The placement tool reads a [ProblemDescription] and writes a [PlacedDesign]; the routing tool
//! reads the [PlacedDesign]. Both are JSON.

use anyhow::{anyhow, Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;

use crate::graph::{ApplicationGraph, ApplicationVertex, MachineGraph, TrafficType};
use crate::machine::{Machine, MachineDescription};
use crate::placements::Placements;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EdgeDescription {
    pub pre: String,
    pub post: String,
    #[serde(default = "default_partition")]
    pub partition: String,
    #[serde(default)]
    pub traffic: TrafficType,
}

fn default_partition() -> String {
    "spikes".into()
}

/// A core taken by the system before placement starts
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReservedCore {
    pub x: u32,
    pub y: u32,
    pub p: u8,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ProblemDescription {
    pub machine: MachineDescription,
    pub vertices: Vec<ApplicationVertex>,
    #[serde(default)]
    pub edges: Vec<EdgeDescription>,
    #[serde(default)]
    pub reserved_cores: Vec<ReservedCore>,
}

impl ProblemDescription {
    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }

    pub fn machine(&self) -> Result<Machine> {
        Machine::new(&self.machine).context("Building machine from description")
    }

    /// Resolve the edges' vertex labels and build the application graph
    pub fn application_graph(&self) -> Result<ApplicationGraph> {
        let mut graph = ApplicationGraph::new();
        for v in self.vertices.iter() {
            graph.add_vertex(v.clone())?;
        }
        for e in self.edges.iter() {
            let lookup = |label: &str| {
                graph
                    .vertex_by_label(label)
                    .ok_or_else(|| anyhow!("Edge endpoint {:?} is not a vertex", label))
            };
            let pre = lookup(&e.pre)?;
            let post = lookup(&e.post)?;
            graph.add_edge(pre, post, e.partition.clone(), e.traffic)?;
        }
        Ok(graph)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PlacedDesign {
    pub machine: MachineDescription,
    pub application_graph: ApplicationGraph,
    pub machine_graph: MachineGraph,
    pub placements: Placements,
}

impl PlacedDesign {
    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(path, self)
    }
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let inf = std::fs::File::open(path).with_context(|| anyhow!("Opening {:?}", path))?;
    serde_json::from_reader(std::io::BufReader::new(inf))
        .with_context(|| anyhow!("Parsing {:?}", path))
}

pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let outf = std::fs::File::create(path).with_context(|| anyhow!("Creating {:?}", path))?;
    serde_json::ser::to_writer(std::io::BufWriter::new(outf), value)
        .with_context(|| anyhow!("Writing {:?}", path))
}
