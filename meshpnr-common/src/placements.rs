//! Where each machine vertex runs.

use anyhow::{bail, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Display;

use crate::graph::MachineVertexId;
use crate::machine::ChipCoord;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Placement {
    pub vertex: MachineVertexId,
    pub x: u32,
    pub y: u32,
    pub p: u8,
}

impl Placement {
    pub fn new(vertex: MachineVertexId, x: u32, y: u32, p: u8) -> Self {
        Self { vertex, x, y, p }
    }

    #[inline]
    pub fn chip(&self) -> ChipCoord {
        ChipCoord::new(self.x, self.y)
    }

    #[inline]
    fn core(&self) -> (u32, u32, u8) {
        (self.x, self.y, self.p)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PlacementsError {
    VertexAlreadyPlaced(MachineVertexId),
    CoreAlreadyOccupied {
        x: u32,
        y: u32,
        p: u8,
        by: MachineVertexId,
    },
    NotPlaced(MachineVertexId),
}

impl Display for PlacementsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VertexAlreadyPlaced(v) => write!(f, "vertex {} is already placed", v),
            Self::CoreAlreadyOccupied { x, y, p, by } => {
                write!(f, "core ({}, {}, {}) is already occupied by {}", x, y, p, by)
            }
            Self::NotPlaced(v) => write!(f, "vertex {} has no placement", v),
        }
    }
}

impl std::error::Error for PlacementsError {}

/// A set of placements, injective on `(x, y, p)`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Placement>", into = "Vec<Placement>")]
pub struct Placements {
    by_vertex: HashMap<MachineVertexId, Placement>,
    by_core: HashMap<(u32, u32, u8), MachineVertexId>,
}

impl TryFrom<Vec<Placement>> for Placements {
    type Error = anyhow::Error;

    fn try_from(placements: Vec<Placement>) -> Result<Self> {
        let mut out = Placements::new();
        out.add_placements(placements)?;
        Ok(out)
    }
}

impl From<Placements> for Vec<Placement> {
    fn from(placements: Placements) -> Self {
        placements
            .by_vertex
            .into_values()
            .sorted_by_key(|p| p.vertex)
            .collect()
    }
}

impl Placements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_placement(&mut self, placement: Placement) -> Result<()> {
        self.check_free(&placement)?;
        self.by_core.insert(placement.core(), placement.vertex);
        self.by_vertex.insert(placement.vertex, placement);
        Ok(())
    }

    /// Add all of the placements or, if any of them clash, none of them
    pub fn add_placements(&mut self, placements: impl IntoIterator<Item = Placement>) -> Result<()> {
        let placements = placements.into_iter().collect_vec();
        let mut vertices = HashSet::new();
        let mut cores = HashMap::new();
        for p in placements.iter() {
            self.check_free(p)?;
            if !vertices.insert(p.vertex) {
                bail!(PlacementsError::VertexAlreadyPlaced(p.vertex));
            }
            if let Some(by) = cores.insert(p.core(), p.vertex) {
                bail!(PlacementsError::CoreAlreadyOccupied {
                    x: p.x,
                    y: p.y,
                    p: p.p,
                    by,
                });
            }
        }
        for p in placements {
            self.by_core.insert(p.core(), p.vertex);
            self.by_vertex.insert(p.vertex, p);
        }
        Ok(())
    }

    fn check_free(&self, placement: &Placement) -> Result<()> {
        if self.by_vertex.contains_key(&placement.vertex) {
            bail!(PlacementsError::VertexAlreadyPlaced(placement.vertex));
        }
        if let Some(by) = self.by_core.get(&placement.core()) {
            bail!(PlacementsError::CoreAlreadyOccupied {
                x: placement.x,
                y: placement.y,
                p: placement.p,
                by: *by,
            });
        }
        Ok(())
    }

    pub fn placement_of(&self, vertex: MachineVertexId) -> Result<&Placement> {
        match self.by_vertex.get(&vertex) {
            Some(p) => Ok(p),
            None => Err(PlacementsError::NotPlaced(vertex))?,
        }
    }

    pub fn is_placed(&self, vertex: MachineVertexId) -> bool {
        self.by_vertex.contains_key(&vertex)
    }

    pub fn vertex_on_core(&self, x: u32, y: u32, p: u8) -> Option<MachineVertexId> {
        self.by_core.get(&(x, y, p)).copied()
    }

    pub fn is_core_occupied(&self, x: u32, y: u32, p: u8) -> bool {
        self.by_core.contains_key(&(x, y, p))
    }

    /// All placements, ordered by vertex
    pub fn iter(&self) -> impl Iterator<Item = &Placement> {
        self.by_vertex.values().sorted_by_key(|p| p.vertex)
    }

    /// Placements on one chip, ordered by core
    pub fn on_chip(&self, chip: ChipCoord) -> impl Iterator<Item = &Placement> {
        self.by_vertex
            .values()
            .filter(move |p| p.chip() == chip)
            .sorted_by_key(|p| p.p)
    }

    pub fn chips(&self) -> Vec<ChipCoord> {
        self.by_vertex
            .values()
            .map(|p| p.chip())
            .unique()
            .sorted()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_vertex.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_vertex.is_empty()
    }
}
