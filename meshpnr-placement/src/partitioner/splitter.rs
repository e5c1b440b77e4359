//! What each [Splitter] variant does when asked to cut up its application vertex.

use anyhow::{ensure, Result};
use meshpnr_common::graph::{
    ApplicationVertex, ApplicationVertexId, MachineGraph, MachineVertex, MachineVertexId, Slice,
    Splitter,
};
use meshpnr_common::machine::CoreBudget;

use super::PartitionError;

/// Everything a splitter needs to know about the vertices it is slicing for. Vertices tied by a
/// same-size constraint are sliced together, so `members` holds all of them; the first member
/// is the one whose splitter picks the slices.
pub struct SplitContext<'a> {
    pub members: Vec<Member<'a>>,
    pub budget: CoreBudget,
}

pub struct Member<'a> {
    pub id: ApplicationVertexId,
    pub vertex: &'a ApplicationVertex,
    /// Atoms of the vertices with multicast edges into this one
    pub n_incoming_atoms: u64,
}

impl<'a> SplitContext<'a> {
    fn reference(&self) -> &ApplicationVertex {
        self.members[0].vertex
    }

    fn n_atoms(&self) -> u32 {
        self.reference().n_atoms
    }

    fn max_atoms_per_core(&self) -> u32 {
        self.members
            .iter()
            .map(|m| m.vertex.max_atoms_per_core())
            .min()
            .unwrap_or(u32::MAX)
    }

    /// Whether every member can run atoms `lo..=hi` on one core
    fn fits(&self, lo: u32, hi: u32) -> bool {
        self.members.iter().all(|m| {
            m.vertex
                .cost
                .resources(hi - lo + 1, m.n_incoming_atoms)
                .fits_core(&self.budget)
        })
    }

    fn first_misfit(&self, lo: u32, hi: u32) -> Option<&Member<'a>> {
        self.members.iter().find(|m| {
            !m.vertex
                .cost
                .resources(hi - lo + 1, m.n_incoming_atoms)
                .fits_core(&self.budget)
        })
    }
}

/// A set of machine vertices that must share a chip, with the SDRAM they need between them
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SameChipGroup {
    pub vertices: Vec<MachineVertexId>,
    pub sdram: u64,
}

pub trait SplitterExt {
    /// Cut the vertices of `ctx` into slices
    fn slices(&self, ctx: &SplitContext) -> Result<Vec<Slice>>;

    /// Build one machine vertex per slice for `member`, checking each fits on a core
    fn create_machine_vertices(
        &self,
        member: &Member,
        slices: &[Slice],
        budget: &CoreBudget,
    ) -> Result<Vec<MachineVertex>> {
        let fixed_location = member.vertex.fixed_location()?;
        slices
            .iter()
            .enumerate()
            .map(|(index, slice)| -> Result<MachineVertex> {
                let resources = member
                    .vertex
                    .cost
                    .resources(slice.n_atoms(), member.n_incoming_atoms);
                if !resources.fits_core(budget) {
                    Err(PartitionError::SliceDoesNotFit {
                        vertex: member.vertex.label.clone(),
                        slice: slice.clone(),
                        required: resources,
                        budget: *budget,
                    })?
                }
                Ok(MachineVertex {
                    label: format!("{}:{}", member.vertex.label, slice),
                    app_vertex: Some(member.id),
                    index: index as u32,
                    slice: slice.clone(),
                    resources,
                    fixed_location,
                })
            })
            .collect()
    }

    /// Machine vertices that send the vertex's outgoing traffic
    fn outgoing_slices(
        &self,
        graph: &MachineGraph,
        id: ApplicationVertexId,
    ) -> Result<Vec<(MachineVertexId, Slice)>> {
        graph
            .machine_vertices_of(id)
            .iter()
            .map(|mv| -> Result<(MachineVertexId, Slice)> {
                Ok((*mv, graph.vertex(*mv)?.slice.clone()))
            })
            .collect()
    }

    /// Machine vertices that receive the vertex's incoming traffic
    fn incoming_slices(
        &self,
        graph: &MachineGraph,
        id: ApplicationVertexId,
    ) -> Result<Vec<(MachineVertexId, Slice)>> {
        self.outgoing_slices(graph, id)
    }

    fn same_chip_groups(
        &self,
        graph: &MachineGraph,
        id: ApplicationVertexId,
    ) -> Result<Vec<SameChipGroup>>;
}

impl SplitterExt for Splitter {
    fn slices(&self, ctx: &SplitContext) -> Result<Vec<Slice>> {
        let n_atoms = ctx.n_atoms();
        let max_atoms = ctx.max_atoms_per_core();
        let label = &ctx.reference().label;
        ensure!(
            max_atoms > 0,
            PartitionError::InconsistentSlices {
                vertex: label.clone(),
                reason: "max atoms per core is zero".into(),
            }
        );

        match self {
            Splitter::Legacy => legacy_slices(ctx, n_atoms, max_atoms),
            Splitter::FixedSlice { atoms_per_core } => {
                ensure!(
                    *atoms_per_core > 0,
                    PartitionError::InconsistentSlices {
                        vertex: label.clone(),
                        reason: "fixed slices of zero atoms".into(),
                    }
                );
                let size = std::cmp::min(*atoms_per_core, max_atoms);
                let mut out = Vec::new();
                let mut lo = 0;
                while lo < n_atoms {
                    let hi = std::cmp::min(lo.saturating_add(size - 1), n_atoms - 1);
                    out.push(Slice::new(lo, hi)?);
                    lo = hi + 1;
                }
                Ok(out)
            }
            Splitter::ApplicationDefined { slices, .. } => {
                let mut expected_lo = 0;
                let mut out = Vec::with_capacity(slices.len());
                for (lo, hi) in slices.iter().copied() {
                    let inconsistent = |reason: String| PartitionError::InconsistentSlices {
                        vertex: label.clone(),
                        reason,
                    };
                    ensure!(
                        lo == expected_lo,
                        inconsistent(format!("slice {}:{} should start at {}", lo, hi, expected_lo))
                    );
                    let slice = Slice::new(lo, hi)?;
                    ensure!(
                        slice.n_atoms() <= max_atoms,
                        inconsistent(format!(
                            "slice {} has more than {} atoms",
                            slice, max_atoms
                        ))
                    );
                    expected_lo = hi + 1;
                    out.push(slice);
                }
                ensure!(
                    expected_lo == n_atoms,
                    PartitionError::InconsistentSlices {
                        vertex: label.clone(),
                        reason: format!("slices cover {} of {} atoms", expected_lo, n_atoms),
                    }
                );
                Ok(out)
            }
        }
    }

    fn same_chip_groups(
        &self,
        graph: &MachineGraph,
        id: ApplicationVertexId,
    ) -> Result<Vec<SameChipGroup>> {
        let vertices = graph.machine_vertices_of(id);
        let sdram_of =
            |mv: &MachineVertexId| -> Result<u64> { Ok(graph.vertex(*mv)?.resources.sdram) };
        match self {
            Splitter::ApplicationDefined {
                same_chip: true, ..
            } if !vertices.is_empty() => Ok(vec![SameChipGroup {
                vertices: vertices.to_vec(),
                sdram: vertices.iter().map(sdram_of).sum::<Result<u64>>()?,
            }]),
            _ => vertices
                .iter()
                .map(|mv| -> Result<SameChipGroup> {
                    Ok(SameChipGroup {
                        vertices: vec![*mv],
                        sdram: sdram_of(mv)?,
                    })
                })
                .collect(),
        }
    }
}

/// Largest slices that fit every member, starting from atom zero
fn legacy_slices(ctx: &SplitContext, n_atoms: u32, max_atoms: u32) -> Result<Vec<Slice>> {
    let mut out = Vec::new();
    let mut lo = 0;
    while lo < n_atoms {
        if let Some(member) = ctx.first_misfit(lo, lo) {
            Err(PartitionError::TooBigToPlace {
                vertex: member.vertex.label.clone(),
                required: member.vertex.cost.resources(1, member.n_incoming_atoms),
                budget: ctx.budget,
            })?
        }

        let hi = std::cmp::min(lo.saturating_add(max_atoms - 1), n_atoms - 1);
        let hi = if ctx.fits(lo, hi) {
            hi
        } else {
            // Costs grow with atom count, so bisect between a fitting and a failing hi
            let (mut good, mut bad) = (lo, hi);
            while bad - good > 1 {
                let mid = good + (bad - good) / 2;
                if ctx.fits(lo, mid) {
                    good = mid;
                } else {
                    bad = mid;
                }
            }
            good
        };

        out.push(Slice::new(lo, hi)?);
        lo = hi + 1;
    }
    Ok(out)
}
