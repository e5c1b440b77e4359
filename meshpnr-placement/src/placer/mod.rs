//! Space-search placement of machine vertices onto chips.
//!
//! Application vertices are placed one after another, each as its list of same-chip groups. The
//! placer fills the current chip and, when a group does not fit, moves on to unused chips next to
//! the ones it has filled for this vertex, preferring chips on the same board. If that frontier
//! runs dry the attempt is abandoned and retried from a fresh chip; the abandoned chips are offered
//! again to the next application vertex, which may be small enough to use them.

mod report;
mod space;


use anyhow::{Context, Result};
use itertools::Itertools;
use log::{debug, info, warn};
use meshpnr_common::graph::{ApplicationGraph, MachineGraph, MachineVertexId};
use meshpnr_common::machine::{ChipCoord, Machine};
use meshpnr_common::placements::{Placement, Placements};
use std::fmt::Display;
use std::path::PathBuf;

use crate::config::PlacerConfig;
use crate::partitioner::{SameChipGroup, SplitterExt};
use space::{SpaceExceeded, Spaces};

pub const FAILURE_REPORT_NAME: &str = "placement_failure.txt";

#[derive(Debug, PartialEq, Eq)]
pub enum PlaceError {
    /// A group needs more than any chip of the machine has, so no amount of searching helps
    TooBigToPlace {
        vertex: String,
        n_cores: usize,
        sdram: u64,
        max_cores: u32,
        max_sdram: u64,
    },
    /// The constraints of a vertex can not be met
    Configuration {
        vertex: String,
        chip: ChipCoord,
        /// Labels of the vertices already on, or about to go on, the chip
        occupants: Vec<String>,
        reason: String,
    },
    /// The machine ran out of chips. A report has been written to `report`.
    PlaceFailed { reason: String, report: PathBuf },
}

impl Display for PlaceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooBigToPlace {
                vertex,
                n_cores,
                sdram,
                max_cores,
                max_sdram,
            } => write!(
                f,
                "{} will not fit on any chip: a group of {} cores needs {} bytes, but a chip has at most {} user cores and {} bytes",
                vertex, n_cores, sdram, max_cores, max_sdram
            ),
            Self::Configuration {
                vertex,
                chip,
                occupants,
                reason,
            } => {
                write!(f, "can not place {} on {}: {}", vertex, chip, reason)?;
                if !occupants.is_empty() {
                    write!(f, "; the chip already holds {}", occupants.join(", "))?;
                }
                Ok(())
            }
            Self::PlaceFailed { reason, report } => {
                write!(f, "{}. Report written to {:?}", reason, report)
            }
        }
    }
}

impl std::error::Error for PlaceError {}

enum Attempt {
    Placed { chips: Vec<ChipCoord> },
    SpaceExceeded {
        reason: SpaceExceeded,
        chips: Vec<ChipCoord>,
        n_cores: usize,
        sdram: u64,
    },
}

struct Placer<'a> {
    app_graph: &'a ApplicationGraph,
    graph: &'a MachineGraph,
    machine: &'a Machine,
    config: &'a PlacerConfig,
    spaces: Spaces<'a>,
    placements: Placements,
}

/// Place every machine vertex of `graph`. Cores listed in the config's reserved cores are never
/// used and do not appear in the result.
pub fn place_application_graph(
    app_graph: &ApplicationGraph,
    graph: &MachineGraph,
    machine: &Machine,
    config: &PlacerConfig,
) -> Result<Placements> {
    let _span = tracing::info_span!("place", vertices = graph.n_vertices()).entered();

    let start = match config.start_chip {
        Some(start) => start,
        None => machine
            .ethernet_connected_chips()
            .next()
            .map(|c| c.coord)
            .context("The machine has no ethernet connected chip to start placing from")?,
    };
    anyhow::ensure!(
        start.x < machine.width() && start.y < machine.height(),
        "Start chip {} is outside the {}x{} machine",
        start,
        machine.width(),
        machine.height()
    );

    let mut placer = Placer {
        app_graph,
        graph,
        machine,
        config,
        spaces: Spaces::new(machine, graph, &config.reserved_cores, start),
        placements: Placements::new(),
    };

    for (id, vertex) in app_graph.vertices() {
        let _span = tracing::info_span!("place_app_vertex", vertex = %vertex.label).entered();
        let groups = vertex.splitter.same_chip_groups(graph, id)?;
        placer
            .place_groups(&vertex.label, &groups)
            .with_context(|| format!("Placing {}", vertex.label))?;
    }

    for (id, vertex) in graph.vertices().filter(|(_, v)| v.app_vertex.is_none()) {
        let group = SameChipGroup {
            vertices: vec![id],
            sdram: vertex.resources.sdram,
        };
        placer
            .place_groups(&vertex.label, &[group])
            .with_context(|| format!("Placing {}", vertex.label))?;
    }

    info!(
        "Placed {} machine vertices on {} chips",
        placer.placements.len(),
        placer.placements.chips().len()
    );
    Ok(placer.placements)
}

impl<'a> Placer<'a> {
    fn label(&self, vertex: MachineVertexId) -> Result<&'a str> {
        Ok(&self.graph.vertex(vertex)?.label)
    }

    fn place_groups(&mut self, label: &str, groups: &[SameChipGroup]) -> Result<()> {
        self.spaces.restore_chips();
        loop {
            match self.attempt(groups)? {
                Attempt::Placed { chips } => {
                    debug!("Used {:?}", chips.iter().map(|c| c.to_string()).collect_vec());
                    return Ok(());
                }
                Attempt::SpaceExceeded {
                    reason,
                    chips,
                    n_cores,
                    sdram,
                } => {
                    self.check_could_fit(label, n_cores, sdram)?;
                    debug!("{}, saving {} chips and starting again", reason, chips.len());
                    self.spaces.save_chips(chips);
                }
            }
        }
    }

    /// Try to place all of the groups, starting from the current chip
    fn attempt(&mut self, groups: &[SameChipGroup]) -> Result<Attempt> {
        if groups.is_empty() {
            return Ok(Attempt::Placed { chips: Vec::new() });
        }

        let mut space = match self.spaces.start_space(&self.placements)? {
            Ok(space) => space,
            Err(no_more) => return Err(self.place_error(&no_more.to_string())),
        };

        let mut to_make: Vec<Placement> = Vec::new();
        let mut expand_from: Option<ChipCoord> = None;
        for group in groups {
            let vertices = group
                .vertices
                .iter()
                .copied()
                .filter(|v| !self.placements.is_placed(*v))
                .collect_vec();
            if vertices.is_empty() {
                continue;
            }
            if self.place_fixed(&vertices, group.sdram, &to_make)? {
                continue;
            }

            let n_cores = vertices.len();
            loop {
                let fits = self
                    .spaces
                    .current()
                    .map_or(false, |c| c.is_space(n_cores, group.sdram));
                if fits {
                    break;
                }
                if let Err(reason) =
                    self.spaces
                        .next_chip_space(&mut space, expand_from.take(), &self.placements)?
                {
                    return Ok(Attempt::SpaceExceeded {
                        reason,
                        chips: self.spaces.take_attempt_chips(),
                        n_cores,
                        sdram: group.sdram,
                    });
                }
            }

            let current = match self.spaces.current_mut() {
                Some(current) => current,
                None => anyhow::bail!("No chip selected after a successful space check"),
            };
            for vertex in vertices {
                let core = current
                    .use_next_core()
                    .context("Chip ran out of cores after a successful space check")?;
                to_make.push(Placement::new(vertex, current.chip.x, current.chip.y, core));
            }
            current.use_sdram(group.sdram);
            expand_from = Some(current.chip);
        }

        self.placements.add_placements(to_make)?;
        Ok(Attempt::Placed {
            chips: self.spaces.take_attempt_chips(),
        })
    }

    /// Place a group with a chip constraint where it has to go. Returns false if the group is
    /// free to go anywhere.
    fn place_fixed(
        &mut self,
        vertices: &[MachineVertexId],
        sdram: u64,
        pending: &[Placement],
    ) -> Result<bool> {
        let mut fixed = None;
        for v in vertices {
            if let Some(loc) = self.graph.vertex(*v)?.fixed_location {
                fixed = Some(loc.chip);
                break;
            }
        }
        let chip = match fixed {
            Some(chip) => chip,
            None => return Ok(false),
        };

        let configuration_error = |vertex: &str, occupants: Vec<String>, reason: String| {
            PlaceError::Configuration {
                vertex: vertex.into(),
                chip,
                occupants,
                reason,
            }
        };

        if self.machine.chip(chip).is_none() {
            Err(configuration_error(
                self.label(vertices[0])?,
                Vec::new(),
                "there is no such chip".into(),
            ))?
        }

        let mut free = self.spaces.chip_with_space(chip, &self.placements)?;
        let mut occupants = Vec::new();
        for p in self.placements.on_chip(chip) {
            occupants.push(self.label(p.vertex)?.to_string());
        }
        for p in pending.iter().filter(|p| p.chip() == chip) {
            free.cores.remove(&p.p);
            free.use_sdram(self.graph.vertex(p.vertex)?.resources.sdram);
            occupants.push(self.label(p.vertex)?.to_string());
        }
        if free.sdram < sdram {
            Err(configuration_error(
                self.label(vertices[0])?,
                occupants.clone(),
                format!("needs {} bytes, {} free", sdram, free.sdram),
            ))?
        }

        let mut to_make = Vec::with_capacity(vertices.len());
        for vertex in vertices {
            let label = self.label(*vertex)?;
            let wanted = self
                .graph
                .vertex(*vertex)?
                .fixed_location
                .and_then(|loc| loc.core);
            let core = match wanted {
                Some(core) => {
                    if !free.cores.remove(&core) {
                        Err(configuration_error(
                            label,
                            occupants.clone(),
                            format!("core {} is not available", core),
                        ))?
                    }
                    core
                }
                None => match free.use_next_core() {
                    Some(core) => core,
                    None => Err(configuration_error(
                        label,
                        occupants.clone(),
                        "no more cores available".into(),
                    ))?,
                },
            };
            occupants.push(label.to_string());
            to_make.push(Placement::new(*vertex, chip.x, chip.y, core));
        }

        if let Some(current) = self.spaces.current_mut() {
            if current.chip == chip {
                for p in to_make.iter() {
                    current.cores.remove(&p.p);
                }
                current.use_sdram(sdram);
            }
        }
        debug!("Placed {} fixed vertices on {}", to_make.len(), chip);
        self.placements.add_placements(to_make)?;
        Ok(true)
    }

    fn check_could_fit(&self, vertex: &str, n_cores: usize, sdram: u64) -> Result<()> {
        let max_sdram = self.machine.max_sdram_per_chip();
        let max_cores = self.machine.max_cores_per_chip();
        if sdram <= max_sdram && n_cores <= max_cores as usize {
            return Ok(());
        }
        Err(PlaceError::TooBigToPlace {
            vertex: vertex.into(),
            n_cores,
            sdram,
            max_cores,
            max_sdram,
        }
        .into())
    }

    /// Write the failure report and build the error pointing at it
    fn place_error(&self, reason: &str) -> anyhow::Error {
        let report = self.config.report_directory.join(FAILURE_REPORT_NAME);
        if let Err(e) = report::write_failure_report(
            &report,
            self.app_graph,
            self.graph,
            self.machine,
            &self.placements,
            self.spaces.reserved(),
        ) {
            warn!("Could not write placement failure report: {:#}", e);
        }
        PlaceError::PlaceFailed {
            reason: reason.into(),
            report,
        }
        .into()
    }
}
