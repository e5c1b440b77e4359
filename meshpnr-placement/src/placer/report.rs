use anyhow::{Context, Result};
use meshpnr_common::graph::{ApplicationGraph, MachineGraph};
use meshpnr_common::machine::Machine;
use meshpnr_common::placements::Placements;
use std::collections::HashSet;
use std::io::Write;
use std::path::Path;

use crate::partitioner::SplitterExt;

/// Write a human readable account of a failed placement: which application vertices did not make
/// it, what is on each chip, and which chips were never touched.
pub(crate) fn write_failure_report(
    path: &Path,
    app_graph: &ApplicationGraph,
    graph: &MachineGraph,
    machine: &Machine,
    placements: &Placements,
    reserved: &HashSet<(u32, u32, u8)>,
) -> Result<()> {
    let outf = std::fs::File::create(path).with_context(|| format!("Creating {:?}", path))?;
    let mut f = std::io::BufWriter::new(outf);

    let mut unplaced = Vec::new();
    for (id, vertex) in app_graph.vertices() {
        if graph
            .machine_vertices_of(id)
            .iter()
            .any(|mv| !placements.is_placed(*mv))
        {
            unplaced.push((id, vertex));
        }
    }
    writeln!(
        f,
        "Could not place {} of {} application vertices.",
        unplaced.len(),
        app_graph.n_vertices()
    )?;
    writeln!(f)?;

    for chip in placements.chips() {
        writeln!(f, "Chip {}:", chip)?;
        let mut sdram = 0;
        for placement in placements.on_chip(chip) {
            let vertex = graph.vertex(placement.vertex)?;
            sdram += vertex.resources.sdram;
            writeln!(f, "    Processor {}: Vertex {}", placement.p, vertex.label)?;
        }
        writeln!(f, "    {} bytes of SDRAM used", sdram)?;
        writeln!(f)?;
    }

    writeln!(f, "Not placed:")?;
    for (id, vertex) in unplaced {
        writeln!(f, "Vertex: {}", vertex.label)?;
        for group in vertex.splitter.same_chip_groups(graph, id)? {
            writeln!(
                f,
                "    Group of {} vertices uses {} bytes of SDRAM:",
                group.vertices.len(),
                group.sdram
            )?;
            for mv in group.vertices {
                write!(f, "        Vertex {}", graph.vertex(mv)?.label)?;
                if let Ok(p) = placements.placement_of(mv) {
                    write!(f, " (placed at {}, {}, {})", p.x, p.y, p.p)?;
                }
                writeln!(f)?;
            }
        }
    }
    writeln!(f)?;

    writeln!(f, "Unused chips:")?;
    for chip in machine.chips() {
        if placements.on_chip(chip.coord).next().is_some() {
            continue;
        }
        let n_free = chip
            .user_processors()
            .filter(|p| !reserved.contains(&(chip.coord.x, chip.coord.y, *p)))
            .count();
        writeln!(
            f,
            "    {}, {} ({} free cores)",
            chip.coord.x, chip.coord.y, n_free
        )?;
    }
    f.flush()?;
    Ok(())
}
