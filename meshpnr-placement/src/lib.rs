//! Partitioning and placement: the first half of the place-and-route flow.

pub mod config;
pub mod partitioner;
pub mod placer;

use anyhow::{Context, Result};
use meshpnr_common::design::{PlacedDesign, ProblemDescription};

use config::PlacerConfig;

/// Partition and place a problem, then expand the application edges of every placed machine
/// vertex
pub fn place_design(problem: &ProblemDescription, config: &PlacerConfig) -> Result<PlacedDesign> {
    let machine = problem.machine()?;
    let app_graph = problem.application_graph()?;

    let mut config = config.clone();
    config
        .reserved_cores
        .extend(problem.reserved_cores.iter().copied());

    let mut machine_graph =
        partitioner::partition(&app_graph, &machine).context("Partitioning")?;
    let placements = placer::place_application_graph(&app_graph, &machine_graph, &machine, &config)
        .context("Placing")?;

    let placed = placements.iter().map(|p| p.vertex).collect::<Vec<_>>();
    for vertex in placed {
        partitioner::expand_edges(&app_graph, &mut machine_graph, vertex)?;
    }

    Ok(PlacedDesign {
        machine: problem.machine.clone(),
        application_graph: app_graph,
        machine_graph,
        placements,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshpnr_common::machine::ChipCoord;

    const PROBLEM: &str = r#"{
        "machine": { "width": 2, "height": 2, "chip": { "n_processors": 4 } },
        "vertices": [
            { "label": "a", "n_atoms": 300, "max_atoms_per_core": 100 },
            { "label": "b", "n_atoms": 1 }
        ],
        "edges": [ { "pre": "a", "post": "b" } ],
        "reserved_cores": [ { "x": 0, "y": 0, "p": 1 } ]
    }"#;

    #[test]
    fn places_a_problem_read_from_json() -> Result<()> {
        let _ = tracing_subscriber::fmt::try_init();
        let problem: ProblemDescription = serde_json::from_str(PROBLEM)?;
        let design = place_design(&problem, &PlacerConfig::default())?;

        assert_eq!(design.placements.len(), 4);
        assert!(design.placements.vertex_on_core(0, 0, 1).is_none());
        assert!(design.placements.on_chip(ChipCoord::new(0, 0)).all(|p| p.p > 1));
        // Edges are expanded once every vertex is placed: one partition per slice of "a"
        assert_eq!(design.machine_graph.multicast_partitions().count(), 3);
        Ok(())
    }
}
