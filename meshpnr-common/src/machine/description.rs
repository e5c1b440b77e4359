use serde::{Deserialize, Serialize};

use super::{ChipCoord, Link};

/// Serialized form of a [super::Machine]. Every chip is built from the same [ChipDescription];
/// faults are described by the dead chip and dead link lists.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MachineDescription {
    pub width: u32,
    pub height: u32,
    /// Whether links on the mesh edges wrap around to the other side (torus)
    #[serde(default)]
    pub wrap: bool,
    #[serde(default = "default_board_size")]
    pub board_width: u32,
    #[serde(default = "default_board_size")]
    pub board_height: u32,
    #[serde(default)]
    pub chip: ChipDescription,
    #[serde(default)]
    pub dead_chips: Vec<ChipCoord>,
    /// A dead link is dead in both directions
    #[serde(default)]
    pub dead_links: Vec<(ChipCoord, Link)>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ChipDescription {
    pub n_processors: u8,
    pub n_monitors: u8,
    pub sdram: u64,
    pub router_entries: u32,
    pub cpu_cycles_per_core: u64,
}

impl Default for ChipDescription {
    fn default() -> Self {
        Self {
            n_processors: 18,
            n_monitors: 1,
            sdram: 128 * 1024 * 1024,
            router_entries: 1024,
            // 200MHz over a 1ms timestep
            cpu_cycles_per_core: 200_000,
        }
    }
}

fn default_board_size() -> u32 {
    8
}

impl MachineDescription {
    /// A fault-free, non-wrapping mesh of default chips
    pub fn mesh(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            wrap: false,
            board_width: default_board_size(),
            board_height: default_board_size(),
            chip: ChipDescription::default(),
            dead_chips: Vec::new(),
            dead_links: Vec::new(),
        }
    }
}
