//! Read-only model of the mesh the flow targets: chips with their cores, SDRAM and router, and
//! the six links joining each chip to its neighbours.

mod description;


pub use description::{ChipDescription, MachineDescription};

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Range;

use crate::{LINKS_PER_ROUTER, MAX_PROCESSORS_PER_CHIP};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChipCoord {
    pub x: u32,
    pub y: u32,
}

impl ChipCoord {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl Display for ChipCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// One of the six router links. The discriminant is the hardware link id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Link {
    /// X+
    East = 0,
    /// X+, Y+
    NorthEast = 1,
    /// Y+
    North = 2,
    /// X-
    West = 3,
    /// X-, Y-
    SouthWest = 4,
    /// Y-
    South = 5,
}

pub const ALL_LINKS: [Link; 6] = [
    Link::East,
    Link::NorthEast,
    Link::North,
    Link::West,
    Link::SouthWest,
    Link::South,
];

impl Link {
    #[inline]
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        ALL_LINKS.get(id as usize).copied()
    }

    /// The link a packet sent over `self` arrives on at the neighbouring chip.
    #[inline]
    pub fn opposite(self) -> Self {
        ALL_LINKS[((self.id() + 3) % LINKS_PER_ROUTER) as usize]
    }

    pub fn delta(self) -> (i64, i64) {
        match self {
            Link::East => (1, 0),
            Link::NorthEast => (1, 1),
            Link::North => (0, 1),
            Link::West => (-1, 0),
            Link::SouthWest => (-1, -1),
            Link::South => (0, -1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Chip {
    pub coord: ChipCoord,
    /// Total processors, including the monitors
    pub n_processors: u8,
    /// Processors `0..n_monitors` are reserved for the system
    pub n_monitors: u8,
    pub sdram: u64,
    /// Multicast entries the router can hold
    pub router_entries: u32,
    /// The chip of this chip's board that carries the ethernet connection
    pub ethernet: ChipCoord,
    links: [bool; LINKS_PER_ROUTER as usize],
}

impl Chip {
    #[inline]
    pub fn has_link(&self, link: Link) -> bool {
        self.links[link.id() as usize]
    }

    /// Processor ids available to application vertices
    pub fn user_processors(&self) -> Range<u8> {
        self.n_monitors..self.n_processors
    }

    pub fn n_user_processors(&self) -> u32 {
        self.n_processors.saturating_sub(self.n_monitors) as u32
    }

    pub fn is_ethernet_connected(&self) -> bool {
        self.coord == self.ethernet
    }
}

/// Per-core limits a single machine vertex has to fit within
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoreBudget {
    pub sdram: u64,
    pub cpu_cycles: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum MachineError {
    NoSuchChip(ChipCoord),
}

impl std::error::Error for MachineError {}

impl Display for MachineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSuchChip(c) => write!(f, "no working chip at {}", c),
        }
    }
}

pub struct Machine {
    width: u32,
    height: u32,
    wrap: bool,
    cpu_cycles_per_core: u64,
    /// Stored in x + y * width order. Dead chips are `None`.
    chips: Vec<Option<Chip>>,
}

impl Machine {
    pub fn new(desc: &MachineDescription) -> Result<Self> {
        ensure!(
            desc.width > 0 && desc.height > 0,
            "Machine must have at least one chip, got {}x{}",
            desc.width,
            desc.height
        );
        ensure!(
            desc.board_width > 0 && desc.board_height > 0,
            "Board size must be non-zero, got {}x{}",
            desc.board_width,
            desc.board_height
        );
        ensure!(
            desc.chip.n_processors <= MAX_PROCESSORS_PER_CHIP,
            "Chips can have at most {} processors, got {}",
            MAX_PROCESSORS_PER_CHIP,
            desc.chip.n_processors
        );
        ensure!(
            desc.chip.n_monitors <= desc.chip.n_processors,
            "More monitors ({}) than processors ({})",
            desc.chip.n_monitors,
            desc.chip.n_processors
        );

        let mut chips = Vec::with_capacity((desc.width * desc.height) as usize);
        for y in 0..desc.height {
            for x in 0..desc.width {
                let coord = ChipCoord::new(x, y);
                chips.push(Some(Chip {
                    coord,
                    n_processors: desc.chip.n_processors,
                    n_monitors: desc.chip.n_monitors,
                    sdram: desc.chip.sdram,
                    router_entries: desc.chip.router_entries,
                    ethernet: ChipCoord::new(x - x % desc.board_width, y - y % desc.board_height),
                    links: [true; LINKS_PER_ROUTER as usize],
                }));
            }
        }

        let mut machine = Self {
            width: desc.width,
            height: desc.height,
            wrap: desc.wrap,
            cpu_cycles_per_core: desc.chip.cpu_cycles_per_core,
            chips,
        };

        for dead in desc.dead_chips.iter() {
            let idx = machine.index_of(*dead)?;
            machine.chips[idx] = None;
        }

        for (coord, link) in desc.dead_links.iter() {
            machine.kill_link(*coord, *link)?;
        }

        // Links that leave the mesh (or point at a dead chip) can never carry traffic
        for idx in 0..machine.chips.len() {
            let coord = match &machine.chips[idx] {
                Some(chip) => chip.coord,
                None => continue,
            };
            for link in ALL_LINKS {
                let alive = machine
                    .neighbour(coord, link)
                    .map_or(false, |n| machine.chip(n).is_some());
                if !alive {
                    if let Some(chip) = machine.chips[idx].as_mut() {
                        chip.links[link.id() as usize] = false;
                    }
                }
            }
        }

        Ok(machine)
    }

    fn index_of(&self, coord: ChipCoord) -> Result<usize> {
        if coord.x >= self.width || coord.y >= self.height {
            Err(MachineError::NoSuchChip(coord))?
        } else {
            Ok((coord.x + coord.y * self.width) as usize)
        }
    }

    fn kill_link(&mut self, coord: ChipCoord, link: Link) -> Result<()> {
        let idx = self.index_of(coord)?;
        if let Some(chip) = self.chips[idx].as_mut() {
            chip.links[link.id() as usize] = false;
        }
        if let Some(other) = self.neighbour(coord, link) {
            let idx = self.index_of(other)?;
            if let Some(chip) = self.chips[idx].as_mut() {
                chip.links[link.opposite().id() as usize] = false;
            }
        }
        Ok(())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn wraps(&self) -> bool {
        self.wrap
    }

    pub fn chip_at(&self, x: u32, y: u32) -> Option<&Chip> {
        self.chip(ChipCoord::new(x, y))
    }

    #[inline]
    pub fn chip(&self, coord: ChipCoord) -> Option<&Chip> {
        self.index_of(coord)
            .ok()
            .and_then(|idx| self.chips[idx].as_ref())
    }

    /// Like [Machine::chip], but a missing chip is an error
    pub fn get_chip(&self, coord: ChipCoord) -> Result<&Chip> {
        match self.chip(coord) {
            Some(chip) => Ok(chip),
            None => Err(MachineError::NoSuchChip(coord))?,
        }
    }

    /// Working chips, in x + y * width order
    pub fn chips(&self) -> impl Iterator<Item = &Chip> {
        self.chips.iter().filter_map(|c| c.as_ref())
    }

    pub fn n_chips(&self) -> usize {
        self.chips().count()
    }

    /// The coordinate one hop over `link`, wrapping if the machine wraps. This does not check
    /// that the link or the target chip work.
    pub fn neighbour(&self, coord: ChipCoord, link: Link) -> Option<ChipCoord> {
        let (dx, dy) = link.delta();
        let x = coord.x as i64 + dx;
        let y = coord.y as i64 + dy;
        let (w, h) = (self.width as i64, self.height as i64);
        if self.wrap {
            Some(ChipCoord::new(x.rem_euclid(w) as u32, y.rem_euclid(h) as u32))
        } else if 0 <= x && x < w && 0 <= y && y < h {
            Some(ChipCoord::new(x as u32, y as u32))
        } else {
            None
        }
    }

    pub fn link_exists(&self, x: u32, y: u32, link: Link) -> bool {
        self.chip_at(x, y).map_or(false, |c| c.has_link(link))
    }

    /// The chip reached over a working link, if any
    pub fn link_target(&self, coord: ChipCoord, link: Link) -> Option<ChipCoord> {
        if self.link_exists(coord.x, coord.y, link) {
            self.neighbour(coord, link)
        } else {
            None
        }
    }

    pub fn processors_of(&self, coord: ChipCoord) -> Result<Range<u8>> {
        Ok(0..self.get_chip(coord)?.n_processors)
    }

    pub fn sdram_of(&self, coord: ChipCoord) -> Result<u64> {
        Ok(self.get_chip(coord)?.sdram)
    }

    pub fn ethernet_connected_chips(&self) -> impl Iterator<Item = &Chip> {
        self.chips().filter(|c| c.is_ethernet_connected())
    }

    pub fn chips_on_board(&self, ethernet: ChipCoord) -> impl Iterator<Item = &Chip> {
        self.chips().filter(move |c| c.ethernet == ethernet)
    }

    pub fn max_cores_per_chip(&self) -> u32 {
        self.chips().map(|c| c.n_user_processors()).max().unwrap_or(0)
    }

    pub fn max_sdram_per_chip(&self) -> u64 {
        self.chips().map(|c| c.sdram).max().unwrap_or(0)
    }

    pub fn core_budget(&self) -> CoreBudget {
        CoreBudget {
            sdram: self.max_sdram_per_chip(),
            cpu_cycles: self.cpu_cycles_per_core,
        }
    }
}
