//! Bookkeeping for the space-search placer: which chips have been handed out, the frontier of
//! chips reachable from the ones in use, and the free cores and SDRAM of the chip being filled.

use anyhow::Result;
use log::debug;
use meshpnr_common::design::ReservedCore;
use meshpnr_common::graph::MachineGraph;
use meshpnr_common::machine::{Chip, ChipCoord, Machine, ALL_LINKS};
use meshpnr_common::placements::Placements;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt::Display;

/// Every chip reachable from the current space is in use. The placer recovers from this by
/// starting again somewhere else, so it never leaves the placer.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SpaceExceeded {
    pub n_used: usize,
    pub n_chips: usize,
}

impl Display for SpaceExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "no more chips to place on in this space; {} of {} used",
            self.n_used, self.n_chips
        )
    }
}

/// The cursor ran off the end of the machine
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct NoMoreChips {
    pub n_used: usize,
    pub n_chips: usize,
}

impl Display for NoMoreChips {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "no more chips to place on; {} of {} used",
            self.n_used, self.n_chips
        )
    }
}

/// A chip that is being filled, with what is still free on it
#[derive(Clone, Debug)]
pub(crate) struct ChipWithSpace {
    pub chip: ChipCoord,
    pub cores: BTreeSet<u8>,
    pub sdram: u64,
}

impl ChipWithSpace {
    pub fn new(
        chip: &Chip,
        placements: &Placements,
        graph: &MachineGraph,
        reserved: &HashSet<(u32, u32, u8)>,
    ) -> Result<Self> {
        let coord = chip.coord;
        let mut cores: BTreeSet<u8> = chip
            .user_processors()
            .filter(|p| !reserved.contains(&(coord.x, coord.y, *p)))
            .collect();
        let mut sdram_used = 0;
        for placement in placements.on_chip(coord) {
            cores.remove(&placement.p);
            sdram_used += graph.vertex(placement.vertex)?.resources.sdram;
        }
        Ok(Self {
            chip: coord,
            cores,
            sdram: chip.sdram.saturating_sub(sdram_used),
        })
    }

    pub fn is_space(&self, n_cores: usize, sdram: u64) -> bool {
        self.cores.len() >= n_cores && self.sdram >= sdram
    }

    pub fn use_sdram(&mut self, sdram: u64) {
        self.sdram = self.sdram.saturating_sub(sdram);
    }

    /// Take the lowest free core. Callers check [ChipWithSpace::is_space] first.
    pub fn use_next_core(&mut self) -> Option<u8> {
        let core = self.cores.iter().next().copied()?;
        self.cores.remove(&core);
        Some(core)
    }
}

/// Frontier of unused chips reachable from the chips used so far in one placement attempt.
/// Chips on the board currently being filled are handed out before any others.
#[derive(Debug)]
pub(crate) struct Space {
    board: ChipCoord,
    same_board: VecDeque<ChipCoord>,
    remaining: VecDeque<ChipCoord>,
}

impl Space {
    pub fn new(board: ChipCoord) -> Self {
        Self {
            board,
            same_board: VecDeque::new(),
            remaining: VecDeque::new(),
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.same_board.is_empty() && self.remaining.is_empty()
    }

    pub fn update(&mut self, chips: impl IntoIterator<Item = (ChipCoord, ChipCoord)>) {
        for (chip, board) in chips {
            if self.same_board.contains(&chip) || self.remaining.contains(&chip) {
                continue;
            }
            if board == self.board {
                self.same_board.push_back(chip);
            } else {
                self.remaining.push_back(chip);
            }
        }
    }

    /// Next chip of the frontier. Moving to a chip on another board makes that board current.
    pub fn pop(&mut self, machine: &Machine) -> Option<ChipCoord> {
        if let Some(chip) = self.same_board.pop_front() {
            return Some(chip);
        }
        let next = self.remaining.pop_front()?;
        if let Some(chip) = machine.chip(next) {
            self.board = chip.ethernet;
        }
        let board = self.board;
        let (same, other): (Vec<ChipCoord>, Vec<ChipCoord>) = self
            .remaining
            .drain(..)
            .partition(|c| machine.chip(*c).map_or(false, |c| c.ethernet == board));
        self.same_board.extend(same);
        self.remaining.extend(other);
        Some(next)
    }
}

/// Hands out chips to the placer. A cursor walks the machine column by column from the start
/// chip, wrapping in both dimensions; chips that turned out too full for one application vertex
/// are saved and offered again, ahead of the cursor, to the next one.
pub(crate) struct Spaces<'a> {
    machine: &'a Machine,
    graph: &'a MachineGraph,
    reserved: HashSet<(u32, u32, u8)>,
    chip_order: Vec<ChipCoord>,
    next_chip: usize,
    used_chips: HashSet<ChipCoord>,
    current: Option<ChipWithSpace>,
    saved_chips: Vec<ChipCoord>,
    restored_chips: VecDeque<ChipCoord>,
    /// Chips handed out since the last [Spaces::start_space]
    attempt_chips: Vec<ChipCoord>,
}

impl<'a> Spaces<'a> {
    pub fn new(
        machine: &'a Machine,
        graph: &'a MachineGraph,
        reserved: &[ReservedCore],
        start: ChipCoord,
    ) -> Self {
        let (w, h) = (machine.width(), machine.height());
        let mut chip_order = Vec::with_capacity(machine.n_chips());
        for x in 0..w {
            for y in 0..h {
                let coord = ChipCoord::new((x + start.x) % w, (y + start.y) % h);
                if machine.chip(coord).is_some() {
                    chip_order.push(coord);
                }
            }
        }

        Self {
            machine,
            graph,
            reserved: reserved.iter().map(|r| (r.x, r.y, r.p)).collect(),
            chip_order,
            next_chip: 0,
            used_chips: HashSet::new(),
            current: None,
            saved_chips: Vec::new(),
            restored_chips: VecDeque::new(),
            attempt_chips: Vec::new(),
        }
    }

    pub fn reserved(&self) -> &HashSet<(u32, u32, u8)> {
        &self.reserved
    }

    pub fn n_chips_used(&self) -> usize {
        self.used_chips.len()
    }

    pub fn current(&self) -> Option<&ChipWithSpace> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut ChipWithSpace> {
        self.current.as_mut()
    }

    /// Free cores and SDRAM of a chip given what is already placed
    pub fn chip_with_space(&self, chip: ChipCoord, placements: &Placements) -> Result<ChipWithSpace> {
        ChipWithSpace::new(self.machine.get_chip(chip)?, placements, self.graph, &self.reserved)
    }

    fn take_next_chip(&mut self) -> Option<ChipCoord> {
        while let Some(chip) = self.restored_chips.pop_front() {
            if !self.used_chips.contains(&chip) {
                return Some(chip);
            }
        }
        while let Some(chip) = self.chip_order.get(self.next_chip) {
            if !self.used_chips.contains(chip) {
                return Some(*chip);
            }
            self.next_chip += 1;
        }
        None
    }

    /// Make sure there is a chip being filled, and start an empty space on its board. This begins
    /// a new attempt.
    pub fn start_space(&mut self, placements: &Placements) -> Result<Result<Space, NoMoreChips>> {
        let current = match self.current.take() {
            Some(current) => current,
            None => {
                let chip = match self.take_next_chip() {
                    Some(chip) => chip,
                    None => {
                        return Ok(Err(NoMoreChips {
                            n_used: self.n_chips_used(),
                            n_chips: self.machine.n_chips(),
                        }))
                    }
                };
                self.used_chips.insert(chip);
                self.chip_with_space(chip, placements)?
            }
        };
        let board = self.machine.get_chip(current.chip)?.ethernet;
        self.attempt_chips = vec![current.chip];
        self.current = Some(current);
        Ok(Ok(Space::new(board)))
    }

    /// Unused chips one working link away
    fn usable_from_chip(&self, chip: ChipCoord) -> Vec<(ChipCoord, ChipCoord)> {
        ALL_LINKS
            .iter()
            .filter_map(|link| self.machine.link_target(chip, *link))
            .filter(|target| !self.used_chips.contains(target))
            .filter_map(|target| self.machine.chip(target).map(|c| (target, c.ethernet)))
            .collect()
    }

    /// Move the current chip on to the next chip of `space`, first widening the space with the
    /// neighbours of `expand_from` if given
    pub fn next_chip_space(
        &mut self,
        space: &mut Space,
        expand_from: Option<ChipCoord>,
        placements: &Placements,
    ) -> Result<Result<(), SpaceExceeded>> {
        if let Some(last) = expand_from {
            space.update(self.usable_from_chip(last));
        }

        let chip = loop {
            match space.pop(self.machine) {
                Some(chip) if self.used_chips.contains(&chip) => continue,
                Some(chip) => break chip,
                None => {
                    self.current = None;
                    return Ok(Err(SpaceExceeded {
                        n_used: self.n_chips_used(),
                        n_chips: self.machine.n_chips(),
                    }));
                }
            }
        };
        self.used_chips.insert(chip);
        self.attempt_chips.push(chip);
        self.restored_chips.retain(|c| *c != chip);
        self.current = Some(self.chip_with_space(chip, placements)?);
        debug!("Moved on to chip {}", chip);
        Ok(Ok(()))
    }

    /// Every chip the current attempt has been given, whether or not anything went on it
    pub fn take_attempt_chips(&mut self) -> Vec<ChipCoord> {
        std::mem::take(&mut self.attempt_chips)
    }

    /// Remember chips tried by a failed attempt, so the next application vertex sees them again
    pub fn save_chips(&mut self, chips: impl IntoIterator<Item = ChipCoord>) {
        for chip in chips {
            if !self.saved_chips.contains(&chip) {
                self.saved_chips.push(chip);
            }
        }
    }

    pub fn restore_chips(&mut self) {
        for chip in self.saved_chips.drain(..) {
            self.used_chips.remove(&chip);
            if !self.restored_chips.contains(&chip) {
                self.restored_chips.push_back(chip);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshpnr_common::graph::{MachineVertex, ResourceRequirements, Slice};
    use meshpnr_common::machine::MachineDescription;
    use meshpnr_common::placements::Placement;

    #[test]
    fn cursor_wraps_from_the_start_chip() -> Result<()> {
        let machine = Machine::new(&MachineDescription::mesh(3, 2))?;
        let graph = MachineGraph::new(0);
        let spaces = Spaces::new(&machine, &graph, &[], ChipCoord::new(2, 1));
        assert_eq!(
            spaces.chip_order,
            vec![
                ChipCoord::new(2, 1),
                ChipCoord::new(2, 0),
                ChipCoord::new(0, 1),
                ChipCoord::new(0, 0),
                ChipCoord::new(1, 1),
                ChipCoord::new(1, 0),
            ]
        );
        Ok(())
    }

    #[test]
    fn chip_space_excludes_monitors_reserved_and_placed_cores() -> Result<()> {
        let machine = Machine::new(&MachineDescription::mesh(2, 2))?;
        let mut graph = MachineGraph::new(0);
        let v = graph.add_vertex(MachineVertex {
            label: "v".into(),
            app_vertex: None,
            index: 0,
            slice: Slice::new(0, 0)?,
            resources: ResourceRequirements {
                cores: 1,
                sdram: 1000,
                cpu_cycles: 0,
            },
            fixed_location: None,
        })?;
        let mut placements = Placements::new();
        placements.add_placement(Placement::new(v, 1, 0, 1))?;

        let reserved = [ReservedCore { x: 1, y: 0, p: 2 }];
        let spaces = Spaces::new(&machine, &graph, &reserved, ChipCoord::new(0, 0));
        let space = spaces.chip_with_space(ChipCoord::new(1, 0), &placements)?;
        assert_eq!(space.cores.iter().next(), Some(&3));
        assert_eq!(space.cores.len(), 15);
        assert_eq!(space.sdram, 128 * 1024 * 1024 - 1000);
        assert!(space.is_space(15, 1000));
        assert!(!space.is_space(16, 0));
        Ok(())
    }

    #[test]
    fn frontier_prefers_the_current_board() -> Result<()> {
        let machine = Machine::new(&MachineDescription::mesh(16, 8))?;
        let mut space = Space::new(ChipCoord::new(0, 0));
        let board_of = |x, y| -> (ChipCoord, ChipCoord) {
            (ChipCoord::new(x, y), ChipCoord::new(x - x % 8, 0))
        };
        space.update([board_of(8, 0), board_of(7, 0), board_of(9, 1), board_of(7, 0)]);
        assert_eq!(space.pop(&machine), Some(ChipCoord::new(7, 0)));
        assert_eq!(space.pop(&machine), Some(ChipCoord::new(8, 0)));
        assert_eq!(space.pop(&machine), Some(ChipCoord::new(9, 1)));
        assert_eq!(space.pop(&machine), None);
        assert!(space.is_empty());
        Ok(())
    }

    #[test]
    fn exhausted_space_drops_the_current_chip() -> Result<()> {
        let machine = Machine::new(&MachineDescription::mesh(2, 1))?;
        let graph = MachineGraph::new(0);
        let placements = Placements::new();
        let mut spaces = Spaces::new(&machine, &graph, &[], ChipCoord::new(0, 0));

        let mut space = spaces.start_space(&placements)?.expect("first chip missing");
        assert_eq!(spaces.current().map(|c| c.chip), Some(ChipCoord::new(0, 0)));
        spaces
            .next_chip_space(&mut space, Some(ChipCoord::new(0, 0)), &placements)?
            .expect("neighbour missing");
        assert_eq!(spaces.current().map(|c| c.chip), Some(ChipCoord::new(1, 0)));

        let exceeded = spaces
            .next_chip_space(&mut space, Some(ChipCoord::new(1, 0)), &placements)?
            .expect_err("space unexpectedly grew");
        assert_eq!(exceeded.n_used, 2);
        assert!(spaces.current().is_none());
        // Both chips were handed out, though nothing went on either
        assert_eq!(
            spaces.take_attempt_chips(),
            vec![ChipCoord::new(0, 0), ChipCoord::new(1, 0)]
        );
        assert!(spaces.start_space(&placements)?.is_err());

        spaces.save_chips([ChipCoord::new(1, 0)]);
        spaces.restore_chips();
        spaces.start_space(&placements)?.expect("restored chip missing");
        assert_eq!(spaces.current().map(|c| c.chip), Some(ChipCoord::new(1, 0)));
        Ok(())
    }
}
