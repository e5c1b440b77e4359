use anyhow::{Context, Result};
use log::{debug, info};
use meshpnr_common::graph::{ApplicationGraph, ApplicationVertexId, MachineGraph, MachineVertexId};
use std::collections::BTreeMap;

use super::{
    bits_needed, low_bits_clear_mask, AppVertexRoutingInfo, KeyAllocationError, KeyAndMask,
    MachineVertexRoutingInfo, RoutingInfo,
};

/// The partition sources that share one block of keys
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum BlockOwner {
    Application(ApplicationVertexId),
    /// A machine vertex that was not split out of an application vertex
    Machine(MachineVertexId),
}

struct BlockRequest {
    owner: BlockOwner,
    label: String,
    partition: String,
    /// (index, machine vertex) of the members that send on the partition
    members: Vec<(u32, MachineVertexId)>,
    n_machine_vertices: u32,
    n_bits_atoms: u32,
    n_bits_machine: u32,
    fixed: Option<KeyAndMask>,
}

impl BlockRequest {
    fn n_bits(&self) -> u32 {
        self.n_bits_atoms + self.n_bits_machine
    }
}

/// Give every multicast partition of `graph` a key and mask.
///
/// Blocks with a fixed key and mask are reserved first. The rest are handed out largest first,
/// each at the lowest aligned base that overlaps nothing allocated so far.
pub fn allocate(app_graph: &ApplicationGraph, graph: &MachineGraph) -> Result<RoutingInfo> {
    let requests = block_requests(app_graph, graph)?;
    info!("Allocating keys for {} blocks", requests.len());

    let mut fixed: Vec<(KeyAndMask, String)> = Vec::new();
    let mut routing_info = RoutingInfo::new();

    for request in requests.iter() {
        let key_and_mask = match request.fixed {
            Some(km) => km,
            None => continue,
        };
        let needed = request.n_bits();
        if key_and_mask.mask().count_zeros() != key_and_mask.mask().trailing_zeros()
            || key_and_mask.mask().trailing_zeros() < needed
        {
            Err(KeyAllocationError::InvalidKeyAndMask {
                key: key_and_mask.key(),
                mask: key_and_mask.mask(),
                reason: format!(
                    "{} needs the bottom {} bits of the mask clear",
                    request.label, needed
                ),
            })?
        }
        let owner = format!("partition {:?} of {}", request.partition, request.label);
        if let Some((_, other)) = fixed.iter().find(|(km, _)| km.overlaps(&key_and_mask)) {
            Err(KeyAllocationError::FixedKeyConflict {
                vertex: request.label.clone(),
                partition: request.partition.clone(),
                other: other.clone(),
            })?
        }
        fixed.push((key_and_mask, owner));
        add_block(&mut routing_info, request, key_and_mask.key())?;
    }

    let mut free: Vec<&BlockRequest> = requests.iter().filter(|r| r.fixed.is_none()).collect();
    // Stable, so equal sizes keep graph order
    free.sort_by(|a, b| b.n_bits().cmp(&a.n_bits()));

    // Blocks only get smaller, so nothing allocated here lies above the cursor
    let mut cursor: u64 = 0;
    for request in free {
        let n_bits = request.n_bits();
        let exhausted = || KeyAllocationError::KeySpaceExhausted {
            vertex: request.label.clone(),
            partition: request.partition.clone(),
            n_bits,
        };
        if n_bits > 32 {
            Err(exhausted())?
        }
        let size = 1u64 << n_bits;
        let first = (cursor + size - 1) / size * size;
        let base = candidate_bases(first, size)
            .find(|base| {
                let block = KeyAndMask {
                    key: *base as u32,
                    mask: low_bits_clear_mask(n_bits),
                };
                !fixed.iter().any(|(km, _)| km.overlaps(&block))
            })
            .ok_or_else(exhausted)?;
        debug!(
            "Partition {:?} of {} gets {} keys from {:#010x}",
            request.partition, request.label, size, base
        );
        cursor = base + size;
        add_block(&mut routing_info, request, base as u32)?;
    }

    Ok(routing_info)
}

/// Aligned bases from `first` up to the end of the 32-bit key space
fn candidate_bases(first: u64, size: u64) -> impl Iterator<Item = u64> {
    std::iter::successors(Some(first), move |base| Some(base + size))
        .take_while(move |base| base + size <= 1 << 32)
}

fn block_requests(app_graph: &ApplicationGraph, graph: &MachineGraph) -> Result<Vec<BlockRequest>> {
    let mut requests: BTreeMap<(BlockOwner, String), BlockRequest> = BTreeMap::new();
    for partition in graph.multicast_partitions() {
        let vertex = graph.vertex(partition.pre())?;
        let owner = match vertex.app_vertex {
            Some(app) => BlockOwner::Application(app),
            None => BlockOwner::Machine(partition.pre()),
        };
        let key = (owner.clone(), partition.identifier().to_string());
        if !requests.contains_key(&key) {
            let request = match owner {
                BlockOwner::Application(app) => {
                    let app_vertex = app_graph.vertex(app)?;
                    let siblings = graph.machine_vertices_of(app);
                    let mut max_atoms = 0;
                    for mv in siblings {
                        max_atoms = max_atoms.max(graph.vertex(*mv)?.slice.n_atoms());
                    }
                    let fixed = match app_vertex.fixed_key_and_mask(partition.identifier()) {
                        Some((key, mask)) => Some(KeyAndMask::new(key, mask).with_context(|| {
                            format!("Fixed key and mask of {}", app_vertex.label)
                        })?),
                        None => None,
                    };
                    BlockRequest {
                        owner: owner.clone(),
                        label: app_vertex.label.clone(),
                        partition: partition.identifier().to_string(),
                        members: Vec::new(),
                        n_machine_vertices: siblings.len() as u32,
                        n_bits_atoms: bits_needed(max_atoms as u64),
                        n_bits_machine: bits_needed(siblings.len() as u64),
                        fixed,
                    }
                }
                BlockOwner::Machine(_) => BlockRequest {
                    owner: owner.clone(),
                    label: vertex.label.clone(),
                    partition: partition.identifier().to_string(),
                    members: Vec::new(),
                    n_machine_vertices: 1,
                    n_bits_atoms: bits_needed(vertex.slice.n_atoms() as u64),
                    n_bits_machine: 0,
                    fixed: None,
                },
            };
            requests.insert(key.clone(), request);
        }
        if let Some(request) = requests.get_mut(&key) {
            request.members.push((vertex.index, partition.pre()));
        }
    }
    Ok(requests.into_values().collect())
}

fn add_block(routing_info: &mut RoutingInfo, request: &BlockRequest, base: u32) -> Result<()> {
    let machine_mask = low_bits_clear_mask(request.n_bits_atoms);
    for (index, vertex) in request.members.iter() {
        let offset = index.checked_shl(request.n_bits_atoms).unwrap_or(0);
        routing_info.add_machine_info(MachineVertexRoutingInfo {
            vertex: *vertex,
            partition: request.partition.clone(),
            key_and_mask: KeyAndMask::new(base | offset, machine_mask)?,
            index: *index,
        });
    }
    if let BlockOwner::Application(app) = request.owner {
        let key_and_mask = match request.fixed {
            Some(km) => km,
            None => KeyAndMask::block(base, request.n_bits())?,
        };
        routing_info.add_app_info(AppVertexRoutingInfo {
            vertex: app,
            partition: request.partition.clone(),
            key_and_mask,
            machine_mask,
            n_bits_atoms: request.n_bits_atoms,
            max_machine_index: request.n_machine_vertices.saturating_sub(1),
        });
    }
    Ok(())
}
