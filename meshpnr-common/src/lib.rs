//! Shared model for the meshpnr flow: the mesh the design runs on, the application and machine
//! graphs, and the placements handed from the placement tool to the routing tool.

pub mod design;
pub mod graph;
pub mod machine;
pub mod placements;

/// Number of links on every chip of the hexagonal mesh
pub const LINKS_PER_ROUTER: u8 = 6;

/// Maximum number of processors on a chip. Processor route bits follow the link bits, so this
/// also bounds the processor ids a routing entry can name.
pub const MAX_PROCESSORS_PER_CHIP: u8 = 18;
