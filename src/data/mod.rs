//! # Data Module
//!
//! In-memory representations of the distance data. This is the core "Model"
//! layer.
//!
//! ## Layers (bottom-up)
//! - `coords`: pair <-> flat index mapping, cached per dimension
//! - `storage`: fixed-width counters and the distance matrix
//! - `block`: one matrix over a range of positions, with position stats
//! - `block_manager`: per-domain block registry backed by a register store
//! - `chromosome`: lazily created, ordered blocks plus a chromosome summary
//! - `samples`: the run's sample set

pub mod block;
pub mod block_manager;
pub mod chromosome;
pub mod coords;
pub mod samples;
pub mod storage;

// Re-export commonly used types
pub use block::{Block, BlockInfo};
pub use block_manager::BlockManager;
pub use chromosome::{Chromosome, ChromosomeInfo};
pub use coords::CoordinateMap;
pub use samples::{SampleIdx, Samples};
pub use storage::{CounterArray, CounterStore, CounterWidth, DistanceMatrix};
