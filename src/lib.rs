//! # ibrowser Library
//!
//! Storage engine for pairwise genotype-distance matrices over a cohort of
//! samples, accumulated per genomic block, per chromosome and genome-wide.
//!
//! ## Modules
//! - `config`: run parameters and CLI argument parsing
//! - `data`: coordinates, counters, matrices, blocks and chromosomes
//! - `error`: Error types and result aliases
//! - `io`: memory-mapped register stores and the matrix ledger
//! - `pipelines`: ingest coordination, saved databases and queries
//! - `utils`: Shared utilities (telemetry, thread pools)

pub mod config;
pub mod data;
pub mod error;
pub mod io;
pub mod pipelines;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, RunParameters};
pub use data::{
    Block, BlockInfo, BlockManager, Chromosome, ChromosomeInfo, CoordinateMap, CounterWidth,
    DistanceMatrix, SampleIdx, Samples,
};
pub use error::{IbError, Result};
pub use io::{Compression, LedgerReader, LedgerWriter, MMapStore, OpenMode};

pub use pipelines::{Database, DistanceQueries, IngestCoordinator, Observation};
