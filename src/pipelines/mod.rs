//! # Pipeline Module
//!
//! Run-level orchestration: the ingest coordinator that owns a live run,
//! and the saved database that a finished run turns into.

pub mod database;
pub mod ingest;

pub use database::{Database, DatabaseMetadata, DistanceQueries};
pub use ingest::{
    ingest_partitioned, spread_chromosomes, ChromosomeFeed, IngestCoordinator, Observation,
    RunCounters, RunState,
};
