//! # I/O Module
//!
//! File boundaries of the engine:
//! - `mmap_store`: growable memory-mapped register file backing live blocks
//! - `ledger`: checksummed append-only snapshot of matrices
//! - `codec`: pluggable stream compression for the ledger data file

pub mod codec;
pub mod ledger;
pub mod mmap_store;

pub use codec::Compression;
pub use ledger::{LedgerReader, LedgerRecord, LedgerWriter, RegisterHeader};
pub use mmap_store::{MMapStore, MappedRegister, OpenMode};
