//! # Counter Storage
//!
//! ## Role
//! Fixed-width counter arrays and the distance matrix built on top of them.
//!
//! ## Layers
//! - [`CounterStore`]: width-tagged atomic cells with overflow-checked arithmetic.
//! - [`CounterArray`]: owned width-typed snapshot, the unit exchanged with
//!   the ledger and the memory-mapped store.
//! - [`DistanceMatrix`]: a [`CounterStore`] addressed by sample pair through a
//!   shared [`CoordinateMap`](crate::data::coords::CoordinateMap).

pub mod counters;
pub mod matrix;

pub use counters::{CounterArray, CounterStore, CounterWidth};
pub use matrix::{DistanceMatrix, Mismatch};
