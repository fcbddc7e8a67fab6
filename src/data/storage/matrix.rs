//! # Distance Matrix
//!
//! A symmetric sample-by-sample distance matrix with no diagonal, stored as
//! one [`CounterStore`] addressed through a shared [`CoordinateMap`].
//!
//! Callers address cells by sample pair `(i, j)` only; the flat position is
//! an implementation detail of the coordinate map. `(i, j)` and `(j, i)`
//! name the same cell.
//!
//! ## Accumulation paths
//! - `&mut self` methods (`set`, `increment`, `add`) are for a single writer.
//! - `&self` methods (`increment_atomic`, `add_atomic`) use per-cell
//!   compare-and-swap and may be called from many threads at once.

use std::sync::Arc;

use crate::data::coords::CoordinateMap;
use crate::data::storage::{CounterArray, CounterStore, CounterWidth};
use crate::error::{IbError, Result};

/// First disagreement found by [`DistanceMatrix::compare`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mismatch {
    BlockSize { left: u64, right: u64 },
    Dimension { left: u64, right: u64 },
    Width { left: CounterWidth, right: CounterWidth },
    Size { left: u64, right: u64 },
    Cell { i: u64, j: u64, left: u64, right: u64 },
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlockSize { left, right } => write!(f, "block size {} != {}", left, right),
            Self::Dimension { left, right } => write!(f, "dimension {} != {}", left, right),
            Self::Width { left, right } => write!(f, "width {} != {}", left, right),
            Self::Size { left, right } => write!(f, "size {} != {}", left, right),
            Self::Cell { i, j, left, right } => {
                write!(f, "cell ({}, {}) {} != {}", i, j, left, right)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct DistanceMatrix {
    chromosome_name: String,
    block_size: u64,
    dimension: u64,
    size: u64,
    block_position: u64,
    block_number: u64,
    /// Ledger serial, assigned when the matrix is dumped
    serial: Option<u64>,
    coords: Arc<CoordinateMap>,
    counters: CounterStore,
}

impl DistanceMatrix {
    /// Zero-filled matrix for `dimension` samples
    pub fn new(
        chromosome_name: impl Into<String>,
        block_size: u64,
        dimension: u64,
        block_position: u64,
        block_number: u64,
        width: CounterWidth,
    ) -> Self {
        let coords = CoordinateMap::shared(dimension);
        let size = coords.size();
        Self {
            chromosome_name: chromosome_name.into(),
            block_size,
            dimension,
            size,
            block_position,
            block_number,
            serial: None,
            coords,
            counters: CounterStore::new(width, size),
        }
    }

    /// Matrix over existing counters, such as a block's mapped register
    pub fn with_counters(
        chromosome_name: impl Into<String>,
        block_size: u64,
        dimension: u64,
        block_position: u64,
        block_number: u64,
        counters: CounterStore,
    ) -> Result<Self> {
        let coords = CoordinateMap::shared(dimension);
        let size = coords.size();
        let chromosome_name = chromosome_name.into();
        if counters.len() != size {
            return Err(IbError::shape(
                format!("matrix counters ({} block {})", chromosome_name, block_number),
                format!("{} cells for {} samples", size, dimension),
                format!("{} cells", counters.len()),
            ));
        }
        Ok(Self {
            chromosome_name,
            block_size,
            dimension,
            size,
            block_position,
            block_number,
            serial: None,
            coords,
            counters,
        })
    }

    /// Zero-filled matrix with the same shape and identity as `self`
    pub fn empty_like(&self) -> Self {
        Self::new(
            self.chromosome_name.clone(),
            self.block_size,
            self.dimension,
            self.block_position,
            self.block_number,
            self.width(),
        )
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn chromosome_name(&self) -> &str {
        &self.chromosome_name
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn dimension(&self) -> u64 {
        self.dimension
    }

    /// Number of stored cells, `dimension * (dimension - 1) / 2`
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn block_position(&self) -> u64 {
        self.block_position
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn serial(&self) -> Option<u64> {
        self.serial
    }

    pub fn set_serial(&mut self, serial: u64) {
        self.serial = Some(serial);
    }

    pub fn width(&self) -> CounterWidth {
        self.counters.width()
    }

    pub fn counters(&self) -> &CounterStore {
        &self.counters
    }

    /// Write mapped counters back to their register file
    pub fn flush(&self) -> Result<()> {
        self.counters.flush()
    }

    // ------------------------------------------------------------------------
    // Cell access
    // ------------------------------------------------------------------------

    #[inline]
    fn index(&self, i: u64, j: u64) -> Result<u64> {
        self.coords.index_of(i, j).ok_or(IbError::InvalidPair {
            i,
            j,
            dimension: self.dimension,
        })
    }

    /// Report a flat-cell overflow against this matrix and its sample pair
    fn locate(&self, err: IbError) -> IbError {
        match err {
            IbError::Overflow {
                cell,
                current,
                value,
                width,
            } => {
                let (i, j) = self.coords.pair_of(cell).unwrap_or((cell, cell));
                IbError::PairOverflow {
                    chromosome: self.chromosome_name.clone(),
                    block: format!("#{}", self.block_number),
                    i,
                    j,
                    position: None,
                    current,
                    value,
                    width,
                }
            }
            other => other,
        }
    }

    pub fn get(&self, i: u64, j: u64) -> Result<u64> {
        let p = self.index(i, j)?;
        self.counters.get(p)
    }

    pub fn set(&mut self, i: u64, j: u64, value: u64) -> Result<()> {
        let p = self.index(i, j)?;
        self.counters.set(p, value).map_err(|e| self.locate(e))
    }

    pub fn increment(&mut self, i: u64, j: u64, value: u64) -> Result<()> {
        let p = self.index(i, j)?;
        self.counters.increment(p, value).map_err(|e| self.locate(e))
    }

    /// Increment one cell; safe under concurrent callers
    pub fn increment_atomic(&self, i: u64, j: u64, value: u64) -> Result<()> {
        let p = self.index(i, j)?;
        self.counters.increment_atomic(p, value).map_err(|e| self.locate(e))
    }

    // ------------------------------------------------------------------------
    // Bulk operations
    // ------------------------------------------------------------------------

    fn check_compatible(&self, other: &DistanceMatrix) -> Result<()> {
        if self.dimension != other.dimension
            || self.width() != other.width()
            || self.size != other.size
        {
            return Err(IbError::shape(
                format!("matrix add ({} block {})", self.chromosome_name, self.block_number),
                format!("{} samples x {}", self.dimension, self.width()),
                format!("{} samples x {}", other.dimension, other.width()),
            ));
        }
        Ok(())
    }

    /// Elementwise add `other` into `self`
    pub fn add(&mut self, other: &DistanceMatrix) -> Result<()> {
        self.check_compatible(other)?;
        self.counters.merge(&other.counters).map_err(|e| self.locate(e))
    }

    /// Elementwise add with per-cell fetch-add
    pub fn add_atomic(&self, other: &DistanceMatrix) -> Result<()> {
        self.check_compatible(other)?;
        self.counters.merge_atomic(&other.counters).map_err(|e| self.locate(e))
    }

    /// Zero every cell
    pub fn clean(&mut self) {
        self.counters.clean();
    }

    // ------------------------------------------------------------------------
    // Comparison
    // ------------------------------------------------------------------------

    /// First disagreement with `other`, or `None` when both are equal
    pub fn compare(&self, other: &DistanceMatrix) -> Option<Mismatch> {
        if self.block_size != other.block_size {
            return Some(Mismatch::BlockSize {
                left: self.block_size,
                right: other.block_size,
            });
        }
        if self.dimension != other.dimension {
            return Some(Mismatch::Dimension {
                left: self.dimension,
                right: other.dimension,
            });
        }
        if self.width() != other.width() {
            return Some(Mismatch::Width {
                left: self.width(),
                right: other.width(),
            });
        }
        if self.size != other.size {
            return Some(Mismatch::Size {
                left: self.size,
                right: other.size,
            });
        }

        let (p, (left, right)) = self
            .counters
            .iter()
            .zip(other.counters.iter())
            .enumerate()
            .find(|(_, (l, r))| l != r)?;
        let (i, j) = self.coords.pair_of(p as u64)?;
        Some(Mismatch::Cell { i, j, left, right })
    }

    /// Whether `other` holds the same shape and cells.
    ///
    /// Logs the first difference.
    pub fn is_equal(&self, other: &DistanceMatrix) -> bool {
        match self.compare(other) {
            None => true,
            Some(mismatch) => {
                tracing::warn!(
                    chromosome = %self.chromosome_name,
                    block = self.block_number,
                    "matrices differ: {}",
                    mismatch
                );
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Export
    // ------------------------------------------------------------------------

    /// Every cell widened to u64, in flat order
    pub fn export_table(&self) -> Vec<u64> {
        self.counters.iter().collect()
    }

    /// Distances from sample `k` to every sample `j < k`.
    ///
    /// The result has one slot per sample; slots `j >= k` are zero.
    pub fn get_column(&self, k: u64) -> Result<Vec<u64>> {
        if k >= self.dimension {
            return Err(IbError::out_of_range("matrix column", k, self.dimension));
        }
        let mut column = vec![0u64; self.dimension as usize];
        for j in 0..k {
            column[j as usize] = self.get(j, k)?;
        }
        Ok(column)
    }

    /// Width-typed copy of the counters
    pub fn snapshot(&self) -> CounterArray {
        self.counters.to_array()
    }

    /// Replace every counter from a snapshot of the same width and size
    pub fn load_array(&mut self, array: &CounterArray) -> Result<()> {
        self.counters.load_array(array).map_err(|e| self.locate(e))
    }
}
