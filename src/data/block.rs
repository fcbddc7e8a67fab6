//! # Blocks
//!
//! A [`Block`] is one [`DistanceMatrix`] scoped to a contiguous range of
//! genomic positions, together with the span of positions actually seen and
//! the number of SNPs accumulated into it.
//!
//! Position statistics are atomics so that the summary block can be shared
//! by reference across ingest workers. An empty block reports
//! `min_position == u64::MAX` and `max_position == 0`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::data::storage::{CounterWidth, DistanceMatrix};
use crate::error::{IbError, Result};

/// Sentinel minimum of a block that has seen no SNPs
pub const EMPTY_MIN_POSITION: u64 = u64::MAX;

/// Plain snapshot of a block's bookkeeping, without the matrix
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub chromosome_name: String,
    pub number: u64,
    pub position: u64,
    pub name: Option<String>,
    pub min_position: u64,
    pub max_position: u64,
    pub num_snps: u64,
    pub serial: Option<u64>,
}

impl BlockInfo {
    pub fn is_empty(&self) -> bool {
        self.num_snps == 0
    }
}

#[derive(Debug)]
pub struct Block {
    number: u64,
    position: u64,
    name: Option<String>,
    num_samples: u64,
    min_position: AtomicU64,
    max_position: AtomicU64,
    num_snps: AtomicU64,
    serial: Option<u64>,
    matrix: DistanceMatrix,
}

impl Block {
    /// Empty block for `num_samples` samples
    pub fn new(
        chromosome_name: impl Into<String>,
        name: Option<String>,
        block_size: u64,
        width: CounterWidth,
        num_samples: u64,
        position: u64,
        number: u64,
    ) -> Self {
        let matrix =
            DistanceMatrix::new(chromosome_name, block_size, num_samples, position, number, width);
        Self::from_matrix(name, matrix)
    }

    /// Wrap an existing matrix; identity is taken from the matrix
    pub fn from_matrix(name: Option<String>, matrix: DistanceMatrix) -> Self {
        Self {
            number: matrix.block_number(),
            position: matrix.block_position(),
            name,
            num_samples: matrix.dimension(),
            min_position: AtomicU64::new(EMPTY_MIN_POSITION),
            max_position: AtomicU64::new(0),
            num_snps: AtomicU64::new(0),
            serial: None,
            matrix,
        }
    }

    /// Rebuild a block from persisted bookkeeping and its matrix
    pub fn restore(info: &BlockInfo, matrix: DistanceMatrix) -> Result<Self> {
        let mut block = Self::from_matrix(info.name.clone(), matrix);
        if block.number != info.number || block.position != info.position {
            return Err(IbError::invalid_data(format!(
                "block metadata {}#{} at {} does not match matrix #{} at {}",
                info.chromosome_name, info.number, info.position, block.number, block.position
            )));
        }
        *block.min_position.get_mut() = info.min_position;
        *block.max_position.get_mut() = info.max_position;
        *block.num_snps.get_mut() = info.num_snps;
        if let Some(serial) = info.serial {
            block.set_serial(serial);
        }
        block.check()?;
        Ok(block)
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// Index of this block within its owner
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn chromosome_name(&self) -> &str {
        self.matrix.chromosome_name()
    }

    pub fn num_samples(&self) -> u64 {
        self.num_samples
    }

    pub fn min_position(&self) -> u64 {
        self.min_position.load(Ordering::Acquire)
    }

    pub fn max_position(&self) -> u64 {
        self.max_position.load(Ordering::Acquire)
    }

    pub fn num_snps(&self) -> u64 {
        self.num_snps.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.num_snps() == 0
    }

    pub fn serial(&self) -> Option<u64> {
        self.serial
    }

    pub fn matrix(&self) -> &DistanceMatrix {
        &self.matrix
    }

    pub fn matrix_mut(&mut self) -> &mut DistanceMatrix {
        &mut self.matrix
    }

    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            chromosome_name: self.chromosome_name().to_string(),
            number: self.number,
            position: self.position,
            name: self.name.clone(),
            min_position: self.min_position(),
            max_position: self.max_position(),
            num_snps: self.num_snps(),
            serial: self.serial,
        }
    }

    // ========================================================================
    // Accumulation
    // ========================================================================

    /// Add one SNP's contribution (single writer)
    pub fn accumulate(&mut self, position: u64, delta: &DistanceMatrix) -> Result<()> {
        self.matrix.add(delta).map_err(|e| e.at_position(position))?;
        *self.num_snps.get_mut() += 1;
        let min = self.min_position.get_mut();
        *min = (*min).min(position);
        let max = self.max_position.get_mut();
        *max = (*max).max(position);
        Ok(())
    }

    /// Add one SNP's contribution; safe under concurrent callers.
    ///
    /// The final state equals some sequential order of all contributions.
    pub fn accumulate_atomic(&self, position: u64, delta: &DistanceMatrix) -> Result<()> {
        self.matrix
            .add_atomic(delta)
            .map_err(|e| e.at_position(position))?;
        self.num_snps.fetch_add(1, Ordering::AcqRel);
        self.min_position.fetch_min(position, Ordering::AcqRel);
        self.max_position.fetch_max(position, Ordering::AcqRel);
        Ok(())
    }

    /// Merge another block's SNPs, bounds and matrix into this one
    pub fn sum(&mut self, other: &Block) -> Result<()> {
        self.matrix.add(&other.matrix)?;
        *self.num_snps.get_mut() += other.num_snps();
        let min = self.min_position.get_mut();
        *min = (*min).min(other.min_position());
        let max = self.max_position.get_mut();
        *max = (*max).max(other.max_position());
        Ok(())
    }

    /// Zero the matrix and statistics
    pub fn clear(&mut self) {
        self.matrix.clean();
        *self.num_snps.get_mut() = 0;
        *self.min_position.get_mut() = EMPTY_MIN_POSITION;
        *self.max_position.get_mut() = 0;
    }

    // ========================================================================
    // Verification
    // ========================================================================

    /// Compare statistics and matrix with `other`, logging the first difference
    pub fn is_equal(&self, other: &Block) -> bool {
        let label = format!("{} #{}", self.chromosome_name(), self.number);
        if self.num_snps() != other.num_snps() {
            tracing::warn!(
                block = %label,
                left = self.num_snps(),
                right = other.num_snps(),
                "num_snps differ"
            );
            return false;
        }
        if !self.is_empty() {
            if self.min_position() != other.min_position() {
                tracing::warn!(
                    block = %label,
                    left = self.min_position(),
                    right = other.min_position(),
                    "min_position differs"
                );
                return false;
            }
            if self.max_position() != other.max_position() {
                tracing::warn!(
                    block = %label,
                    left = self.max_position(),
                    right = other.max_position(),
                    "max_position differs"
                );
                return false;
            }
        }
        self.matrix.is_equal(&other.matrix)
    }

    /// Self-consistency of bookkeeping against the matrix
    pub fn check(&self) -> Result<()> {
        let label = || format!("{} #{}", self.chromosome_name(), self.number);
        if self.number != self.matrix.block_number() {
            return Err(IbError::invalid_data(format!(
                "block {}: number {} != matrix number {}",
                label(),
                self.number,
                self.matrix.block_number()
            )));
        }
        if self.position != self.matrix.block_position() {
            return Err(IbError::invalid_data(format!(
                "block {}: position {} != matrix position {}",
                label(),
                self.position,
                self.matrix.block_position()
            )));
        }
        if !self.is_empty() && self.min_position() > self.max_position() {
            return Err(IbError::invalid_data(format!(
                "block {}: min position {} > max position {}",
                label(),
                self.min_position(),
                self.max_position()
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Serial
    // ========================================================================

    pub fn set_serial(&mut self, serial: u64) {
        self.serial = Some(serial);
        self.matrix.set_serial(serial);
    }

    /// Fail unless both the block and its matrix carry `serial`
    pub fn check_serial(&self, serial: u64) -> Result<()> {
        for actual in [self.serial, self.matrix.serial()] {
            if actual != Some(serial) {
                return Err(IbError::OutOfOrder {
                    context: format!("block {} #{}", self.chromosome_name(), self.number),
                    expected: serial,
                    actual: actual.unwrap_or(u64::MAX),
                });
            }
        }
        Ok(())
    }
}
