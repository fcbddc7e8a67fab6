//! # Chromosomes
//!
//! A [`Chromosome`] is an ordered run of blocks keyed by block number plus a
//! chromosome-wide summary block. Blocks are created lazily the first time
//! an observation falls into them.
//!
//! With `keep_empty_blocks` the block list is dense: every missing number
//! from zero up to the requested one is synthesized as an empty block
//! first. Without it the list is sparse, but block numbers must still arrive
//! in increasing order.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::block::{Block, BlockInfo, EMPTY_MIN_POSITION};
use crate::data::block_manager::BlockManager;
use crate::data::storage::{CounterWidth, DistanceMatrix};
use crate::error::{IbError, Result};
use crate::io::ledger::LedgerWriter;

/// Plain description of a chromosome, as persisted in database metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChromosomeInfo {
    pub name: String,
    pub number: u64,
    pub min_position: u64,
    pub max_position: u64,
    pub num_snps: u64,
    pub num_blocks: u64,
}

impl ChromosomeInfo {
    /// Registers this chromosome occupies: one per block plus its summary
    pub fn num_registers(&self) -> u64 {
        self.num_blocks + 1
    }
}

#[derive(Debug)]
pub struct Chromosome {
    name: String,
    number: u64,
    block_size: u64,
    keep_empty_blocks: bool,
    manager: BlockManager,
    summary: Block,
    min_position: u64,
    max_position: u64,
    num_snps: u64,
}

impl Chromosome {
    /// Empty chromosome whose blocks live in the store at `path`
    pub fn new(
        name: impl Into<String>,
        number: u64,
        path: impl AsRef<Path>,
        width: CounterWidth,
        num_samples: u64,
        block_size: u64,
        keep_empty_blocks: bool,
    ) -> Result<Self> {
        let name = name.into();
        let manager = BlockManager::new(name.clone(), path, width, num_samples, block_size)?;
        let summary = Block::new(
            name.clone(),
            Some(name.clone()),
            block_size,
            width,
            num_samples,
            0,
            0,
        );
        Ok(Self {
            name,
            number,
            block_size,
            keep_empty_blocks,
            manager,
            summary,
            min_position: EMPTY_MIN_POSITION,
            max_position: 0,
            num_snps: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn keep_empty_blocks(&self) -> bool {
        self.keep_empty_blocks
    }

    pub fn min_position(&self) -> u64 {
        self.min_position
    }

    pub fn max_position(&self) -> u64 {
        self.max_position
    }

    pub fn num_snps(&self) -> u64 {
        self.num_snps
    }

    pub fn num_blocks(&self) -> usize {
        self.manager.len()
    }

    pub fn blocks(&self) -> &[Block] {
        self.manager.blocks()
    }

    pub fn summary(&self) -> &Block {
        &self.summary
    }

    pub fn manager(&self) -> &BlockManager {
        &self.manager
    }

    pub fn info(&self) -> ChromosomeInfo {
        ChromosomeInfo {
            name: self.name.clone(),
            number: self.number,
            min_position: self.min_position,
            max_position: self.max_position,
            num_snps: self.num_snps,
            num_blocks: self.manager.len() as u64,
        }
    }

    /// Block number that `position` falls into
    pub fn block_number_of(&self, position: u64) -> u64 {
        position / self.block_size.max(1)
    }

    pub fn get_block(&self, number: u64) -> Result<&Block> {
        self.manager.get_by_number(number)
    }

    /// Make sure block `number` exists, creating it (and any empty
    /// predecessors when keeping empty blocks) if needed
    fn ensure_block(&mut self, number: u64) -> Result<()> {
        if self.manager.has_number(number) {
            return Ok(());
        }

        let last = self.manager.last().map(Block::number);
        if let Some(last) = last {
            if number < last {
                return Err(IbError::invalid_data(format!(
                    "chromosome {}: block #{} requested after block #{}",
                    self.name, number, last
                )));
            }
        }

        if self.keep_empty_blocks {
            let first_missing = last.map_or(0, |l| l + 1);
            for filler in first_missing..number {
                self.manager.new_block(None, filler)?;
            }
            if number > first_missing {
                debug!(
                    chromosome = %self.name,
                    from = first_missing,
                    to = number - 1,
                    "synthesized empty blocks"
                );
            }
        }
        self.manager.new_block(None, number)?;
        Ok(())
    }

    /// Accumulate one SNP's distances into block `block_number` and the
    /// chromosome summary
    pub fn add(&mut self, block_number: u64, position: u64, delta: &DistanceMatrix) -> Result<()> {
        self.ensure_block(block_number)?;
        let block = self.manager.get_by_number_mut(block_number).map_err(|e| {
            if e.is_not_found() {
                // The block was created just above
                IbError::out_of_range(
                    format!("chromosome {} block index", self.name),
                    block_number,
                    0,
                )
            } else {
                e
            }
        })?;
        block.accumulate(position, delta)?;
        let (block_min, block_max) = (block.min_position(), block.max_position());

        self.summary
            .accumulate(position, delta)
            .map_err(|e| e.in_matrix(&self.name, "summary"))?;
        self.num_snps += 1;
        self.min_position = self.min_position.min(block_min);
        self.max_position = self.max_position.max(block_max);
        Ok(())
    }

    /// Self-consistency of every block, the summary and the SNP totals
    pub fn check(&self) -> Result<()> {
        for block in self.manager.blocks() {
            block.check()?;
        }
        self.summary.check()?;
        let total: u64 = self.manager.blocks().iter().map(Block::num_snps).sum();
        if total != self.num_snps || self.summary.num_snps() != self.num_snps {
            return Err(IbError::invalid_data(format!(
                "chromosome {}: {} SNPs recorded but blocks hold {} and summary {}",
                self.name,
                self.num_snps,
                total,
                self.summary.num_snps()
            )));
        }
        Ok(())
    }

    pub fn block_infos(&self) -> Vec<BlockInfo> {
        self.manager.blocks().iter().map(Block::info).collect()
    }

    /// Append the summary and then every block to `writer`, stamping each
    /// with the serial it was written under
    pub fn dump(&mut self, writer: &mut LedgerWriter) -> Result<()> {
        let serial = writer.write(&self.summary.matrix().snapshot())?;
        self.summary.set_serial(serial);
        for position in 0..self.manager.len() as u64 {
            let block = self.manager.get_by_position_mut(position)?;
            let serial = writer.write(&block.matrix().snapshot())?;
            block.set_serial(serial);
        }
        Ok(())
    }

    /// Write blocks back to their registers
    pub fn sync(&mut self) -> Result<()> {
        self.manager.sync()
    }

    pub fn close(&mut self) -> Result<()> {
        self.manager.close()
    }
}
