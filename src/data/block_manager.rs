//! # Block Manager
//!
//! Registry of the blocks of one domain (a chromosome, or the whole-genome
//! summary) in creation order, indexed by name and by block number.
//!
//! Each manager owns exactly one [`MMapStore`]. Creating a block grows the
//! store by one register; register `k` backs the block at position `k`, and
//! the block's matrix reads and writes that register in place.
//! [`BlockManager::sync`] flushes the registers and writes a JSON sidecar
//! (`<store>.json`) describing every block. The sidecar is what lets
//! [`BlockManager::open_existing`] reopen the store read-only later.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::data::block::{Block, BlockInfo};
use crate::data::storage::{CounterStore, CounterWidth, DistanceMatrix};
use crate::error::{IbError, Result};
use crate::io::mmap_store::{MMapStore, OpenMode};

/// Contents of the `<store>.json` sidecar
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub domain: String,
    pub width: CounterWidth,
    pub dimension: u64,
    pub block_size: u64,
    pub blocks: Vec<BlockInfo>,
}

/// Path of the sidecar written next to a store
pub fn sidecar_path(store_path: &Path) -> PathBuf {
    let mut name = store_path.as_os_str().to_os_string();
    name.push(".json");
    PathBuf::from(name)
}

#[derive(Debug)]
pub struct BlockManager {
    domain: String,
    store: MMapStore,
    width: CounterWidth,
    dimension: u64,
    block_size: u64,
    blocks: Vec<Block>,
    name_index: HashMap<String, usize>,
    number_index: HashMap<u64, usize>,
}

impl BlockManager {
    /// Start an empty registry backed by a fresh store at `path`
    pub fn new(
        domain: impl Into<String>,
        path: impl AsRef<Path>,
        width: CounterWidth,
        num_samples: u64,
        block_size: u64,
    ) -> Result<Self> {
        let domain = domain.into();
        let mut store = MMapStore::open(path, width, num_samples, OpenMode::ReadWrite)?;
        if !store.is_empty() {
            debug!(domain = %domain, stale = store.len(), "discarding registers of a previous run");
            store.extend(-(store.len() as i64))?;
        }
        Ok(Self {
            domain,
            store,
            width,
            dimension: num_samples,
            block_size,
            blocks: Vec::new(),
            name_index: HashMap::new(),
            number_index: HashMap::new(),
        })
    }

    /// Reopen a synced store read-only from its sidecar
    pub fn open_existing(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata: StoreMetadata =
            serde_json::from_reader(BufReader::new(File::open(sidecar_path(path))?))?;
        let store = MMapStore::open(path, metadata.width, metadata.dimension, OpenMode::ReadOnly)?;

        if store.len() != metadata.blocks.len() as u64 {
            return Err(IbError::invalid_data(format!(
                "{}: {} registers on disk but sidecar lists {} blocks",
                path.display(),
                store.len(),
                metadata.blocks.len()
            )));
        }

        let mut manager = Self {
            domain: metadata.domain,
            store,
            width: metadata.width,
            dimension: metadata.dimension,
            block_size: metadata.block_size,
            blocks: Vec::with_capacity(metadata.blocks.len()),
            name_index: HashMap::new(),
            number_index: HashMap::new(),
        };

        for (position, info) in metadata.blocks.iter().enumerate() {
            if info.position != position as u64 {
                return Err(IbError::invalid_data(format!(
                    "{}: block #{} listed at position {} but stored at {}",
                    path.display(),
                    info.number,
                    info.position,
                    position
                )));
            }
            let mut matrix = DistanceMatrix::new(
                manager.domain.clone(),
                manager.block_size,
                manager.dimension,
                info.position,
                info.number,
                manager.width,
            );
            matrix.load_array(&manager.store.read_register(info.position)?)?;
            let block = Block::restore(info, matrix)?;
            manager.register(block)?;
        }

        info!(
            domain = %manager.domain,
            blocks = manager.blocks.len(),
            "reopened block store read-only"
        );
        Ok(manager)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn width(&self) -> CounterWidth {
        self.width
    }

    pub fn dimension(&self) -> u64 {
        self.dimension
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn store(&self) -> &MMapStore {
        &self.store
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn last(&self) -> Option<&Block> {
        self.blocks.last()
    }

    fn register(&mut self, block: Block) -> Result<&mut Block> {
        let position = self.blocks.len();
        if self.number_index.contains_key(&block.number()) {
            return Err(IbError::invalid_data(format!(
                "{}: block #{} already exists",
                self.domain,
                block.number()
            )));
        }
        if let Some(name) = block.name() {
            if self.name_index.contains_key(name) {
                return Err(IbError::invalid_data(format!(
                    "{}: block '{}' already exists",
                    self.domain, name
                )));
            }
            self.name_index.insert(name.to_string(), position);
        }
        self.number_index.insert(block.number(), position);
        self.blocks.push(block);
        self.blocks
            .last_mut()
            .ok_or_else(|| IbError::out_of_range(self.domain.clone(), position as u64, 0))
    }

    /// Append a new empty block whose matrix lives in a fresh register
    pub fn new_block(&mut self, name: Option<&str>, number: u64) -> Result<&mut Block> {
        if self.number_index.contains_key(&number) {
            return Err(IbError::invalid_data(format!(
                "{}: block #{} already exists",
                self.domain, number
            )));
        }
        if let Some(name) = name {
            if self.name_index.contains_key(name) {
                return Err(IbError::invalid_data(format!(
                    "{}: block '{}' already exists",
                    self.domain, name
                )));
            }
        }
        self.store.extend(1)?;
        let position = self.blocks.len() as u64;
        let counters = if self.store.register_length() == 0 {
            CounterStore::new(self.width, 0)
        } else {
            CounterStore::mapped(self.store.map_register(position)?)?
        };
        let matrix = DistanceMatrix::with_counters(
            self.domain.clone(),
            self.block_size,
            self.dimension,
            position,
            number,
            counters,
        )?;
        debug!(domain = %self.domain, number, position, "created block");
        self.register(Block::from_matrix(name.map(str::to_string), matrix))
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    fn resolve(&self, position: usize) -> Result<usize> {
        if position >= self.blocks.len() {
            return Err(IbError::out_of_range(
                format!("{} block list", self.domain),
                position as u64,
                self.blocks.len() as u64,
            ));
        }
        Ok(position)
    }

    fn position_of_name(&self, name: &str) -> Result<usize> {
        let position = *self
            .name_index
            .get(name)
            .ok_or_else(|| IbError::not_found("block", format!("{}:{}", self.domain, name)))?;
        self.resolve(position)
    }

    fn position_of_number(&self, number: u64) -> Result<usize> {
        let position = *self
            .number_index
            .get(&number)
            .ok_or_else(|| IbError::not_found("block", format!("{}#{}", self.domain, number)))?;
        self.resolve(position)
    }

    pub fn has_number(&self, number: u64) -> bool {
        self.number_index.contains_key(&number)
    }

    pub fn get_by_name(&self, name: &str) -> Result<&Block> {
        let position = self.position_of_name(name)?;
        Ok(&self.blocks[position])
    }

    pub fn get_by_name_mut(&mut self, name: &str) -> Result<&mut Block> {
        let position = self.position_of_name(name)?;
        Ok(&mut self.blocks[position])
    }

    pub fn get_by_number(&self, number: u64) -> Result<&Block> {
        let position = self.position_of_number(number)?;
        Ok(&self.blocks[position])
    }

    pub fn get_by_number_mut(&mut self, number: u64) -> Result<&mut Block> {
        let position = self.position_of_number(number)?;
        Ok(&mut self.blocks[position])
    }

    pub fn get_by_position(&self, position: u64) -> Result<&Block> {
        let position = self.resolve(position as usize)?;
        Ok(&self.blocks[position])
    }

    pub fn get_by_position_mut(&mut self, position: u64) -> Result<&mut Block> {
        let position = self.resolve(position as usize)?;
        Ok(&mut self.blocks[position])
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub fn metadata(&self) -> StoreMetadata {
        StoreMetadata {
            domain: self.domain.clone(),
            width: self.width,
            dimension: self.dimension,
            block_size: self.block_size,
            blocks: self.blocks.iter().map(Block::info).collect(),
        }
    }

    /// Flush every block's register and refresh the sidecar
    pub fn sync(&mut self) -> Result<()> {
        for block in &self.blocks {
            block.matrix().flush()?;
        }
        self.store.flush()?;

        let sidecar = sidecar_path(self.store.path());
        let mut writer = BufWriter::new(File::create(&sidecar)?);
        serde_json::to_writer_pretty(&mut writer, &self.metadata())?;
        writer.flush()?;

        debug!(domain = %self.domain, blocks = self.blocks.len(), "synced block store");
        Ok(())
    }

    /// Sync (when writable) and release the store
    pub fn close(&mut self) -> Result<()> {
        if self.store.mode() == OpenMode::ReadWrite {
            self.sync()?;
        }
        self.store.close()
    }
}
