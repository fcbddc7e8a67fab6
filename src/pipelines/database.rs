//! # Saved Databases and Presentation Queries
//!
//! A saved run is two files under an output prefix:
//!
//! - `<prefix>_matrix.bin[.gz]`: the matrix ledger, holding the genome
//!   summary and then, per chromosome in ingest order, the chromosome
//!   summary followed by its blocks
//! - `<prefix>_matrix.json`: samples, run parameters and the block layout
//!   that says which ledger record belongs where
//!
//! [`Database::load`] reads both back and verifies every checksum and
//! serial. Both a loaded [`Database`] and a live
//! [`IngestCoordinator`](crate::pipelines::ingest::IngestCoordinator)
//! answer the read-only [`DistanceQueries`].

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::config::RunParameters;
use crate::data::block::{Block, BlockInfo};
use crate::data::chromosome::ChromosomeInfo;
use crate::data::coords::triangle_size;
use crate::data::samples::Samples;
use crate::data::storage::DistanceMatrix;
use crate::error::{IbError, Result};
use crate::io::codec::Compression;
use crate::io::ledger::LedgerReader;

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// `<prefix>_matrix.json`
pub fn metadata_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, "_matrix.json")
}

/// `<prefix>_matrix.bin`, plus the codec extension
pub fn ledger_path(prefix: &Path, compression: Compression) -> PathBuf {
    compression.apply_extension(&with_suffix(prefix, "_matrix.bin"))
}

/// `<prefix>_summary.bin`
pub fn summary_store_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, "_summary.bin")
}

/// `<prefix>_chromosomes_<name>.bin`
pub fn chromosome_store_path(prefix: &Path, name: &str) -> PathBuf {
    with_suffix(prefix, &format!("_chromosomes_{}.bin", name))
}

/// Ledger layout of one chromosome
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChromosomeLayout {
    pub info: ChromosomeInfo,
    pub summary: BlockInfo,
    pub blocks: Vec<BlockInfo>,
}

/// Contents of `<prefix>_matrix.json`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    pub samples: Samples,
    pub parameters: RunParameters,
    pub num_samples: u64,
    pub num_snps: u64,
    pub num_blocks: u64,
    pub num_registers: u64,
    /// Ledger file name, relative to the metadata file
    pub ledger: String,
    pub summary: BlockInfo,
    pub chromosomes: Vec<ChromosomeLayout>,
}

impl DatabaseMetadata {
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?)
    }
}

// ============================================================================
// Queries
// ============================================================================

/// Read-only accessors for the presentation layer.
///
/// Every method answers `Ok(None)` when the requested item does not exist;
/// errors are reserved for broken state.
pub trait DistanceQueries {
    fn sample_names(&self) -> Result<Option<Vec<String>>>;
    fn chromosome_names(&self) -> Result<Option<Vec<String>>>;
    fn summary_block(&self) -> Result<Option<BlockInfo>>;
    fn summary_table(&self) -> Result<Option<Vec<u64>>>;
    /// Distances from sample `reference` to every lower-indexed sample
    fn summary_column(&self, reference: u64) -> Result<Option<Vec<u64>>>;
    fn chromosome_summary(&self, chromosome: &str) -> Result<Option<BlockInfo>>;
    fn chromosome_table(&self, chromosome: &str) -> Result<Option<Vec<u64>>>;
    fn block(&self, chromosome: &str, number: u64) -> Result<Option<BlockInfo>>;
    fn block_table(&self, chromosome: &str, number: u64) -> Result<Option<Vec<u64>>>;
    fn block_column(&self, chromosome: &str, number: u64, reference: u64)
        -> Result<Option<Vec<u64>>>;
}

/// Turn a `NotFound` error into `None`
pub(crate) fn found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Column of `matrix`, or `None` for a reference outside the sample set
pub(crate) fn column_of(matrix: &DistanceMatrix, reference: u64) -> Result<Option<Vec<u64>>> {
    if reference >= matrix.dimension() {
        return Ok(None);
    }
    matrix.get_column(reference).map(Some)
}

// ============================================================================
// Database
// ============================================================================

/// A chromosome read back from a ledger
#[derive(Debug)]
pub struct LoadedChromosome {
    info: ChromosomeInfo,
    summary: Block,
    blocks: Vec<Block>,
    by_number: HashMap<u64, usize>,
}

impl LoadedChromosome {
    pub fn info(&self) -> &ChromosomeInfo {
        &self.info
    }

    pub fn summary(&self) -> &Block {
        &self.summary
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn get_block(&self, number: u64) -> Result<&Block> {
        let position = *self
            .by_number
            .get(&number)
            .ok_or_else(|| IbError::not_found("block", format!("{}#{}", self.info.name, number)))?;
        self.blocks.get(position).ok_or_else(|| {
            IbError::out_of_range(
                format!("{} block list", self.info.name),
                position as u64,
                self.blocks.len() as u64,
            )
        })
    }
}

#[derive(Debug)]
pub struct Database {
    metadata: DatabaseMetadata,
    summary: Block,
    chromosomes: Vec<LoadedChromosome>,
    by_name: HashMap<String, usize>,
}

impl Database {
    /// Load the database saved under `prefix`
    #[instrument(name = "load_database", skip_all, fields(prefix = %prefix.as_ref().display()))]
    pub fn load(prefix: impl AsRef<Path>) -> Result<Self> {
        let prefix = prefix.as_ref();
        let metadata_file = metadata_path(prefix);
        let metadata = DatabaseMetadata::read(&metadata_file)?;
        metadata.parameters.validate()?;

        let ledger = metadata_file
            .parent()
            .map(|dir| dir.join(&metadata.ledger))
            .unwrap_or_else(|| PathBuf::from(&metadata.ledger));
        let mut reader = LedgerReader::open_for_read(&ledger, metadata.parameters.compression)?;
        reader.expect_shape(metadata.parameters.width, triangle_size(metadata.num_samples))?;
        let loader = RecordLoader {
            parameters: &metadata.parameters,
            dimension: metadata.num_samples,
        };

        let summary = loader.next_block(&mut reader, &metadata.summary)?;
        let mut chromosomes = Vec::with_capacity(metadata.chromosomes.len());
        let mut by_name = HashMap::new();
        for layout in &metadata.chromosomes {
            let summary = loader.next_block(&mut reader, &layout.summary)?;
            let mut blocks = Vec::with_capacity(layout.blocks.len());
            let mut by_number = HashMap::new();
            for info in &layout.blocks {
                by_number.insert(info.number, blocks.len());
                blocks.push(loader.next_block(&mut reader, info)?);
            }
            by_name.insert(layout.info.name.clone(), chromosomes.len());
            chromosomes.push(LoadedChromosome {
                info: layout.info.clone(),
                summary,
                blocks,
                by_number,
            });
        }

        let terminal = reader.read(metadata.parameters.width)?;
        if !terminal.is_terminal() {
            return Err(IbError::invalid_data(format!(
                "{}: record {} follows the last block in the layout",
                ledger.display(),
                terminal.header.serial
            )));
        }

        info!(
            samples = metadata.num_samples,
            chromosomes = chromosomes.len(),
            blocks = metadata.num_blocks,
            "loaded database"
        );
        Ok(Self {
            metadata,
            summary,
            chromosomes,
            by_name,
        })
    }

    pub fn metadata(&self) -> &DatabaseMetadata {
        &self.metadata
    }

    pub fn samples(&self) -> &Samples {
        &self.metadata.samples
    }

    pub fn parameters(&self) -> &RunParameters {
        &self.metadata.parameters
    }

    pub fn summary(&self) -> &Block {
        &self.summary
    }

    pub fn chromosomes(&self) -> &[LoadedChromosome] {
        &self.chromosomes
    }

    pub fn chromosome(&self, name: &str) -> Result<&LoadedChromosome> {
        let position = *self
            .by_name
            .get(name)
            .ok_or_else(|| IbError::not_found("chromosome", name))?;
        self.chromosomes.get(position).ok_or_else(|| {
            IbError::out_of_range("chromosome list", position as u64, self.chromosomes.len() as u64)
        })
    }
}

/// Rebuilds blocks from consecutive ledger records
struct RecordLoader<'a> {
    parameters: &'a RunParameters,
    dimension: u64,
}

impl RecordLoader<'_> {
    fn next_block(&self, reader: &mut LedgerReader, info: &BlockInfo) -> Result<Block> {
        let record = reader.read(self.parameters.width)?;
        if record.is_terminal() {
            return Err(IbError::invalid_data(format!(
                "{}: ledger ended before block {} #{}",
                reader.path().display(),
                info.chromosome_name,
                info.number
            )));
        }
        let mut matrix = DistanceMatrix::new(
            info.chromosome_name.clone(),
            self.parameters.block_size,
            self.dimension,
            info.position,
            info.number,
            self.parameters.width,
        );
        matrix.load_array(&record.values)?;
        let block = Block::restore(info, matrix)?;
        block.check_serial(record.header.serial)?;
        Ok(block)
    }
}

impl DistanceQueries for Database {
    fn sample_names(&self) -> Result<Option<Vec<String>>> {
        Ok(Some(self.metadata.samples.to_strings()))
    }

    fn chromosome_names(&self) -> Result<Option<Vec<String>>> {
        Ok(Some(
            self.chromosomes.iter().map(|c| c.info.name.clone()).collect(),
        ))
    }

    fn summary_block(&self) -> Result<Option<BlockInfo>> {
        Ok(Some(self.summary.info()))
    }

    fn summary_table(&self) -> Result<Option<Vec<u64>>> {
        Ok(Some(self.summary.matrix().export_table()))
    }

    fn summary_column(&self, reference: u64) -> Result<Option<Vec<u64>>> {
        column_of(self.summary.matrix(), reference)
    }

    fn chromosome_summary(&self, chromosome: &str) -> Result<Option<BlockInfo>> {
        found(self.chromosome(chromosome).map(|c| c.summary.info()))
    }

    fn chromosome_table(&self, chromosome: &str) -> Result<Option<Vec<u64>>> {
        found(self.chromosome(chromosome).map(|c| c.summary.matrix().export_table()))
    }

    fn block(&self, chromosome: &str, number: u64) -> Result<Option<BlockInfo>> {
        found(
            self.chromosome(chromosome)
                .and_then(|c| c.get_block(number))
                .map(Block::info),
        )
    }

    fn block_table(&self, chromosome: &str, number: u64) -> Result<Option<Vec<u64>>> {
        found(
            self.chromosome(chromosome)
                .and_then(|c| c.get_block(number))
                .map(|b| b.matrix().export_table()),
        )
    }

    fn block_column(
        &self,
        chromosome: &str,
        number: u64,
        reference: u64,
    ) -> Result<Option<Vec<u64>>> {
        match found(self.chromosome(chromosome).and_then(|c| c.get_block(number)))? {
            Some(block) => column_of(block.matrix(), reference),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_naming() {
        let prefix = Path::new("out/run");
        assert_eq!(metadata_path(prefix), PathBuf::from("out/run_matrix.json"));
        assert_eq!(
            ledger_path(prefix, Compression::None),
            PathBuf::from("out/run_matrix.bin")
        );
        assert_eq!(
            ledger_path(prefix, Compression::Gzip),
            PathBuf::from("out/run_matrix.bin.gz")
        );
        assert_eq!(summary_store_path(prefix), PathBuf::from("out/run_summary.bin"));
        assert_eq!(
            chromosome_store_path(prefix, "chr2"),
            PathBuf::from("out/run_chromosomes_chr2.bin")
        );
    }

    #[test]
    fn test_found_maps_not_found_only() {
        assert_eq!(found::<u8>(Err(IbError::not_found("block", 1))).unwrap(), None);
        assert_eq!(found(Ok(3u8)).unwrap(), Some(3));
        assert!(found::<u8>(Err(IbError::out_of_range("x", 1, 0))).is_err());
    }

    #[test]
    fn test_column_of_out_of_range_is_none() {
        let m = DistanceMatrix::new("chr1", 10, 3, 0, 0, crate::data::CounterWidth::W16);
        assert_eq!(column_of(&m, 3).unwrap(), None);
        assert_eq!(column_of(&m, 2).unwrap(), Some(vec![0, 0, 0]));
    }
}
