//! # Configuration Logic
//!
//! ## Role
//! Run parameters for ingest and the command-line surface of the binary.
//!
//! - [`RunParameters`] travels with a run and is persisted in the database
//!   metadata, so a loaded database knows how it was built.
//! - [`Config`] is the `clap` front end: one subcommand per inspection tool.
//!
//! ## Example CLI
//! ```bash
//! ibrowser inspect out/run_matrix.bin.gz --compression gz
//! ibrowser summary out/run
//! ibrowser check-store out/run_chromosomes_chr1.bin
//! ```

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::data::storage::CounterWidth;
use crate::error::{IbError, Result};
use crate::io::codec::Compression;

pub const DEFAULT_BLOCK_SIZE: u64 = 100_000;

/// Parameters that shape an ingest run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunParameters {
    /// Genomic positions per block
    pub block_size: u64,
    pub width: CounterWidth,
    /// Synthesize empty blocks so every chromosome's block list is dense
    pub keep_empty_blocks: bool,
    /// Codec for the ledger data file
    pub compression: Compression,
    /// Ingest workers (0 = all cores)
    pub threads: usize,
    pub description: String,
}

impl Default for RunParameters {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            width: CounterWidth::W32,
            keep_empty_blocks: true,
            compression: Compression::None,
            threads: 0,
            description: String::new(),
        }
    }
}

impl RunParameters {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(IbError::config("block size must be greater than 0"));
        }
        Ok(())
    }
}

/// Pairwise genotype-distance matrix storage engine
#[derive(Parser, Debug, Clone)]
#[command(name = "ibrowser", version, about)]
pub struct Config {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Print span timings on close
    #[arg(long, global = true)]
    pub profile: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Verify every record of a matrix ledger and print per-record stats
    Inspect {
        /// Ledger data file (the index is `<ledger>.idx`)
        ledger: PathBuf,

        /// Data file codec: none or gz
        #[arg(long, default_value = "none")]
        compression: String,

        /// Expected counter width in bits (taken from the first header if omitted)
        #[arg(long)]
        width: Option<u64>,
    },

    /// Load a saved database and print its chromosomes and blocks
    Summary {
        /// Output prefix the database was saved under
        prefix: PathBuf,

        /// Also list every block
        #[arg(long)]
        blocks: bool,
    },

    /// Open a live register store read-only and print register stats
    CheckStore {
        /// Store file; its `.json` sidecar must sit next to it
        store: PathBuf,
    },
}

impl Config {
    /// Parse command line arguments and validate them
    pub fn parse_and_validate() -> Result<Self> {
        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    fn require_file(path: &Path, what: &str) -> Result<()> {
        if !path.exists() {
            return Err(IbError::config(format!(
                "{} not found: {}",
                what,
                path.display()
            )));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        match &self.command {
            Command::Inspect {
                ledger,
                compression,
                width,
            } => {
                Self::require_file(ledger, "ledger")?;
                Compression::from_name(compression)?;
                if let Some(bits) = width {
                    CounterWidth::from_bits(*bits)
                        .map_err(|_| IbError::config(format!("width must be 16, 32 or 64, got {}", bits)))?;
                }
            }
            Command::Summary { prefix, .. } => {
                let metadata = crate::pipelines::database::metadata_path(prefix);
                Self::require_file(&metadata, "database metadata")?;
            }
            Command::CheckStore { store } => {
                Self::require_file(store, "store")?;
            }
        }
        Ok(())
    }

    /// Log filter implied by `--verbose`
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
