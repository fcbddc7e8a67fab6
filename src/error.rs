//! # Centralized Error Handling
//!
//! Unified error types for the entire crate using `thiserror`.
//!
//! The taxonomy splits into fatal conditions (overflow, shape/schema
//! disagreement, ledger corruption, broken internal indices, heterogeneous
//! sample sets) and ordinary negative results (`NotFound`) or lifecycle
//! misuse (`ReadOnlyViolation`, `Closed`). Only the binary's driver decides
//! whether an error terminates the process.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for ibrowser operations
#[derive(Error, Debug)]
pub enum IbError {
    /// I/O errors (file missing, permission denied, read/write failures)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata (de)serialization errors
    #[error("metadata error: {0}")]
    Json(#[from] serde_json::Error),

    /// A counter would exceed its declared width
    #[error("counter overflow at cell {cell}: {current} + {value} does not fit in {width} bits")]
    Overflow {
        cell: u64,
        current: u64,
        value: u64,
        width: u32,
    },

    /// A distance cell would exceed its declared width
    #[error(
        "counter overflow in {chromosome} block {block} at pair ({i}, {j}){}: {current} + {value} does not fit in {width} bits",
        .position.map(|p| format!(" at position {}", p)).unwrap_or_default()
    )]
    PairOverflow {
        chromosome: String,
        block: String,
        i: u64,
        j: u64,
        position: Option<u64>,
        current: u64,
        value: u64,
        width: u32,
    },

    /// Two matrices disagree on dimension, width or size
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    /// A ledger write disagrees with the latched schema
    #[error("ledger schema mismatch for {path}: latched {expected}, got {actual}")]
    SchemaMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Recomputed checksum disagrees with the stored header
    #[error("checksum mismatch in {path} at serial {serial}: header {expected}, data {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        serial: u64,
        expected: u64,
        actual: u64,
    },

    /// A skipped or duplicated record
    #[error("record out of order in {context}: expected serial {expected}, got {actual}")]
    OutOfOrder {
        context: String,
        expected: u64,
        actual: u64,
    },

    /// A lookup by name or number found no entry
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// An internal index points past a container's bounds
    #[error("index out of range in {context}: {index} >= {len}")]
    IndexOutOfRange {
        context: String,
        index: u64,
        len: u64,
    },

    /// Coordinates that do not address a cell (diagonal or beyond the dimension)
    #[error("invalid pair ({i}, {j}) for dimension {dimension}")]
    InvalidPair { i: u64, j: u64, dimension: u64 },

    /// Counter width other than 16, 32 or 64
    #[error("invalid counter width: {0} (expected 16, 32 or 64)")]
    InvalidWidth(u64),

    /// Mutation attempted against a read-only store
    #[error("store {path} is read-only: cannot {operation}")]
    ReadOnlyViolation {
        path: PathBuf,
        operation: &'static str,
    },

    /// Operation attempted against a closed store, ledger or run
    #[error("{0} is closed")]
    Closed(String),

    /// An observation's sample count disagrees with the run
    #[error("sample count mismatch at {chromosome}:{position}: run has {expected}, observation has {actual}")]
    SampleCountMismatch {
        chromosome: String,
        position: u64,
        expected: usize,
        actual: usize,
    },

    /// Invalid data errors (truncated files, unsorted blocks, bad metadata)
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Configuration errors (invalid CLI arguments)
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Type alias for Results using IbError
pub type Result<T> = std::result::Result<T, IbError>;

impl IbError {
    /// Create an invalid data error
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    /// Create a shape mismatch error
    pub fn shape(
        context: impl Into<String>,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create an index-out-of-range error
    pub fn out_of_range(context: impl Into<String>, index: u64, len: u64) -> Self {
        Self::IndexOutOfRange {
            context: context.into(),
            index,
            len,
        }
    }

    /// Attach the SNP position to a pair overflow
    pub fn at_position(self, at: u64) -> Self {
        match self {
            Self::PairOverflow {
                chromosome,
                block,
                i,
                j,
                current,
                value,
                width,
                ..
            } => Self::PairOverflow {
                chromosome,
                block,
                i,
                j,
                position: Some(at),
                current,
                value,
                width,
            },
            other => other,
        }
    }

    /// Rename the chromosome and block a pair overflow is reported against
    pub fn in_matrix(self, chromosome_name: &str, block_label: &str) -> Self {
        match self {
            Self::PairOverflow {
                i,
                j,
                position,
                current,
                value,
                width,
                ..
            } => Self::PairOverflow {
                chromosome: chromosome_name.to_string(),
                block: block_label.to_string(),
                i,
                j,
                position,
                current,
                value,
                width,
            },
            other => other,
        }
    }

    /// Whether this error must abort the run rather than be handled locally.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::NotFound { .. } | Self::ReadOnlyViolation { .. } | Self::Closed(_)
        )
    }

    /// Whether this is an ordinary negative lookup result.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
