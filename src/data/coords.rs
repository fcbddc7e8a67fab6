//! # Triangular Coordinate Map
//!
//! Packs the strictly-upper triangle of a symmetric `n x n` matrix (no
//! diagonal) into a flat array. For `i < j`:
//!
//! ```text
//! p = i * (2n - i - 1) / 2 + (j - i - 1)
//! ```
//!
//! The inverse solves the same quadratic:
//!
//! ```text
//! i = n - 2 - floor(sqrt(-8p + 4n(n-1) - 7) / 2 - 0.5)
//! j = p + i + 1 - n(n-1)/2 + (n-i)(n-i-1)/2
//! ```
//!
//! Both directions are evaluated in integer arithmetic once per dimension
//! and cached. The cache is keyed by dimension, so matrices of different
//! sample counts can coexist in one process.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Process-wide tables, one entry per dimension seen so far.
static TABLES: Lazy<RwLock<HashMap<u64, Arc<CoordinateMap>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Number of cells in the strictly-upper triangle of an `n x n` matrix.
#[inline]
pub const fn triangle_size(dimension: u64) -> u64 {
    if dimension < 2 {
        0
    } else {
        dimension * (dimension - 1) / 2
    }
}

/// Closed-form forward mapping. Requires `i < j < dimension`.
#[inline]
pub fn pair_to_index(dimension: u64, i: u64, j: u64) -> u64 {
    debug_assert!(i < j && j < dimension);
    i * (2 * dimension - i - 1) / 2 + (j - i - 1)
}

/// Closed-form inverse mapping. Requires `p < triangle_size(dimension)`.
pub fn index_to_pair(dimension: u64, p: u64) -> (u64, u64) {
    debug_assert!(p < triangle_size(dimension));
    let n = dimension as u128;
    let p128 = p as u128;

    // -8p + 4n(n-1) - 7 is >= 1 for every valid p
    let disc = 4 * n * (n - 1) - 7 - 8 * p128;
    let root = isqrt(disc);
    // floor(sqrt(d)/2 - 0.5) == floor((floor(sqrt(d)) - 1) / 2)
    let i = n - 2 - (root - 1) / 2;
    let size = n * (n - 1) / 2;
    let tail = (n - i) * (n - i - 1) / 2;
    let j = p128 + i + 1 + tail - size;

    (i as u64, j as u64)
}

/// Integer square root (floor).
fn isqrt(value: u128) -> u128 {
    if value < 2 {
        return value;
    }
    let mut x = (value as f64).sqrt() as u128;
    while x * x > value {
        x -= 1;
    }
    while (x + 1) * (x + 1) <= value {
        x += 1;
    }
    x
}

/// Precomputed bidirectional mapping for one dimension.
///
/// Immutable after construction; obtain shared instances through
/// [`CoordinateMap::shared`].
#[derive(Debug)]
pub struct CoordinateMap {
    dimension: u64,
    size: u64,
    /// Flat index of `(i, i + 1)` for every row `i`
    row_offsets: Vec<u64>,
    /// Pair for every flat index
    pairs: Vec<(u32, u32)>,
}

impl CoordinateMap {
    /// Build the tables for `dimension` without touching the cache.
    pub fn build(dimension: u64) -> Self {
        let size = triangle_size(dimension);
        let rows = dimension.saturating_sub(1) as usize;

        let mut row_offsets = Vec::with_capacity(rows);
        let mut pairs = Vec::with_capacity(size as usize);
        for i in 0..rows as u64 {
            row_offsets.push(pair_to_index(dimension, i, i + 1));
            for j in (i + 1)..dimension {
                pairs.push((i as u32, j as u32));
            }
        }
        debug_assert_eq!(pairs.len() as u64, size);

        Self {
            dimension,
            size,
            row_offsets,
            pairs,
        }
    }

    /// Get the cached map for `dimension`, building it on first use.
    ///
    /// Concurrent first callers race on the write lock; whoever wins inserts
    /// the tables and everyone else reuses them.
    pub fn shared(dimension: u64) -> Arc<CoordinateMap> {
        if let Some(map) = TABLES.read().get(&dimension) {
            return Arc::clone(map);
        }

        let mut tables = TABLES.write();
        let map = tables.entry(dimension).or_insert_with(|| {
            tracing::debug!(dimension, "building coordinate tables");
            Arc::new(CoordinateMap::build(dimension))
        });
        Arc::clone(map)
    }

    /// Sample count this map was built for
    pub fn dimension(&self) -> u64 {
        self.dimension
    }

    /// Number of addressable cells
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Flat index of the unordered pair `(i, j)`.
    ///
    /// Returns `None` for the diagonal or coordinates outside the dimension.
    #[inline]
    pub fn index_of(&self, i: u64, j: u64) -> Option<u64> {
        let (lo, hi) = if i < j { (i, j) } else { (j, i) };
        if lo == hi || hi >= self.dimension {
            return None;
        }
        Some(self.row_offsets[lo as usize] + (hi - lo - 1))
    }

    /// Ordered pair `(i, j)` with `i < j` stored at flat index `p`.
    #[inline]
    pub fn pair_of(&self, p: u64) -> Option<(u64, u64)> {
        self.pairs
            .get(p as usize)
            .map(|&(i, j)| (i as u64, j as u64))
    }
}
