//! # Fixed-Width Counter Storage
//!
//! A homogeneous array of 16, 32 or 64-bit unsigned counters. Cells are
//! atomics so the same store serves both the single-writer path (`&mut self`)
//! and concurrent fetch-add accumulation (`&self`).
//!
//! All arithmetic happens in a `u64` accumulator before the fits-in-width
//! check. A counter never stores `2^width - 1` or above; that top value is
//! reserved, and nothing wraps silently.
//!
//! Cells live either on the heap (deltas, loaded snapshots) or directly in
//! a [`MappedRegister`] of a block's store.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{IbError, Result};
use crate::io::mmap_store::MappedRegister;

/// Bit width of every counter in a store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub enum CounterWidth {
    W16,
    W32,
    W64,
}

impl CounterWidth {
    /// Parse a bit count
    pub fn from_bits(bits: u64) -> Result<Self> {
        match bits {
            16 => Ok(Self::W16),
            32 => Ok(Self::W32),
            64 => Ok(Self::W64),
            other => Err(IbError::InvalidWidth(other)),
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            Self::W16 => 16,
            Self::W32 => 32,
            Self::W64 => 64,
        }
    }

    /// Bytes per counter
    pub fn byte_len(self) -> usize {
        self.bits() as usize / 8
    }

    /// Largest storable value, `2^width - 2`
    pub fn max_value(self) -> u64 {
        match self {
            Self::W16 => u16::MAX as u64 - 1,
            Self::W32 => u32::MAX as u64 - 1,
            Self::W64 => u64::MAX - 1,
        }
    }

    #[inline]
    pub fn fits(self, value: u64) -> bool {
        value <= self.max_value()
    }
}

impl TryFrom<u64> for CounterWidth {
    type Error = IbError;

    fn try_from(bits: u64) -> Result<Self> {
        Self::from_bits(bits)
    }
}

impl From<CounterWidth> for u64 {
    fn from(width: CounterWidth) -> u64 {
        width.bits() as u64
    }
}

impl std::fmt::Display for CounterWidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// Owned, width-typed snapshot of a counter array.
///
/// This is the unit exchanged with the ledger and the mmap store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CounterArray {
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
}

impl CounterArray {
    /// Zero-filled array of `len` counters
    pub fn zeros(width: CounterWidth, len: usize) -> Self {
        match width {
            CounterWidth::W16 => Self::U16(vec![0; len]),
            CounterWidth::W32 => Self::U32(vec![0; len]),
            CounterWidth::W64 => Self::U64(vec![0; len]),
        }
    }

    /// Narrow `values` to `width`, failing on the first value that does not fit
    pub fn from_u64s(width: CounterWidth, values: &[u64]) -> Result<Self> {
        if let Some((cell, &value)) = values.iter().enumerate().find(|&(_, &v)| !width.fits(v)) {
            return Err(IbError::Overflow {
                cell: cell as u64,
                current: 0,
                value,
                width: width.bits(),
            });
        }
        Ok(match width {
            CounterWidth::W16 => Self::U16(values.iter().map(|&v| v as u16).collect()),
            CounterWidth::W32 => Self::U32(values.iter().map(|&v| v as u32).collect()),
            CounterWidth::W64 => Self::U64(values.to_vec()),
        })
    }

    pub fn width(&self) -> CounterWidth {
        match self {
            Self::U16(_) => CounterWidth::W16,
            Self::U32(_) => CounterWidth::W32,
            Self::U64(_) => CounterWidth::W64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::U16(v) => v.len(),
            Self::U32(v) => v.len(),
            Self::U64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at `idx` widened to u64
    pub fn get(&self, idx: usize) -> Option<u64> {
        match self {
            Self::U16(v) => v.get(idx).map(|&x| x as u64),
            Self::U32(v) => v.get(idx).map(|&x| x as u64),
            Self::U64(v) => v.get(idx).copied(),
        }
    }

    /// All values widened to u64
    pub fn to_u64s(&self) -> Vec<u64> {
        match self {
            Self::U16(v) => v.iter().map(|&x| x as u64).collect(),
            Self::U32(v) => v.iter().map(|&x| x as u64).collect(),
            Self::U64(v) => v.clone(),
        }
    }

    /// Sum of all values widened to u64 (wrapping)
    pub fn checksum(&self) -> u64 {
        match self {
            Self::U16(v) => v.iter().fold(0u64, |acc, &x| acc.wrapping_add(x as u64)),
            Self::U32(v) => v.iter().fold(0u64, |acc, &x| acc.wrapping_add(x as u64)),
            Self::U64(v) => v.iter().fold(0u64, |acc, &x| acc.wrapping_add(x)),
        }
    }

    /// Append the little-endian encoding of every value to `out`
    pub fn encode_le(&self, out: &mut Vec<u8>) {
        out.reserve(self.len() * self.width().byte_len());
        match self {
            Self::U16(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Self::U32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Self::U64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
        }
    }

    /// Decode tightly packed little-endian counters
    pub fn decode_le(width: CounterWidth, bytes: &[u8]) -> Result<Self> {
        let step = width.byte_len();
        if bytes.len() % step != 0 {
            return Err(IbError::invalid_data(format!(
                "{} bytes is not a whole number of {} counters",
                bytes.len(),
                width
            )));
        }
        Ok(match width {
            CounterWidth::W16 => Self::U16(
                bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            CounterWidth::W32 => Self::U32(
                bytes
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            CounterWidth::W64 => Self::U64(
                bytes
                    .chunks_exact(8)
                    .map(|c| {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(c);
                        u64::from_le_bytes(raw)
                    })
                    .collect(),
            ),
        })
    }
}

/// Atomic cell of one counter width.
///
/// Cells hold their value little-endian, so a cell living in a mapped
/// register has the same bytes as the register file format.
trait Cell: Send + Sync {
    fn zero() -> Self;
    fn get(&self) -> u64;
    fn put(&self, value: u64);
    fn cas(&self, current: u64, new: u64) -> std::result::Result<u64, u64>;
}

macro_rules! impl_cell {
    ($atomic:ty, $int:ty) => {
        impl Cell for $atomic {
            #[inline]
            fn zero() -> Self {
                <$atomic>::new(0)
            }

            #[inline]
            fn get(&self) -> u64 {
                <$int>::from_le(<$atomic>::load(self, Ordering::Relaxed)) as u64
            }

            #[inline]
            fn put(&self, value: u64) {
                <$atomic>::store(self, (value as $int).to_le(), Ordering::Relaxed)
            }

            #[inline]
            fn cas(&self, current: u64, new: u64) -> std::result::Result<u64, u64> {
                <$atomic>::compare_exchange_weak(
                    self,
                    (current as $int).to_le(),
                    (new as $int).to_le(),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .map(|v| <$int>::from_le(v) as u64)
                .map_err(|v| <$int>::from_le(v) as u64)
            }
        }
    };
}

impl_cell!(AtomicU16, u16);
impl_cell!(AtomicU32, u32);
impl_cell!(AtomicU64, u64);

/// `current + value` if it fits `width`
#[inline]
fn checked_sum(width: CounterWidth, cell: u64, current: u64, value: u64) -> Result<u64> {
    current
        .checked_add(value)
        .filter(|&sum| width.fits(sum))
        .ok_or(IbError::Overflow {
            cell,
            current,
            value,
            width: width.bits(),
        })
}

fn fetch_add_checked<C: Cell>(cell: &C, width: CounterWidth, idx: u64, value: u64) -> Result<()> {
    let mut current = cell.get();
    loop {
        let next = checked_sum(width, idx, current, value)?;
        match cell.cas(current, next) {
            Ok(_) => return Ok(()),
            Err(actual) => current = actual,
        }
    }
}

/// Cells owned on the heap or living inside a mapped register
#[derive(Debug)]
pub struct Cells<C> {
    repr: Repr<C>,
}

#[derive(Debug)]
enum Repr<C> {
    Heap(Box<[C]>),
    Mapped { region: MappedRegister, len: usize },
}

impl<C: Cell> Cells<C> {
    fn zeroed(len: usize) -> Self {
        Self {
            repr: Repr::Heap((0..len).map(|_| C::zero()).collect()),
        }
    }

    fn mapped(region: MappedRegister) -> Result<Self> {
        let step = std::mem::size_of::<C>();
        let aligned = region.as_ptr() as usize % std::mem::align_of::<C>() == 0;
        if region.len() % step != 0 || !aligned {
            return Err(IbError::invalid_data(format!(
                "register {} is not a whole, aligned run of {}-byte counters",
                region.register(),
                step
            )));
        }
        let len = region.len() / step;
        Ok(Self {
            repr: Repr::Mapped { region, len },
        })
    }

    #[inline]
    fn as_slice(&self) -> &[C] {
        match &self.repr {
            Repr::Heap(cells) => cells,
            // SAFETY: size and alignment are checked on construction, the
            // region stays mapped for as long as `self` lives, and its bytes
            // are only ever touched through these atomics.
            Repr::Mapped { region, len } => unsafe {
                std::slice::from_raw_parts(region.as_ptr() as *const C, *len)
            },
        }
    }

    fn is_mapped(&self) -> bool {
        matches!(self.repr, Repr::Mapped { .. })
    }

    fn flush(&self) -> Result<()> {
        match &self.repr {
            Repr::Heap(_) => Ok(()),
            Repr::Mapped { region, .. } => region.flush(),
        }
    }
}

/// Width-tagged counter array
#[derive(Debug)]
pub enum CounterStore {
    W16(Cells<AtomicU16>),
    W32(Cells<AtomicU32>),
    W64(Cells<AtomicU64>),
}

/// Run `$body` with `$cells` bound to the store's slice, whatever its width
macro_rules! with_cells {
    ($store:expr, $cells:ident => $body:expr) => {
        match $store {
            CounterStore::W16($cells) => {
                let $cells = $cells.as_slice();
                $body
            }
            CounterStore::W32($cells) => {
                let $cells = $cells.as_slice();
                $body
            }
            CounterStore::W64($cells) => {
                let $cells = $cells.as_slice();
                $body
            }
        }
    };
}

impl CounterStore {
    /// Zero-filled heap store of `size` counters
    pub fn new(width: CounterWidth, size: u64) -> Self {
        let len = size as usize;
        match width {
            CounterWidth::W16 => Self::W16(Cells::zeroed(len)),
            CounterWidth::W32 => Self::W32(Cells::zeroed(len)),
            CounterWidth::W64 => Self::W64(Cells::zeroed(len)),
        }
    }

    /// Store whose counters live in a mapped register.
    ///
    /// Reads and writes go straight to the register; its current bytes are
    /// kept, so a fresh zeroed register gives a zeroed store.
    pub fn mapped(region: MappedRegister) -> Result<Self> {
        Ok(match region.width() {
            CounterWidth::W16 => Self::W16(Cells::mapped(region)?),
            CounterWidth::W32 => Self::W32(Cells::mapped(region)?),
            CounterWidth::W64 => Self::W64(Cells::mapped(region)?),
        })
    }

    /// Heap store holding a snapshot's values.
    ///
    /// Fails if any value is at or above the reserved top of the width.
    pub fn from_array(array: &CounterArray) -> Result<Self> {
        let mut store = Self::new(array.width(), array.len() as u64);
        store.load_array(array)?;
        Ok(store)
    }

    pub fn width(&self) -> CounterWidth {
        match self {
            Self::W16(_) => CounterWidth::W16,
            Self::W32(_) => CounterWidth::W32,
            Self::W64(_) => CounterWidth::W64,
        }
    }

    pub fn len(&self) -> u64 {
        with_cells!(self, cells => cells.len() as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the counters live in a mapped register
    pub fn is_mapped(&self) -> bool {
        match self {
            Self::W16(cells) => cells.is_mapped(),
            Self::W32(cells) => cells.is_mapped(),
            Self::W64(cells) => cells.is_mapped(),
        }
    }

    /// Write mapped counters back to their file; a no-op on the heap
    pub fn flush(&self) -> Result<()> {
        match self {
            Self::W16(cells) => cells.flush(),
            Self::W32(cells) => cells.flush(),
            Self::W64(cells) => cells.flush(),
        }
    }

    fn check_index(&self, p: u64) -> Result<usize> {
        let len = self.len();
        if p >= len {
            return Err(IbError::out_of_range("counter store", p, len));
        }
        Ok(p as usize)
    }

    /// Value at flat position `p`
    pub fn get(&self, p: u64) -> Result<u64> {
        let idx = self.check_index(p)?;
        Ok(with_cells!(self, cells => cells[idx].get()))
    }

    /// Overwrite position `p`
    pub fn set(&mut self, p: u64, value: u64) -> Result<()> {
        let idx = self.check_index(p)?;
        let width = self.width();
        if !width.fits(value) {
            return Err(IbError::Overflow {
                cell: p,
                current: 0,
                value,
                width: width.bits(),
            });
        }
        with_cells!(&*self, cells => cells[idx].put(value));
        Ok(())
    }

    /// Add `value` to position `p` (single writer)
    pub fn increment(&mut self, p: u64, value: u64) -> Result<()> {
        let idx = self.check_index(p)?;
        let width = self.width();
        with_cells!(&*self, cells => {
            let current = cells[idx].get();
            cells[idx].put(checked_sum(width, p, current, value)?);
        });
        Ok(())
    }

    /// Add `value` to position `p` with a compare-and-swap loop
    pub fn increment_atomic(&self, p: u64, value: u64) -> Result<()> {
        let idx = self.check_index(p)?;
        let width = self.width();
        with_cells!(self, cells => fetch_add_checked(&cells[idx], width, p, value))
    }

    /// Zero every counter
    pub fn clean(&mut self) {
        with_cells!(&*self, cells => cells.iter().for_each(|c| c.put(0)));
    }

    fn check_shape(&self, other: &CounterStore) -> Result<()> {
        if self.width() != other.width() || self.len() != other.len() {
            return Err(IbError::shape(
                "counter merge",
                format!("{} x {}", self.len(), self.width()),
                format!("{} x {}", other.len(), other.width()),
            ));
        }
        Ok(())
    }

    /// Elementwise add (single writer).
    ///
    /// The whole merge is validated before any cell is written, so an
    /// overflow leaves `self` untouched.
    pub fn merge(&mut self, other: &CounterStore) -> Result<()> {
        self.check_shape(other)?;
        let width = self.width();
        let sums = (0..self.len() as usize)
            .map(|i| {
                let current = with_cells!(&*self, cells => cells[i].get());
                let value = with_cells!(other, cells => cells[i].get());
                checked_sum(width, i as u64, current, value)
            })
            .collect::<Result<Vec<u64>>>()?;
        with_cells!(&*self, cells => {
            for (cell, sum) in cells.iter().zip(sums) {
                cell.put(sum);
            }
        });
        Ok(())
    }

    /// Elementwise add with per-cell fetch-add.
    ///
    /// Safe for concurrent callers. On overflow the cells merged before the
    /// failing one keep their new values.
    pub fn merge_atomic(&self, other: &CounterStore) -> Result<()> {
        self.check_shape(other)?;
        let width = self.width();
        for i in 0..self.len() as usize {
            let value = with_cells!(other, cells => cells[i].get());
            if value == 0 {
                continue;
            }
            with_cells!(self, cells => fetch_add_checked(&cells[i], width, i as u64, value))?;
        }
        Ok(())
    }

    /// Iterate values widened to u64
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len() as usize).map(move |i| with_cells!(self, cells => cells[i].get()))
    }

    /// Width-typed snapshot
    pub fn to_array(&self) -> CounterArray {
        match self {
            Self::W16(cells) => {
                CounterArray::U16(cells.as_slice().iter().map(|c| c.get() as u16).collect())
            }
            Self::W32(cells) => {
                CounterArray::U32(cells.as_slice().iter().map(|c| c.get() as u32).collect())
            }
            Self::W64(cells) => {
                CounterArray::U64(cells.as_slice().iter().map(|c| c.get()).collect())
            }
        }
    }

    /// Overwrite every counter from a snapshot of identical shape.
    ///
    /// Nothing is written unless every value fits the width.
    pub fn load_array(&mut self, array: &CounterArray) -> Result<()> {
        if array.width() != self.width() || array.len() as u64 != self.len() {
            return Err(IbError::shape(
                "counter load",
                format!("{} x {}", self.len(), self.width()),
                format!("{} x {}", array.len(), array.width()),
            ));
        }
        let width = self.width();
        let values = array.to_u64s();
        if let Some((cell, &value)) = values.iter().enumerate().find(|&(_, &v)| !width.fits(v)) {
            return Err(IbError::Overflow {
                cell: cell as u64,
                current: 0,
                value,
                width: width.bits(),
            });
        }
        with_cells!(&*self, cells => {
            for (i, cell) in cells.iter().enumerate() {
                cell.put(values[i]);
            }
        });
        Ok(())
    }
}

impl Clone for CounterStore {
    /// Heap copy, even when `self` is mapped
    fn clone(&self) -> Self {
        let copy = Self::new(self.width(), self.len());
        with_cells!(&copy, dst => {
            for (cell, value) in dst.iter().zip(self.iter()) {
                cell.put(value);
            }
        });
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_overflow_boundary_16() {
        let mut store = CounterStore::new(CounterWidth::W16, 3);
        store.set(0, 65534).unwrap();
        assert_eq!(store.get(0).unwrap(), 65534);
        assert!(matches!(store.set(1, 65535), Err(IbError::Overflow { .. })));
        assert!(matches!(store.set(1, 70000), Err(IbError::Overflow { .. })));
        assert!(matches!(store.increment(0, 1), Err(IbError::Overflow { .. })));
        assert_eq!(store.get(0).unwrap(), 65534);
    }

    #[test]
    fn test_overflow_boundary_32() {
        let mut store = CounterStore::new(CounterWidth::W32, 1);
        store.set(0, (1u64 << 32) - 2).unwrap();
        assert!(store.set(0, (1u64 << 32) - 1).is_err());
        assert!(store.increment(0, 1).is_err());
    }

    #[test]
    fn test_overflow_64_never_wraps() {
        let mut store = CounterStore::new(CounterWidth::W64, 1);
        store.set(0, u64::MAX - 1).unwrap();
        assert!(store.increment(0, 1).is_err());
        assert!(store.increment(0, u64::MAX).is_err());
        assert_eq!(store.get(0).unwrap(), u64::MAX - 1);
    }

    #[test]
    fn test_increment_and_clean() {
        let mut store = CounterStore::new(CounterWidth::W32, 4);
        store.increment(2, 5).unwrap();
        store.increment(2, 7).unwrap();
        assert_eq!(store.get(2).unwrap(), 12);
        store.clean();
        assert!(store.iter().all(|v| v == 0));
    }

    #[test]
    fn test_out_of_range() {
        let store = CounterStore::new(CounterWidth::W16, 2);
        assert!(matches!(store.get(2), Err(IbError::IndexOutOfRange { .. })));
    }

    #[test]
    fn test_merge_overflow_leaves_target_untouched() {
        let mut a = CounterStore::new(CounterWidth::W16, 2);
        let mut b = CounterStore::new(CounterWidth::W16, 2);
        a.set(0, 1).unwrap();
        a.set(1, 60000).unwrap();
        b.set(0, 1).unwrap();
        b.set(1, 6000).unwrap();
        assert!(a.merge(&b).is_err());
        assert_eq!(a.get(0).unwrap(), 1);
        assert_eq!(a.get(1).unwrap(), 60000);
    }

    #[test]
    fn test_merge_shape_mismatch() {
        let mut a = CounterStore::new(CounterWidth::W16, 2);
        let b = CounterStore::new(CounterWidth::W32, 2);
        let c = CounterStore::new(CounterWidth::W16, 3);
        assert!(matches!(a.merge(&b), Err(IbError::ShapeMismatch { .. })));
        assert!(matches!(a.merge(&c), Err(IbError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_concurrent_increment_is_exact() {
        let store = Arc::new(CounterStore::new(CounterWidth::W32, 8));
        std::thread::scope(|s| {
            for _ in 0..4 {
                let store = Arc::clone(&store);
                s.spawn(move || {
                    for _ in 0..1000 {
                        for p in 0..8 {
                            store.increment_atomic(p, 1).unwrap();
                        }
                    }
                });
            }
        });
        assert!(store.iter().all(|v| v == 4000));
    }

    #[test]
    fn test_array_round_trip_and_checksum() {
        let array = CounterArray::from_u64s(CounterWidth::W32, &[1, 2, 3]).unwrap();
        assert_eq!(array.checksum(), 6);
        let mut bytes = Vec::new();
        array.encode_le(&mut bytes);
        assert_eq!(bytes.len(), 12);
        let decoded = CounterArray::decode_le(CounterWidth::W32, &bytes).unwrap();
        assert_eq!(decoded, array);

        let store = CounterStore::from_array(&array).unwrap();
        assert_eq!(store.to_array(), array);
    }

    #[test]
    fn test_loading_reserved_value_fails() {
        let reserved = CounterArray::U16(vec![1, u16::MAX, 3]);
        assert!(matches!(
            CounterStore::from_array(&reserved),
            Err(IbError::Overflow { cell: 1, value: 65535, .. })
        ));

        let mut store = CounterStore::new(CounterWidth::W16, 3);
        store.set(0, 9).unwrap();
        assert!(store.load_array(&reserved).is_err());
        assert_eq!(store.get(0).unwrap(), 9);
    }

    #[test]
    fn test_mapped_cells_write_through() {
        use crate::io::mmap_store::{MMapStore, OpenMode};

        let dir = tempfile::tempdir().unwrap();
        let mut file =
            MMapStore::open(dir.path().join("cells.bin"), CounterWidth::W32, 4, OpenMode::ReadWrite)
                .unwrap();
        file.extend(2).unwrap();
        let store = CounterStore::mapped(file.map_register(1).unwrap()).unwrap();
        assert!(store.is_mapped());
        assert_eq!(store.len(), 6);

        store.increment_atomic(2, 40).unwrap();
        store.increment_atomic(2, 2).unwrap();
        assert_eq!(file.read_register(1).unwrap().to_u64s(), vec![0, 0, 42, 0, 0, 0]);
        assert_eq!(file.read_register(0).unwrap().to_u64s(), vec![0; 6]);

        let copy = store.clone();
        assert!(!copy.is_mapped());
        assert_eq!(copy.to_array(), store.to_array());
    }

    #[test]
    fn test_width_serde_as_bits() {
        let json = serde_json::to_string(&CounterWidth::W16).unwrap();
        assert_eq!(json, "16");
        let back: CounterWidth = serde_json::from_str("64").unwrap();
        assert_eq!(back, CounterWidth::W64);
        assert!(serde_json::from_str::<CounterWidth>("24").is_err());
    }
}
