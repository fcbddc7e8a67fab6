//! # Growable Memory-Mapped Register File
//!
//! One file per domain holding `register_count` fixed-size registers, one
//! per block, with no header:
//!
//! ```text
//! register k = bytes [k * register_length, (k + 1) * register_length)
//! register_length = size(dimension) * width_bytes
//! ```
//!
//! The mapping is treated as raw bytes. Counters are read and written
//! through bounds-checked little-endian views that borrow the store, so no
//! view can outlive a resize.
//!
//! Growing the file (`extend`) flushes and drops the current mapping,
//! reopens the file, truncates it to the new length and maps it again.
//! Callers must serialize `extend` against every other access; the borrow
//! checker enforces that within one owner.
//!
//! A block's live counters use a [`MappedRegister`], a separate writable
//! mapping of exactly one register. Growing the file leaves those mappings
//! in place, and the store refuses to shrink below the registers it has
//! handed out.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut, MmapOptions};
use tracing::{debug, warn};

use crate::data::coords::triangle_size;
use crate::data::storage::{CounterArray, CounterWidth};
use crate::error::{IbError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug)]
enum Mapping {
    /// Empty file or closed store
    None,
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Mapping {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::None => &[],
            Self::ReadOnly(m) => &m[..],
            Self::ReadWrite(m) => &m[..],
        }
    }
}

#[derive(Debug)]
pub struct MMapStore {
    path: PathBuf,
    mode: OpenMode,
    width: CounterWidth,
    dimension: u64,
    register_length: u64,
    registers: u64,
    /// Registers below this index are mapped by a live block
    lent: u64,
    file: Option<File>,
    mapping: Mapping,
    closed: bool,
}

/// Writable mapping of a single register, owned by the block it backs
#[derive(Debug)]
pub struct MappedRegister {
    register: u64,
    width: CounterWidth,
    /// Taken from `map` with write provenance; stable while `map` lives
    base: *mut u8,
    map: MmapMut,
}

// SAFETY: `base` points into `map`, which is itself Send + Sync. All access
// through `base` goes through atomic cells.
unsafe impl Send for MappedRegister {}
unsafe impl Sync for MappedRegister {}

impl MappedRegister {
    pub fn register(&self) -> u64 {
        self.register
    }

    pub fn width(&self) -> CounterWidth {
        self.width
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.base
    }

    /// Write this register's dirty pages back to the file
    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

/// Bytes occupied by one register
pub fn register_length(width: CounterWidth, dimension: u64) -> u64 {
    triangle_size(dimension) * width.byte_len() as u64
}

impl MMapStore {
    /// Open or create the store at `path`.
    ///
    /// Read-write opens create a missing file; read-only opens require it.
    pub fn open(
        path: impl AsRef<Path>,
        width: CounterWidth,
        dimension: u64,
        mode: OpenMode,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let register_length = register_length(width, dimension);
        let file = Self::open_file(&path, mode)?;
        let file_len = file.metadata()?.len();

        let registers = if register_length == 0 {
            0
        } else if file_len % register_length != 0 {
            return Err(IbError::invalid_data(format!(
                "{}: length {} is not a multiple of register length {}",
                path.display(),
                file_len,
                register_length
            )));
        } else {
            file_len / register_length
        };

        let mapping = Self::map(&file, file_len, mode)?;
        debug!(
            path = %path.display(),
            ?mode,
            registers,
            register_length,
            "opened register store"
        );

        Ok(Self {
            path,
            mode,
            width,
            dimension,
            register_length,
            registers,
            lent: 0,
            file: Some(file),
            mapping,
            closed: false,
        })
    }

    fn open_file(path: &Path, mode: OpenMode) -> Result<File> {
        let file = match mode {
            OpenMode::ReadOnly => OpenOptions::new().read(true).open(path)?,
            OpenMode::ReadWrite => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?,
        };
        Ok(file)
    }

    fn map(file: &File, file_len: u64, mode: OpenMode) -> Result<Mapping> {
        if file_len == 0 {
            return Ok(Mapping::None);
        }
        // SAFETY: the file is owned by this store for the lifetime of the
        // mapping and is only resized after the mapping has been dropped.
        let mapping = unsafe {
            match mode {
                OpenMode::ReadOnly => Mapping::ReadOnly(Mmap::map(file)?),
                OpenMode::ReadWrite => Mapping::ReadWrite(MmapMut::map_mut(file)?),
            }
        };
        Ok(mapping)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn width(&self) -> CounterWidth {
        self.width
    }

    pub fn dimension(&self) -> u64 {
        self.dimension
    }

    pub fn register_length(&self) -> u64 {
        self.register_length
    }

    /// Counters per register
    pub fn register_size(&self) -> u64 {
        triangle_size(self.dimension)
    }

    /// Number of registers
    pub fn len(&self) -> u64 {
        self.registers
    }

    pub fn is_empty(&self) -> bool {
        self.registers == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(IbError::Closed(format!("store {}", self.path.display())));
        }
        Ok(())
    }

    fn ensure_writable(&self, operation: &'static str) -> Result<()> {
        self.ensure_open()?;
        if self.mode == OpenMode::ReadOnly {
            return Err(IbError::ReadOnlyViolation {
                path: self.path.clone(),
                operation,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Grow (or shrink, with negative `by`) the store by whole registers.
    ///
    /// Existing register bytes are preserved; new registers are zero.
    pub fn extend(&mut self, by: i64) -> Result<()> {
        self.ensure_writable("extend")?;

        let target = self.registers as i64 + by;
        if target < 0 {
            return Err(IbError::invalid_data(format!(
                "{}: cannot shrink {} registers by {}",
                self.path.display(),
                self.registers,
                -by
            )));
        }
        let target = target as u64;
        if target < self.lent {
            return Err(IbError::invalid_data(format!(
                "{}: cannot shrink to {} registers while {} are mapped by blocks",
                self.path.display(),
                target,
                self.lent
            )));
        }

        if self.register_length == 0 {
            self.registers = target;
            return Ok(());
        }

        self.flush()?;
        self.mapping = Mapping::None;
        self.file = None;

        let file = Self::open_file(&self.path, OpenMode::ReadWrite)?;
        let new_len = target * self.register_length;
        file.set_len(new_len)?;
        self.mapping = Self::map(&file, new_len, OpenMode::ReadWrite)?;
        self.file = Some(file);

        debug!(
            path = %self.path.display(),
            from = self.registers,
            to = target,
            bytes = new_len,
            "resized register store"
        );
        self.registers = target;
        Ok(())
    }

    /// Write dirty pages back to the file
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        if let Mapping::ReadWrite(m) = &self.mapping {
            m.flush()?;
        }
        Ok(())
    }

    /// Flush, unmap and release the file. The store is unusable afterwards.
    pub fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.flush()?;
        self.mapping = Mapping::None;
        if let Some(file) = self.file.take() {
            if self.mode == OpenMode::ReadWrite {
                file.sync_all()?;
            }
        }
        self.closed = true;
        debug!(path = %self.path.display(), registers = self.registers, "closed register store");
        Ok(())
    }

    // ========================================================================
    // Register access
    // ========================================================================

    fn register_range(&self, k: u64) -> Result<std::ops::Range<usize>> {
        self.ensure_open()?;
        if k >= self.registers {
            return Err(IbError::out_of_range(
                format!("register store {}", self.path.display()),
                k,
                self.registers,
            ));
        }
        let start = (k * self.register_length) as usize;
        Ok(start..start + self.register_length as usize)
    }

    /// Read-only view of register `k`
    pub fn register(&self, k: u64) -> Result<RegisterView<'_>> {
        let range = self.register_range(k)?;
        Ok(RegisterView {
            bytes: &self.mapping.bytes()[range],
            width: self.width,
        })
    }

    /// Mutable view of register `k`
    pub fn register_mut(&mut self, k: u64) -> Result<RegisterViewMut<'_>> {
        self.ensure_writable("write register")?;
        let range = self.register_range(k)?;
        let width = self.width;
        let bytes: &mut [u8] = match &mut self.mapping {
            Mapping::ReadWrite(m) => &mut m[range],
            // Zero-length registers never need a mapping
            _ => &mut [],
        };
        Ok(RegisterViewMut { bytes, width })
    }

    /// Map register `k` on its own so a block can accumulate in place.
    ///
    /// The mapping stays valid across later `extend` calls.
    pub fn map_register(&mut self, k: u64) -> Result<MappedRegister> {
        self.ensure_writable("map register")?;
        let range = self.register_range(k)?;
        if range.is_empty() {
            return Err(IbError::invalid_data(format!(
                "{}: zero-length registers cannot be mapped",
                self.path.display()
            )));
        }
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| IbError::Closed(format!("store {}", self.path.display())))?;
        // SAFETY: the range lies inside the file, and the store never
        // truncates below a register it has lent out.
        let mut map = unsafe {
            MmapOptions::new()
                .offset(range.start as u64)
                .len(range.len())
                .map_mut(file)?
        };
        self.lent = self.lent.max(k + 1);
        Ok(MappedRegister {
            register: k,
            width: self.width,
            base: map.as_mut_ptr(),
            map,
        })
    }

    /// Copy register `k` out as a width-typed array
    pub fn read_register(&self, k: u64) -> Result<CounterArray> {
        self.register(k)?.to_array()
    }

    /// Overwrite register `k` from an array of the store's width and size
    pub fn write_register(&mut self, k: u64, values: &CounterArray) -> Result<()> {
        if values.width() != self.width || values.len() as u64 != self.register_size() {
            return Err(IbError::shape(
                format!("register {} of {}", k, self.path.display()),
                format!("{} x {}", self.register_size(), self.width),
                format!("{} x {}", values.len(), values.width()),
            ));
        }
        let mut encoded = Vec::with_capacity(self.register_length as usize);
        values.encode_le(&mut encoded);
        let mut view = self.register_mut(k)?;
        view.bytes.copy_from_slice(&encoded);
        Ok(())
    }
}

impl Drop for MMapStore {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Mapping::ReadWrite(m) = &self.mapping {
            if let Err(e) = m.flush() {
                warn!(path = %self.path.display(), error = %e, "failed to flush register store on drop");
            }
        }
    }
}

// ============================================================================
// Views
// ============================================================================

#[inline]
fn decode(width: CounterWidth, bytes: &[u8], p: usize) -> u64 {
    let step = width.byte_len();
    let raw = &bytes[p * step..(p + 1) * step];
    match width {
        CounterWidth::W16 => u16::from_le_bytes([raw[0], raw[1]]) as u64,
        CounterWidth::W32 => u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64,
        CounterWidth::W64 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(raw);
            u64::from_le_bytes(buf)
        }
    }
}

/// Borrowed read-only register
#[derive(Clone, Copy, Debug)]
pub struct RegisterView<'a> {
    bytes: &'a [u8],
    width: CounterWidth,
}

impl<'a> RegisterView<'a> {
    pub fn len(&self) -> u64 {
        (self.bytes.len() / self.width.byte_len()) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn get(&self, p: u64) -> Result<u64> {
        if p >= self.len() {
            return Err(IbError::out_of_range("register view", p, self.len()));
        }
        Ok(decode(self.width, self.bytes, p as usize))
    }

    pub fn to_array(&self) -> Result<CounterArray> {
        CounterArray::decode_le(self.width, self.bytes)
    }
}

/// Borrowed mutable register
#[derive(Debug)]
pub struct RegisterViewMut<'a> {
    bytes: &'a mut [u8],
    width: CounterWidth,
}

impl<'a> RegisterViewMut<'a> {
    pub fn len(&self) -> u64 {
        (self.bytes.len() / self.width.byte_len()) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn get(&self, p: u64) -> Result<u64> {
        if p >= self.len() {
            return Err(IbError::out_of_range("register view", p, self.len()));
        }
        Ok(decode(self.width, self.bytes, p as usize))
    }

    pub fn set(&mut self, p: u64, value: u64) -> Result<()> {
        if p >= self.len() {
            return Err(IbError::out_of_range("register view", p, self.len()));
        }
        if !self.width.fits(value) {
            return Err(IbError::Overflow {
                cell: p,
                current: 0,
                value,
                width: self.width.bits(),
            });
        }
        let step = self.width.byte_len();
        let raw = &mut self.bytes[p as usize * step..(p as usize + 1) * step];
        match self.width {
            CounterWidth::W16 => raw.copy_from_slice(&(value as u16).to_le_bytes()),
            CounterWidth::W32 => raw.copy_from_slice(&(value as u32).to_le_bytes()),
            CounterWidth::W64 => raw.copy_from_slice(&value.to_le_bytes()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_extend_preserves_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.bin");
        let mut store = MMapStore::open(&path, CounterWidth::W16, 4, OpenMode::ReadWrite).unwrap();
        assert_eq!(store.register_length(), 12);
        assert_eq!(store.len(), 0);

        store.extend(5).unwrap();
        assert_eq!(store.len(), 5);
        store.register_mut(4).unwrap().set(5, 777).unwrap();
        store.register_mut(0).unwrap().set(0, 1).unwrap();

        store.extend(3).unwrap();
        assert_eq!(store.len(), 8);
        assert_eq!(store.register(4).unwrap().get(5).unwrap(), 777);
        assert_eq!(store.register(0).unwrap().get(0).unwrap(), 1);
        assert_eq!(store.register(7).unwrap().get(5).unwrap(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8 * 12);
    }

    #[test]
    fn test_read_only_rejects_mutation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.bin");
        {
            let mut store =
                MMapStore::open(&path, CounterWidth::W32, 3, OpenMode::ReadWrite).unwrap();
            store.extend(2).unwrap();
            let values = CounterArray::from_u64s(CounterWidth::W32, &[1, 2, 3]).unwrap();
            store.write_register(1, &values).unwrap();
            store.close().unwrap();
        }

        let mut store = MMapStore::open(&path, CounterWidth::W32, 3, OpenMode::ReadOnly).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.read_register(1).unwrap().to_u64s(), vec![1, 2, 3]);
        assert!(matches!(store.extend(1), Err(IbError::ReadOnlyViolation { .. })));
        assert!(matches!(store.register_mut(0), Err(IbError::ReadOnlyViolation { .. })));
    }

    #[test]
    fn test_closed_store_is_terminal() {
        let dir = tempdir().unwrap();
        let mut store = MMapStore::open(
            dir.path().join("store.bin"),
            CounterWidth::W64,
            2,
            OpenMode::ReadWrite,
        )
        .unwrap();
        store.extend(1).unwrap();
        store.close().unwrap();
        assert!(store.is_closed());
        assert!(matches!(store.extend(1), Err(IbError::Closed(_))));
        assert!(matches!(store.register(0), Err(IbError::Closed(_))));
        assert!(matches!(store.close(), Err(IbError::Closed(_))));
    }

    #[test]
    fn test_zero_length_registers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.bin");
        let mut store = MMapStore::open(&path, CounterWidth::W16, 1, OpenMode::ReadWrite).unwrap();
        assert_eq!(store.register_length(), 0);
        store.extend(4).unwrap();
        assert_eq!(store.len(), 4);
        assert!(store.read_register(3).unwrap().is_empty());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_negative_extend() {
        let dir = tempdir().unwrap();
        let mut store = MMapStore::open(
            dir.path().join("store.bin"),
            CounterWidth::W16,
            3,
            OpenMode::ReadWrite,
        )
        .unwrap();
        store.extend(3).unwrap();
        store.extend(-1).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.extend(-3).is_err());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_mapped_register_survives_growth() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.bin");
        let mut store = MMapStore::open(&path, CounterWidth::W32, 3, OpenMode::ReadWrite).unwrap();
        store.extend(2).unwrap();
        let region = store.map_register(1).unwrap();
        assert_eq!(region.len(), 12);
        assert_eq!(region.register(), 1);

        store.extend(4).unwrap();
        assert_eq!(region.len(), 12);
        assert!(store.extend(-5).is_err());
        store.extend(-4).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.map_register(2).is_err());
    }

    #[test]
    fn test_register_bounds_and_width() {
        let dir = tempdir().unwrap();
        let mut store = MMapStore::open(
            dir.path().join("store.bin"),
            CounterWidth::W16,
            3,
            OpenMode::ReadWrite,
        )
        .unwrap();
        store.extend(1).unwrap();
        assert!(store.register(1).is_err());
        let mut view = store.register_mut(0).unwrap();
        assert!(view.set(3, 1).is_err());
        assert!(matches!(view.set(0, 65535), Err(IbError::Overflow { .. })));
        view.set(0, 65534).unwrap();
        let wrong = CounterArray::zeros(CounterWidth::W32, 3);
        assert!(store.write_register(0, &wrong).is_err());
    }
}
