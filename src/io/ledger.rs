//! # Binary Matrix Ledger
//!
//! Append-only sequence of counter arrays stored as a pair of files:
//!
//! - `<path>.idx`: one fixed-size header per record, never compressed
//! - `<path>`: the counters of every record, tightly packed, optionally
//!   wrapped in a [`Compression`] codec
//!
//! Header layout (little-endian, 33 bytes):
//!
//! ```text
//! [has_data u8] [serial u64] [width u64] [data_len u64] [checksum u64]
//! ```
//!
//! `checksum` is the wrapping sum of all counters widened to u64. The
//! stream ends with a `has_data = 0` header followed by a zero-filled record
//! of the same shape as the data records. A ledger missing that terminal
//! record is truncated and must not be trusted.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::data::storage::{CounterArray, CounterWidth};
use crate::error::{IbError, Result};
use crate::io::codec::{Compression, StreamWriter};

/// Encoded size of a [`RegisterHeader`]
pub const HEADER_LEN: usize = 1 + 4 * 8;

/// Path of the index file paired with a data file
pub fn index_path(data_path: &Path) -> PathBuf {
    let mut name = data_path.as_os_str().to_os_string();
    name.push(".idx");
    PathBuf::from(name)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterHeader {
    pub has_data: bool,
    pub serial: u64,
    /// Counter width in bits
    pub width: u64,
    /// Number of counters in the record
    pub data_len: u64,
    pub checksum: u64,
}

impl RegisterHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.has_data as u8;
        buf[1..9].copy_from_slice(&self.serial.to_le_bytes());
        buf[9..17].copy_from_slice(&self.width.to_le_bytes());
        buf[17..25].copy_from_slice(&self.data_len.to_le_bytes());
        buf[25..33].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        let word = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        let has_data = match buf[0] {
            0 => false,
            1 => true,
            other => {
                return Err(IbError::invalid_data(format!(
                    "ledger header flag must be 0 or 1, found {}",
                    other
                )))
            }
        };
        Ok(Self {
            has_data,
            serial: word(1),
            width: word(9),
            data_len: word(17),
            checksum: word(25),
        })
    }
}

/// One record read back from a ledger
#[derive(Clone, Debug)]
pub struct LedgerRecord {
    pub header: RegisterHeader,
    pub values: CounterArray,
}

impl LedgerRecord {
    /// Whether this is the terminal sentinel
    pub fn is_terminal(&self) -> bool {
        !self.header.has_data
    }
}

// ============================================================================
// Writer
// ============================================================================

pub struct LedgerWriter {
    data_path: PathBuf,
    index: Option<BufWriter<File>>,
    data: Option<Box<dyn StreamWriter>>,
    next_serial: u64,
    /// Width and length latched by the first write
    schema: Option<(CounterWidth, u64)>,
}

impl LedgerWriter {
    /// Create (or truncate) `path` and its index file
    pub fn open_for_write(path: impl AsRef<Path>, compression: Compression) -> Result<Self> {
        let data_path = path.as_ref().to_path_buf();
        let index = BufWriter::new(File::create(index_path(&data_path))?);
        let data = compression.writer(File::create(&data_path)?);
        info!(path = %data_path.display(), %compression, "writing matrix ledger");
        Ok(Self {
            data_path,
            index: Some(index),
            data: Some(data),
            next_serial: 0,
            schema: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.data_path
    }

    /// Number of data records written so far
    pub fn len(&self) -> u64 {
        self.next_serial
    }

    pub fn is_empty(&self) -> bool {
        self.next_serial == 0
    }

    fn closed(&self) -> IbError {
        IbError::Closed(format!("ledger {}", self.data_path.display()))
    }

    /// Append one record and return its serial
    pub fn write(&mut self, values: &CounterArray) -> Result<u64> {
        let shape = (values.width(), values.len() as u64);
        match self.schema {
            None => self.schema = Some(shape),
            Some(latched) if latched != shape => {
                return Err(IbError::SchemaMismatch {
                    path: self.data_path.clone(),
                    expected: format!("{} x {}", latched.1, latched.0),
                    actual: format!("{} x {}", shape.1, shape.0),
                });
            }
            Some(_) => {}
        }

        let header = RegisterHeader {
            has_data: true,
            serial: self.next_serial,
            width: shape.0.bits() as u64,
            data_len: shape.1,
            checksum: values.checksum(),
        };
        self.append(&header, values)?;
        self.next_serial += 1;
        Ok(header.serial)
    }

    fn append(&mut self, header: &RegisterHeader, values: &CounterArray) -> Result<()> {
        let mut encoded = Vec::new();
        values.encode_le(&mut encoded);
        if self.index.is_none() || self.data.is_none() {
            return Err(self.closed());
        }
        if let (Some(index), Some(data)) = (self.index.as_mut(), self.data.as_mut()) {
            index.write_all(&header.encode())?;
            data.write_all(&encoded)?;
        }
        Ok(())
    }

    /// Append the terminal record and flush both files
    pub fn close(&mut self) -> Result<()> {
        if self.index.is_none() {
            return Err(self.closed());
        }
        let (width, data_len) = match self.schema {
            Some((width, len)) => (Some(width), len),
            None => (None, 0),
        };
        let terminal = RegisterHeader {
            has_data: false,
            serial: self.next_serial,
            width: width.map_or(0, |w| w.bits() as u64),
            data_len,
            checksum: 0,
        };
        let zeros = CounterArray::zeros(width.unwrap_or(CounterWidth::W64), data_len as usize);
        self.append(&terminal, &zeros)?;

        if let Some(mut index) = self.index.take() {
            index.flush()?;
            index.get_ref().sync_all()?;
        }
        if let Some(data) = self.data.take() {
            data.finish()?;
        }
        debug!(path = %self.data_path.display(), records = self.next_serial, "closed matrix ledger");
        Ok(())
    }
}

impl Drop for LedgerWriter {
    fn drop(&mut self) {
        if self.index.is_some() {
            warn!(
                path = %self.data_path.display(),
                "matrix ledger dropped without close; output has no terminal record"
            );
        }
    }
}

// ============================================================================
// Reader
// ============================================================================

pub struct LedgerReader {
    data_path: PathBuf,
    index: BufReader<File>,
    data: Box<dyn Read + Send>,
    expected_serial: u64,
    schema: Option<(CounterWidth, u64)>,
    finished: bool,
}

impl LedgerReader {
    pub fn open_for_read(path: impl AsRef<Path>, compression: Compression) -> Result<Self> {
        let data_path = path.as_ref().to_path_buf();
        let index = BufReader::new(File::open(index_path(&data_path))?);
        let data = compression.reader(File::open(&data_path)?);
        debug!(path = %data_path.display(), %compression, "reading matrix ledger");
        Ok(Self {
            data_path,
            index,
            data,
            expected_serial: 0,
            schema: None,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.data_path
    }

    /// Whether the terminal record has been consumed
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Require every record to hold `len` counters of `width`.
    ///
    /// Records of any other shape are rejected from their header, before
    /// their payload is read.
    pub fn expect_shape(&mut self, width: CounterWidth, len: u64) -> Result<()> {
        match self.schema {
            Some(latched) if latched != (width, len) => Err(self.schema_error(
                format!("{} x {}", len, width),
                format!("{} x {}", latched.1, latched.0),
            )),
            _ => {
                self.schema = Some((width, len));
                Ok(())
            }
        }
    }

    /// Read the next record, requiring counters of `width`
    pub fn read(&mut self, width: CounterWidth) -> Result<LedgerRecord> {
        self.read_record(Some(width))
    }

    /// Read the next record at whatever width its header declares
    pub fn read_next(&mut self) -> Result<LedgerRecord> {
        self.read_record(None)
    }

    fn read_record(&mut self, expected_width: Option<CounterWidth>) -> Result<LedgerRecord> {
        if self.finished {
            return Err(IbError::Closed(format!("ledger {}", self.data_path.display())));
        }

        let mut raw = [0u8; HEADER_LEN];
        self.index.read_exact(&mut raw).map_err(|e| self.truncated(e))?;
        let header = RegisterHeader::decode(&raw)?;

        if header.serial != self.expected_serial {
            return Err(IbError::OutOfOrder {
                context: format!("ledger {}", self.data_path.display()),
                expected: self.expected_serial,
                actual: header.serial,
            });
        }

        // The terminal record of an empty ledger carries no width
        if !header.has_data && header.width == 0 && header.data_len == 0 {
            self.finished = true;
            let width = expected_width.unwrap_or(CounterWidth::W64);
            return Ok(LedgerRecord {
                header,
                values: CounterArray::zeros(width, 0),
            });
        }

        let width = CounterWidth::from_bits(header.width)?;
        let shape = (width, header.data_len);
        if let Some(expected) = expected_width {
            if expected != width {
                return Err(self.schema_error(format!("{}", expected), format!("{}", width)));
            }
        }
        match self.schema {
            None => self.schema = Some(shape),
            Some(latched) if latched != shape => {
                return Err(self.schema_error(
                    format!("{} x {}", latched.1, latched.0),
                    format!("{} x {}", shape.1, shape.0),
                ));
            }
            Some(_) => {}
        }

        let byte_len = header
            .data_len
            .checked_mul(width.byte_len() as u64)
            .ok_or_else(|| {
                IbError::invalid_data(format!(
                    "ledger {} serial {}: {} counters of {} overflow the address space",
                    self.data_path.display(),
                    header.serial,
                    header.data_len,
                    width
                ))
            })?;
        // Grow with the data actually present instead of trusting the header
        let mut bytes = Vec::new();
        let read = Read::take(&mut self.data, byte_len).read_to_end(&mut bytes);
        let read = read.map_err(|e| self.truncated(e))?;
        if (read as u64) < byte_len {
            return Err(self.truncated(std::io::Error::from(ErrorKind::UnexpectedEof)));
        }
        let values = CounterArray::decode_le(width, &bytes)?;

        let checksum = values.checksum();
        if checksum != header.checksum {
            return Err(IbError::ChecksumMismatch {
                path: self.data_path.clone(),
                serial: header.serial,
                expected: header.checksum,
                actual: checksum,
            });
        }
        if let Some((cell, value)) = values
            .to_u64s()
            .into_iter()
            .enumerate()
            .find(|&(_, v)| !width.fits(v))
        {
            return Err(IbError::invalid_data(format!(
                "ledger {} serial {}: counter {} holds {}, above the {} maximum",
                self.data_path.display(),
                header.serial,
                cell,
                value,
                width
            )));
        }

        self.expected_serial += 1;
        if !header.has_data {
            self.finished = true;
        }
        Ok(LedgerRecord { header, values })
    }

    fn truncated(&self, e: std::io::Error) -> IbError {
        if e.kind() == ErrorKind::UnexpectedEof {
            IbError::invalid_data(format!(
                "ledger {} ends before its terminal record (serial {})",
                self.data_path.display(),
                self.expected_serial
            ))
        } else {
            IbError::Io(e)
        }
    }

    fn schema_error(&self, expected: String, actual: String) -> IbError {
        IbError::SchemaMismatch {
            path: self.data_path.clone(),
            expected,
            actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn array(values: &[u64]) -> CounterArray {
        CounterArray::from_u64s(CounterWidth::W32, values).unwrap()
    }

    #[test]
    fn test_header_layout() {
        let header = RegisterHeader {
            has_data: true,
            serial: 2,
            width: 32,
            data_len: 3,
            checksum: 6,
        };
        let raw = header.encode();
        assert_eq!(raw.len(), 33);
        assert_eq!(raw[0], 1);
        assert_eq!(&raw[9..17], &32u64.to_le_bytes());
        assert_eq!(RegisterHeader::decode(&raw).unwrap(), header);
    }

    #[test]
    fn test_single_record_scenario() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("matrix.bin");
        let mut writer = LedgerWriter::open_for_write(&path, Compression::None).unwrap();
        assert_eq!(writer.write(&array(&[1, 2, 3])).unwrap(), 0);
        writer.close().unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * 12);
        assert_eq!(std::fs::metadata(index_path(&path)).unwrap().len(), 2 * 33);

        let mut reader = LedgerReader::open_for_read(&path, Compression::None).unwrap();
        let record = reader.read(CounterWidth::W32).unwrap();
        assert_eq!(record.header.data_len, 3);
        assert_eq!(record.header.checksum, 6);
        assert_eq!(record.values.to_u64s(), vec![1, 2, 3]);

        let terminal = reader.read(CounterWidth::W32).unwrap();
        assert!(terminal.is_terminal());
        assert_eq!(terminal.header.serial, 1);
        assert_eq!(terminal.values.to_u64s(), vec![0, 0, 0]);
        assert!(matches!(reader.read(CounterWidth::W32), Err(IbError::Closed(_))));
    }

    #[test]
    fn test_gzip_ledger_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("matrix.bin.gz");
        let records: Vec<CounterArray> = (0..5u64).map(|k| array(&[k, k * 2, k * 3, 7])).collect();

        let mut writer = LedgerWriter::open_for_write(&path, Compression::Gzip).unwrap();
        for (k, r) in records.iter().enumerate() {
            assert_eq!(writer.write(r).unwrap(), k as u64);
        }
        writer.close().unwrap();

        let mut reader = LedgerReader::open_for_read(&path, Compression::Gzip).unwrap();
        for r in &records {
            assert_eq!(&reader.read_next().unwrap().values, r);
        }
        assert!(reader.read_next().unwrap().is_terminal());
        assert!(reader.is_finished());
    }

    #[test]
    fn test_writer_latches_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("matrix.bin");
        let mut writer = LedgerWriter::open_for_write(&path, Compression::None).unwrap();
        writer.write(&array(&[1, 2])).unwrap();
        assert!(matches!(
            writer.write(&array(&[1, 2, 3])),
            Err(IbError::SchemaMismatch { .. })
        ));
        let wide = CounterArray::from_u64s(CounterWidth::W64, &[1, 2]).unwrap();
        assert!(matches!(writer.write(&wide), Err(IbError::SchemaMismatch { .. })));
        writer.close().unwrap();
        assert!(matches!(writer.close(), Err(IbError::Closed(_))));
    }

    #[test]
    fn test_reader_rejects_wrong_width() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("matrix.bin");
        let mut writer = LedgerWriter::open_for_write(&path, Compression::None).unwrap();
        writer.write(&array(&[1])).unwrap();
        writer.close().unwrap();

        let mut reader = LedgerReader::open_for_read(&path, Compression::None).unwrap();
        assert!(matches!(
            reader.read(CounterWidth::W16),
            Err(IbError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_corrupted_data_fails_checksum() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("matrix.bin");
        let mut writer = LedgerWriter::open_for_write(&path, Compression::None).unwrap();
        writer.write(&array(&[10, 20])).unwrap();
        writer.close().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0x01;
        std::fs::write(&path, bytes).unwrap();

        let mut reader = LedgerReader::open_for_read(&path, Compression::None).unwrap();
        assert!(matches!(
            reader.read(CounterWidth::W32),
            Err(IbError::ChecksumMismatch { serial: 0, .. })
        ));
    }

    fn rewrite_first_header(path: &Path, edit: impl FnOnce(&mut RegisterHeader)) {
        let mut index = std::fs::read(index_path(path)).unwrap();
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&index[..HEADER_LEN]);
        let mut header = RegisterHeader::decode(&raw).unwrap();
        edit(&mut header);
        index[..HEADER_LEN].copy_from_slice(&header.encode());
        std::fs::write(index_path(path), index).unwrap();
    }

    #[test]
    fn test_absurd_data_len_is_invalid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("matrix.bin");
        let mut writer = LedgerWriter::open_for_write(&path, Compression::None).unwrap();
        writer.write(&array(&[1, 2, 3])).unwrap();
        writer.close().unwrap();

        for data_len in [1u64 << 62, 1 << 40] {
            rewrite_first_header(&path, |h| h.data_len = data_len);
            let mut reader = LedgerReader::open_for_read(&path, Compression::None).unwrap();
            assert!(matches!(
                reader.read(CounterWidth::W32),
                Err(IbError::InvalidData { .. })
            ));
        }
    }

    #[test]
    fn test_expected_shape_checked_before_payload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("matrix.bin");
        let mut writer = LedgerWriter::open_for_write(&path, Compression::None).unwrap();
        writer.write(&array(&[1, 2, 3])).unwrap();
        writer.close().unwrap();

        let mut reader = LedgerReader::open_for_read(&path, Compression::None).unwrap();
        reader.expect_shape(CounterWidth::W32, 6).unwrap();
        assert!(matches!(
            reader.read(CounterWidth::W32),
            Err(IbError::SchemaMismatch { .. })
        ));

        let mut reader = LedgerReader::open_for_read(&path, Compression::None).unwrap();
        reader.expect_shape(CounterWidth::W32, 3).unwrap();
        assert_eq!(reader.read(CounterWidth::W32).unwrap().values.to_u64s(), vec![1, 2, 3]);
        assert!(reader.expect_shape(CounterWidth::W32, 4).is_err());
    }

    #[test]
    fn test_reserved_counter_value_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("matrix.bin");
        let mut writer = LedgerWriter::open_for_write(&path, Compression::None).unwrap();
        writer.write(&CounterArray::U16(vec![7, u16::MAX])).unwrap();
        writer.close().unwrap();

        let mut reader = LedgerReader::open_for_read(&path, Compression::None).unwrap();
        let err = reader.read(CounterWidth::W16).unwrap_err();
        assert!(matches!(err, IbError::InvalidData { .. }));
        assert!(err.to_string().contains("serial 0"));
    }

    #[test]
    fn test_skipped_serial_is_out_of_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("matrix.bin");
        let mut writer = LedgerWriter::open_for_write(&path, Compression::None).unwrap();
        writer.write(&array(&[1])).unwrap();
        writer.write(&array(&[2])).unwrap();
        writer.close().unwrap();

        // Drop the first header and its payload
        let index = std::fs::read(index_path(&path)).unwrap();
        std::fs::write(index_path(&path), &index[HEADER_LEN..]).unwrap();
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[4..]).unwrap();

        let mut reader = LedgerReader::open_for_read(&path, Compression::None).unwrap();
        assert!(matches!(
            reader.read(CounterWidth::W32),
            Err(IbError::OutOfOrder { expected: 0, actual: 1, .. })
        ));
    }

    #[test]
    fn test_missing_terminal_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("matrix.bin");
        let mut writer = LedgerWriter::open_for_write(&path, Compression::None).unwrap();
        writer.write(&array(&[1])).unwrap();
        writer.close().unwrap();

        let index = std::fs::read(index_path(&path)).unwrap();
        std::fs::write(index_path(&path), &index[..HEADER_LEN]).unwrap();

        let mut reader = LedgerReader::open_for_read(&path, Compression::None).unwrap();
        reader.read(CounterWidth::W32).unwrap();
        assert!(matches!(
            reader.read(CounterWidth::W32),
            Err(IbError::InvalidData { .. })
        ));
    }

    #[test]
    fn test_empty_ledger() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("matrix.bin");
        let mut writer = LedgerWriter::open_for_write(&path, Compression::None).unwrap();
        writer.close().unwrap();

        let mut reader = LedgerReader::open_for_read(&path, Compression::None).unwrap();
        assert!(reader.read(CounterWidth::W16).unwrap().is_terminal());
    }
}
