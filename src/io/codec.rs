//! # Stream Compression
//!
//! Byte-stream writers and readers selected by name. The ledger wraps its
//! data file in one of these; the index file is always stored plain.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::error::{IbError, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    #[serde(rename = "gz", alias = "gzip")]
    Gzip,
}

impl Compression {
    /// Parse a codec name as given on the command line
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "gz" | "gzip" => Ok(Self::Gzip),
            other => Err(IbError::config(format!(
                "unknown compression '{}' (expected none or gz)",
                other
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gz",
        }
    }

    /// File extension appended to compressed outputs
    pub fn extension(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gzip => Some("gz"),
        }
    }

    /// `path` with this codec's extension appended
    pub fn apply_extension(self, path: &Path) -> PathBuf {
        match self.extension() {
            None => path.to_path_buf(),
            Some(ext) => {
                let mut name = path.as_os_str().to_os_string();
                name.push(".");
                name.push(ext);
                PathBuf::from(name)
            }
        }
    }

    pub fn writer(self, file: File) -> Box<dyn StreamWriter> {
        let buffered = BufWriter::new(file);
        match self {
            Self::None => Box::new(PlainWriter(buffered)),
            Self::Gzip => Box::new(GzipWriter(GzEncoder::new(
                buffered,
                flate2::Compression::default(),
            ))),
        }
    }

    pub fn reader(self, file: File) -> Box<dyn Read + Send> {
        let buffered = BufReader::new(file);
        match self {
            Self::None => Box::new(buffered),
            Self::Gzip => Box::new(MultiGzDecoder::new(buffered)),
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Write sink with an explicit end of stream
pub trait StreamWriter: Write + Send {
    /// Flush everything, write any trailer and sync the file
    fn finish(self: Box<Self>) -> io::Result<()>;
}

struct PlainWriter(BufWriter<File>);

impl Write for PlainWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl StreamWriter for PlainWriter {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let file = self.0.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }
}

struct GzipWriter(GzEncoder<BufWriter<File>>);

impl Write for GzipWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl StreamWriter for GzipWriter {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let buffered = self.0.finish()?;
        let file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }
}
