//! Binary input for the PZ file format.
//!
//! All multi-byte integers in a PZ file are little-endian. Strings are
//! length-prefixed with a 16-bit length and are not null terminated.
//!
//! Every primitive read returns a `Result`; a short read near the end of the
//! file is an error, never silently zero-extended. Callers propagate failure
//! upward as a bad file.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// The combination of traits a byte source must provide.
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek> ReadSeek for T {}

/// A positioned reader over a PZ byte stream.
pub struct BinaryInput {
    filename: String,
    inner: Box<dyn ReadSeek>,
}

impl BinaryInput {
    /// Open a file for reading.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            filename: path.display().to_string(),
            inner: Box::new(BufReader::new(file)),
        })
    }

    /// Wrap an arbitrary byte source, typically an in-memory buffer in tests.
    pub fn from_reader(name: impl Into<String>, reader: impl ReadSeek + 'static) -> Self {
        Self {
            filename: name.into(),
            inner: Box::new(reader),
        }
    }

    /// The name of the underlying file, for error messages.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Read an unsigned 8-bit integer.
    pub fn read_u8(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.inner.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Read an unsigned little-endian 16-bit integer.
    pub fn read_u16(&mut self) -> io::Result<u16> {
        let mut buf = [0u8; 2];
        self.inner.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Read an unsigned little-endian 32-bit integer.
    pub fn read_u32(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read an unsigned little-endian 64-bit integer.
    pub fn read_u64(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.inner.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a string prefixed by a 16-bit length.
    pub fn read_len_string(&mut self) -> io::Result<String> {
        let len = self.read_u16()? as usize;
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        String::from_utf8(buf)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "string is not valid UTF-8"))
    }

    /// Skip forward by `n` bytes from the current position.
    pub fn seek_cur(&mut self, n: i64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Current(n))?;
        Ok(())
    }

    /// Seek to an absolute position.
    pub fn seek_set(&mut self, pos: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    /// The current absolute position.
    pub fn tell(&mut self) -> io::Result<u64> {
        self.inner.stream_position()
    }

    /// True when the reader is exactly at the end of input.
    ///
    /// Used by the loader's tail check: any byte remaining after the last
    /// export is junk.
    pub fn is_at_eof(&mut self) -> io::Result<bool> {
        let pos = self.inner.stream_position()?;
        let end = self.inner.seek(SeekFrom::End(0))?;
        if pos != end {
            self.inner.seek(SeekFrom::Start(pos))?;
        }
        Ok(pos == end)
    }
}

impl std::fmt::Debug for BinaryInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryInput")
            .field("filename", &self.filename)
            .finish_non_exhaustive()
    }
}
