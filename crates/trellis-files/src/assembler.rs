//! Reassembly for the receiving side of a transfer.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Writes received chunks to disk in arrival order and checks the final size
/// against the negotiated one.
pub struct FileAssembler {
    file: File,
    expected_size: u64,
    written: u64,
}

impl FileAssembler {
    /// Create the destination file. Refuses to overwrite an existing path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file already exists or cannot be created.
    pub fn create<P: AsRef<Path>>(path: P, expected_size: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;

        Ok(Self {
            file,
            expected_size,
            written: 0,
        })
    }

    /// Append one chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk overruns the negotiated size or the
    /// write fails.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        let new_total = self.written + chunk.len() as u64;
        if new_total > self.expected_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk overruns negotiated file size",
            ));
        }
        self.file.write_all(chunk)?;
        self.written = new_total;
        Ok(())
    }

    /// Bytes written so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and verify the final size matches the negotiation.
    ///
    /// # Errors
    ///
    /// Returns an error on a short transfer or failed flush.
    pub fn finish(mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.written != self.expected_size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "transfer truncated: {} of {} bytes",
                    self.written, self.expected_size
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_assemble_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");

        let mut assembler = FileAssembler::create(&path, 7).unwrap();
        assembler.write_chunk(b"hell").unwrap();
        assembler.write_chunk(b"o!!").unwrap();
        assembler.finish().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"hello!!");
    }

    #[test]
    fn test_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        std::fs::write(&path, b"already here").unwrap();

        assert!(FileAssembler::create(&path, 4).is_err());
    }

    #[test]
    fn test_overrun_rejected() {
        let dir = TempDir::new().unwrap();
        let mut assembler = FileAssembler::create(dir.path().join("x"), 3).unwrap();
        assert!(assembler.write_chunk(b"abcd").is_err());
    }

    #[test]
    fn test_short_transfer_rejected() {
        let dir = TempDir::new().unwrap();
        let mut assembler = FileAssembler::create(dir.path().join("x"), 10).unwrap();
        assembler.write_chunk(b"abc").unwrap();
        assert!(assembler.finish().is_err());
    }
}
