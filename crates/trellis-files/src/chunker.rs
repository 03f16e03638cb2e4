//! Sequential file chunking for the sending side of a transfer.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Reads a file as a sequence of fixed-size chunks.
///
/// The last chunk is short when the file size is not a multiple of the chunk
/// size; an exact multiple produces no trailing empty chunk.
pub struct FileChunker {
    file: File,
    chunk_size: usize,
    total_size: u64,
    current_offset: u64,
}

impl FileChunker {
    /// Open a file for chunked reading.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or its metadata read.
    pub fn open<P: AsRef<Path>>(path: P, chunk_size: usize) -> io::Result<Self> {
        let file = File::open(path)?;
        let total_size = file.metadata()?.len();

        Ok(Self {
            file,
            chunk_size,
            total_size,
            current_offset: 0,
        })
    }

    /// Total number of chunks this file will produce.
    #[must_use]
    pub fn num_chunks(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size as u64)
    }

    /// Total file size in bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Read the next chunk, or `None` once the file is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if reading from the file fails.
    pub fn read_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.current_offset >= self.total_size {
            return Ok(None);
        }

        let remaining = self.total_size - self.current_offset;
        let chunk_len = remaining.min(self.chunk_size as u64) as usize;

        let mut buffer = vec![0u8; chunk_len];
        self.file.read_exact(&mut buffer)?;
        self.current_offset += chunk_len as u64;

        Ok(Some(buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_file_with(contents: &[u8]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(contents).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let f = temp_file_with(&[0x55u8; 2048]);
        let mut chunker = FileChunker::open(f.path(), 1024).unwrap();

        assert_eq!(chunker.num_chunks(), 2);
        assert_eq!(chunker.read_chunk().unwrap().unwrap().len(), 1024);
        assert_eq!(chunker.read_chunk().unwrap().unwrap().len(), 1024);
        assert!(chunker.read_chunk().unwrap().is_none());
    }

    #[test]
    fn test_remainder_chunk() {
        let f = temp_file_with(&[0x55u8; 2 * 1024 + 3]);
        let mut chunker = FileChunker::open(f.path(), 1024).unwrap();

        assert_eq!(chunker.num_chunks(), 3);
        assert_eq!(chunker.read_chunk().unwrap().unwrap().len(), 1024);
        assert_eq!(chunker.read_chunk().unwrap().unwrap().len(), 1024);
        assert_eq!(chunker.read_chunk().unwrap().unwrap().len(), 3);
        assert!(chunker.read_chunk().unwrap().is_none());
    }

    #[test]
    fn test_empty_file() {
        let f = temp_file_with(&[]);
        let mut chunker = FileChunker::open(f.path(), 1024).unwrap();

        assert_eq!(chunker.num_chunks(), 0);
        assert!(chunker.read_chunk().unwrap().is_none());
    }

    #[test]
    fn test_contents_preserved() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let f = temp_file_with(&data);
        let mut chunker = FileChunker::open(f.path(), 1024).unwrap();

        let mut out = Vec::new();
        while let Some(chunk) = chunker.read_chunk().unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, data);
    }
}
