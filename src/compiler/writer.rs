use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Where a written tensor landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetToken {
    /// Global byte offset within the stream.
    pub offset: u64,
    /// Artifact index holding the tensor.
    pub chunk: usize,
    pub len: usize,
}

/// One bounded artifact file of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightChunk {
    /// Symbol and file stem, e.g. `Net_wt000`.
    pub name: String,
    /// Global offset of the first byte.
    pub base: u64,
    pub len: u64,
    /// Empty in skip mode.
    pub data: Vec<u8>,
}

/// Append-only, chunked weight stream.
///
/// A tensor never straddles two chunks: when the next write would cross the bound the current
/// chunk is closed first. The global offset keeps counting across chunks. Skip mode performs the
/// same bookkeeping without retaining bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightArtifact {
    prefix: String,
    chunk_size: usize,
    skip: bool,
    count: u64,
    chunks: Vec<WeightChunk>,
}

impl WeightArtifact {
    pub fn new(prefix: &str, chunk_size: usize, skip: bool) -> Self {
        let mut artifact = Self {
            prefix: prefix.to_string(),
            chunk_size,
            skip,
            count: 0,
            chunks: Vec::new(),
        };
        artifact.open_chunk();
        artifact
    }

    fn open_chunk(&mut self) {
        let name = format!("{}_wt{:03}", self.prefix, self.chunks.len());
        debug!("Opening weight chunk {} at offset {}", name, self.count);
        self.chunks.push(WeightChunk {
            name,
            base: self.count,
            len: 0,
            data: Vec::new(),
        });
    }

    pub fn write(&mut self, bytes: &[u8]) -> OffsetToken {
        let size = bytes.len() as u64;
        let bound = self.chunk_size as u64;
        let current_len = self.chunks.last().map_or(0, |c| c.len);
        if current_len > 0 && current_len + size > bound {
            self.open_chunk();
        }
        if size > bound {
            warn!(
                "Tensor of {} bytes exceeds the {} byte chunk bound; it gets its own chunk",
                size, bound
            );
        }
        let offset = self.count;
        let chunk_index = self.chunks.len() - 1;
        let skip = self.skip;
        let chunk = &mut self.chunks[chunk_index];
        if !skip {
            chunk.data.extend_from_slice(bytes);
        }
        chunk.len += size;
        self.count += size;
        OffsetToken {
            offset,
            chunk: chunk_index,
            len: bytes.len(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn total_bytes(&self) -> u64 {
        self.count
    }

    pub fn chunks(&self) -> &[WeightChunk] {
        &self.chunks
    }

    pub fn is_skipped(&self) -> bool {
        self.skip
    }

    /// Writes every chunk as `<prefix>_wtNNN.bin` under `dir`. Nothing is written in skip mode.
    pub fn write_to_dir<P: AsRef<Path>>(&self, dir: P) -> io::Result<Vec<PathBuf>> {
        if self.skip {
            return Ok(Vec::new());
        }
        fs::create_dir_all(dir.as_ref())?;
        let mut paths = Vec::with_capacity(self.chunks.len());
        for chunk in &self.chunks {
            let path = dir.as_ref().join(format!("{}.bin", chunk.name.to_lowercase()));
            fs::write(&path, &chunk.data)?;
            paths.push(path);
        }
        Ok(paths)
    }
}
