use std::io::Read;

use fastcdc::v2020::{FastCDC, StreamCDC};
use serde::{Deserialize, Serialize};

use crate::error::{CairnError, Result};

/// Content-defined chunking parameters, persisted in the CONFIG blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub algorithm: String,
    pub min_size: u32,
    pub normal_size: u32,
    pub max_size: u32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        ChunkingConfig {
            algorithm: "fastcdc".to_string(),
            min_size: 512 * 1024,
            normal_size: 1024 * 1024,
            max_size: 8192 * 1024,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.algorithm != "fastcdc" {
            return Err(CairnError::UnsupportedChunking(self.algorithm.clone()));
        }
        if self.min_size == 0 || self.min_size > self.normal_size || self.normal_size > self.max_size
        {
            return Err(CairnError::Config(format!(
                "invalid chunking bounds: min={} normal={} max={}",
                self.min_size, self.normal_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Chunk a byte slice. Returns `(offset, length)` pairs covering the input
/// in order; empty input yields no chunks.
pub fn chunk_data(data: &[u8], config: &ChunkingConfig) -> Vec<(usize, usize)> {
    let chunker = FastCDC::new(data, config.min_size, config.normal_size, config.max_size);
    chunker.map(|chunk| (chunk.offset, chunk.length)).collect()
}

/// One chunk produced by [`ChunkStream`], owning its bytes.
pub struct Chunk {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Streaming chunker over any reader. Boundaries depend only on content,
/// not on how the reader buffers, so a file chunked through this iterator
/// matches `chunk_data` over the same bytes.
pub struct ChunkStream<R: Read> {
    inner: StreamCDC<R>,
}

impl<R: Read> ChunkStream<R> {
    pub fn new(reader: R, config: &ChunkingConfig) -> Self {
        ChunkStream {
            inner: StreamCDC::new(reader, config.min_size, config.normal_size, config.max_size),
        }
    }
}

impl<R: Read> Iterator for ChunkStream<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.inner.next()?;
        Some(
            chunk
                .map(|c| Chunk {
                    offset: c.offset,
                    data: c.data,
                })
                .map_err(|e| CairnError::Other(format!("chunking failed: {e}"))),
        )
    }
}
