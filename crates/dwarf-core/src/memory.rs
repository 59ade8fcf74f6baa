//! Bounded-chunk memory reads through the agent.

use serde_json::json;
use thiserror::Error;

use crate::{AgentApi, AgentError, AgentReply};

/// Largest single read issued to the agent (1 MiB).
pub const CHUNK_CEILING: usize = 1024 * 1024;

/// Memory read error.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Read of {length} bytes at {address:#x} failed: {source}")]
    SubRead {
        address: u64,
        length: usize,
        #[source]
        source: AgentError,
    },
    #[error("No data returned for {length} bytes at {address:#x}")]
    NoData { address: u64, length: usize },
    #[error("Short read at {address:#x}: wanted {wanted} bytes, got {got}")]
    ShortRead {
        address: u64,
        wanted: usize,
        got: usize,
    },
    #[error("Address range {address:#x}+{length} overflows")]
    Overflow { address: u64, length: usize },
    #[error("Cannot buffer {length} bytes read at {address:#x}")]
    Allocation { address: u64, length: usize },
}

/// Accumulator for one logical read.
struct MemoryChunkJob {
    address: u64,
    length: usize,
    offset: usize,
    buffer: Vec<u8>,
}

impl MemoryChunkJob {
    fn new(address: u64, length: usize) -> Self {
        Self {
            address,
            length,
            offset: 0,
            buffer: Vec::new(),
        }
    }

    /// Address and size of the next sub-read, if any remain.
    fn next_request(&self, ceiling: usize) -> Option<(u64, usize)> {
        let remaining = self.length - self.offset;
        if remaining == 0 {
            return None;
        }
        Some((self.address + self.offset as u64, remaining.min(ceiling)))
    }

    /// Append a sub-read. The buffer grows one chunk at a time.
    fn push(&mut self, chunk: &[u8]) -> Result<(), MemoryError> {
        self.buffer
            .try_reserve_exact(chunk.len())
            .map_err(|_| MemoryError::Allocation {
                address: self.address,
                length: self.length,
            })?;
        self.buffer.extend_from_slice(chunk);
        self.offset += chunk.len();
        Ok(())
    }

    fn finish(self) -> Vec<u8> {
        debug_assert_eq!(self.buffer.len(), self.length);
        self.buffer
    }
}

/// Splits large reads into sequential sub-reads of at most the chunk size.
///
/// A read returns exactly the requested number of bytes or fails; partial
/// data is discarded on the first failed sub-read.
pub struct ChunkedMemoryReader<'a, A: ?Sized> {
    agent: &'a A,
    chunk_size: usize,
    thread_id: u64,
}

impl<'a, A: AgentApi + ?Sized> ChunkedMemoryReader<'a, A> {
    /// Create a reader with the default chunk ceiling.
    #[must_use]
    pub const fn new(agent: &'a A) -> Self {
        Self {
            agent,
            chunk_size: CHUNK_CEILING,
            thread_id: 0,
        }
    }

    /// Override the chunk size. Zero keeps the default.
    #[must_use]
    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        if chunk_size > 0 {
            self.chunk_size = chunk_size;
        }
        self
    }

    /// Issue reads in the context of `thread_id`.
    #[must_use]
    pub const fn with_thread(mut self, thread_id: u64) -> Self {
        self.thread_id = thread_id;
        self
    }

    /// Read `length` bytes at `address`.
    ///
    /// # Errors
    /// Returns error if any sub-read fails or comes back short.
    pub async fn read(&self, address: u64, length: usize) -> Result<Vec<u8>, MemoryError> {
        if length == 0 {
            return Ok(Vec::new());
        }
        if address.checked_add(length as u64).is_none() {
            return Err(MemoryError::Overflow { address, length });
        }
        if length <= self.chunk_size {
            return self.read_exact(address, length).await;
        }

        let mut job = MemoryChunkJob::new(address, length);
        while let Some((chunk_address, chunk_length)) = job.next_request(self.chunk_size) {
            let chunk = self.read_exact(chunk_address, chunk_length).await?;
            job.push(&chunk)?;
        }
        tracing::debug!(
            address = format_args!("{address:#x}"),
            length,
            "Chunked read complete"
        );
        Ok(job.finish())
    }

    async fn read_exact(&self, address: u64, length: usize) -> Result<Vec<u8>, MemoryError> {
        let reply = self
            .agent
            .api(
                self.thread_id,
                "readBytes",
                vec![json!(format!("{address:#x}")), json!(length)],
            )
            .await
            .map_err(|source| MemoryError::SubRead {
                address,
                length,
                source,
            })?;

        let AgentReply::Binary(bytes) = reply else {
            return Err(MemoryError::NoData { address, length });
        };
        if bytes.len() != length {
            return Err(MemoryError::ShortRead {
                address,
                wanted: length,
                got: bytes.len(),
            });
        }
        Ok(bytes.to_vec())
    }
}
