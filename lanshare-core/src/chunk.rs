//! Chunk store: split files into fixed-size chunks, track per-file chunk sets, reassemble.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::address_book::PeerAddress;

/// Default chunk size in bytes. Sender and receiver must agree on it.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024; // 1 MiB

/// Payload bytes kept across retired transfers before the oldest are evicted.
pub const DEFAULT_RETIRED_LIMIT: usize = 256 * 1024 * 1024;

fn effective_chunk_size(chunk_size: usize) -> usize {
    if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    }
}

/// Number of chunks for `len` bytes: `ceil(len / chunk_size)`. Zero chunk size uses the default.
pub fn chunk_count(len: u64, chunk_size: usize) -> u32 {
    let size = effective_chunk_size(chunk_size) as u64;
    let n = len.div_ceil(size);
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Total chunks for the file at `path`.
pub fn total_chunks_for_path(path: &Path, chunk_size: usize) -> io::Result<u32> {
    let len = std::fs::metadata(path)?.len();
    Ok(chunk_count(len, chunk_size))
}

/// Split a byte buffer into ordered chunk payloads. Every chunk but the last is exactly `chunk_size`.
pub fn split_bytes(data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    data.chunks(effective_chunk_size(chunk_size))
        .map(|c| c.to_vec())
        .collect()
}

/// Split the file at `path` into ordered chunk payloads, reading it sequentially.
pub fn split_file(path: &Path, chunk_size: usize) -> io::Result<Vec<Vec<u8>>> {
    let size = effective_chunk_size(chunk_size);
    let mut reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    loop {
        let mut buf = Vec::with_capacity(size);
        let n = reader.by_ref().take(size as u64).read_to_end(&mut buf)?;
        if n == 0 {
            break;
        }
        out.push(buf);
        if n < size {
            break;
        }
    }
    Ok(out)
}

/// One received slice of a file. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub file_name: String,
    pub index: u32,
    pub total_chunks: u32,
    pub payload: Vec<u8>,
    pub source: PeerAddress,
}

impl Chunk {
    pub fn info(&self) -> ChunkInfo {
        ChunkInfo {
            file_name: self.file_name.clone(),
            index: self.index,
            total_chunks: self.total_chunks,
            size: self.payload.len(),
        }
    }
}

/// Chunk metadata without the payload, for events and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub file_name: String,
    pub index: u32,
    pub total_chunks: u32,
    pub size: usize,
}

/// Accumulated chunks of one named transfer.
#[derive(Debug, Clone)]
pub struct ChunkSet {
    expected_total: u32,
    chunks: HashMap<u32, Chunk>,
    /// Peer that supplied the first chunk of this transfer.
    origin: PeerAddress,
}

impl ChunkSet {
    fn new(expected_total: u32, origin: PeerAddress) -> Self {
        Self {
            expected_total,
            chunks: HashMap::new(),
            origin,
        }
    }

    pub fn expected_total(&self) -> u32 {
        self.expected_total
    }

    pub fn received(&self) -> usize {
        self.chunks.len()
    }

    pub fn origin(&self) -> &PeerAddress {
        &self.origin
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.len() == self.expected_total as usize
            && (0..self.expected_total).all(|i| self.chunks.contains_key(&i))
    }

    pub fn missing_indices(&self) -> BTreeSet<u32> {
        (0..self.expected_total)
            .filter(|i| !self.chunks.contains_key(i))
            .collect()
    }

    fn payload_bytes(&self) -> usize {
        self.chunks.values().map(|c| c.payload.len()).sum()
    }

    fn assemble(&self, file_name: &str) -> Result<Vec<u8>, ChunkError> {
        if !self.is_complete() {
            return Err(ChunkError::IncompleteTransfer {
                file_name: file_name.to_string(),
                missing: self.expected_total as usize - self.chunks.len(),
            });
        }
        let len = self.chunks.values().map(|c| c.payload.len()).sum();
        let mut out = Vec::with_capacity(len);
        for i in 0..self.expected_total {
            if let Some(c) = self.chunks.get(&i) {
                out.extend_from_slice(&c.payload);
            }
        }
        Ok(out)
    }
}

/// Result of [`ChunkStore::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    pub is_new_chunk: bool,
    pub is_complete: bool,
}

/// A file whose chunk set became complete. Produced once per transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub source: PeerAddress,
}

/// State errors surfaced to the caller.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("transfer {file_name} incomplete: {missing} chunk(s) missing")]
    IncompleteTransfer { file_name: String, missing: usize },
    #[error("chunk {index} of {file_name} re-sent with a different payload")]
    PayloadMismatch { file_name: String, index: u32 },
    #[error("chunk of {file_name} claims {got} total chunks, transfer expects {expected}")]
    TotalMismatch {
        file_name: String,
        expected: u32,
        got: u32,
    },
    #[error("chunk index {index} out of range for {file_name} ({total} chunks)")]
    IndexOutOfRange {
        file_name: String,
        index: u32,
        total: u32,
    },
    #[error("chunk of {0} declares zero total chunks")]
    InvalidTotal(String),
    #[error("no transfer known for {0}")]
    UnknownFile(String),
}

/// Per-file chunk sets. Completed sets are retired and kept to serve repair requests
/// and to recognise late duplicates; retired payloads are bounded by a byte limit,
/// oldest transfer evicted first.
#[derive(Debug)]
pub struct ChunkStore {
    active: HashMap<String, ChunkSet>,
    retired: HashMap<String, ChunkSet>,
    retired_order: VecDeque<String>,
    retired_bytes: usize,
    retired_limit: usize,
}

impl Default for ChunkStore {
    fn default() -> Self {
        Self::with_retired_limit(DEFAULT_RETIRED_LIMIT)
    }
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store keeping at most `limit` payload bytes of retired transfers. The most
    /// recently completed transfer is always kept, even if it alone exceeds the limit.
    pub fn with_retired_limit(limit: usize) -> Self {
        Self {
            active: HashMap::new(),
            retired: HashMap::new(),
            retired_order: VecDeque::new(),
            retired_bytes: 0,
            retired_limit: limit,
        }
    }

    /// Insert a chunk. The first chunk of a file name fixes its expected total.
    /// Re-ingesting an identical chunk is a no-op; a differing payload is an error.
    ///
    /// With no live transfer, a chunk identical to one of the completed transfer of
    /// the same name is a late duplicate and changes nothing. Any other chunk starts a
    /// fresh transfer and discards the retired one.
    pub fn ingest(&mut self, chunk: Chunk) -> Result<IngestOutcome, ChunkError> {
        if chunk.total_chunks == 0 {
            return Err(ChunkError::InvalidTotal(chunk.file_name));
        }
        if chunk.index >= chunk.total_chunks {
            return Err(ChunkError::IndexOutOfRange {
                file_name: chunk.file_name,
                index: chunk.index,
                total: chunk.total_chunks,
            });
        }
        if !self.active.contains_key(&chunk.file_name) {
            if self.is_retired_duplicate(&chunk) {
                return Ok(IngestOutcome {
                    is_new_chunk: false,
                    is_complete: false,
                });
            }
            self.drop_retired(&chunk.file_name);
        }
        let set = self
            .active
            .entry(chunk.file_name.clone())
            .or_insert_with(|| ChunkSet::new(chunk.total_chunks, chunk.source.clone()));
        if chunk.total_chunks != set.expected_total {
            return Err(ChunkError::TotalMismatch {
                file_name: chunk.file_name,
                expected: set.expected_total,
                got: chunk.total_chunks,
            });
        }
        let is_new_chunk = match set.chunks.get(&chunk.index) {
            Some(held) if held.payload != chunk.payload => {
                return Err(ChunkError::PayloadMismatch {
                    file_name: chunk.file_name,
                    index: chunk.index,
                });
            }
            Some(_) => false,
            None => true,
        };
        set.chunks.insert(chunk.index, chunk);
        Ok(IngestOutcome {
            is_new_chunk,
            is_complete: set.is_complete(),
        })
    }

    fn is_retired_duplicate(&self, chunk: &Chunk) -> bool {
        self.retired.get(&chunk.file_name).is_some_and(|set| {
            set.expected_total == chunk.total_chunks
                && set
                    .chunks
                    .get(&chunk.index)
                    .is_some_and(|held| held.payload == chunk.payload)
        })
    }

    fn drop_retired(&mut self, file_name: &str) {
        if let Some(set) = self.retired.remove(file_name) {
            self.retired_bytes -= set.payload_bytes();
            self.retired_order.retain(|name| name != file_name);
        }
    }

    fn retire(&mut self, file_name: String, set: ChunkSet) {
        self.drop_retired(&file_name);
        self.retired_bytes += set.payload_bytes();
        self.retired_order.push_back(file_name.clone());
        self.retired.insert(file_name, set);
        while self.retired_bytes > self.retired_limit && self.retired_order.len() > 1 {
            if let Some(oldest) = self.retired_order.pop_front() {
                if let Some(set) = self.retired.remove(&oldest) {
                    self.retired_bytes -= set.payload_bytes();
                }
            }
        }
    }

    /// Whether a completed transfer of `file_name` is still held.
    pub fn is_retired(&self, file_name: &str) -> bool {
        self.retired.contains_key(file_name)
    }

    /// Payload bytes currently held for completed transfers.
    pub fn retired_bytes(&self) -> usize {
        self.retired_bytes
    }

    /// Ingest a chunk obtained by repair. Returns `None` when the file has no live transfer
    /// (late delivery after completion); repairs never open a new transfer.
    pub fn ingest_delivered(&mut self, chunk: Chunk) -> Result<Option<IngestOutcome>, ChunkError> {
        if !self.active.contains_key(&chunk.file_name) {
            return Ok(None);
        }
        self.ingest(chunk).map(Some)
    }

    /// File names with a live (incomplete or not yet retired) transfer.
    pub fn active_files(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    pub fn is_active(&self, file_name: &str) -> bool {
        self.active.contains_key(file_name)
    }

    pub fn chunk_set(&self, file_name: &str) -> Option<&ChunkSet> {
        self.active.get(file_name)
    }

    /// Indices in `[0, expected_total)` not yet held. Empty for a retired (completed) file.
    pub fn missing_indices(&self, file_name: &str) -> Result<BTreeSet<u32>, ChunkError> {
        if let Some(set) = self.active.get(file_name) {
            return Ok(set.missing_indices());
        }
        if self.retired.contains_key(file_name) {
            return Ok(BTreeSet::new());
        }
        Err(ChunkError::UnknownFile(file_name.to_string()))
    }

    /// Concatenate payloads in index order. Fails unless the live transfer is complete.
    pub fn assemble(&self, file_name: &str) -> Result<Vec<u8>, ChunkError> {
        match self.active.get(file_name) {
            Some(set) => set.assemble(file_name),
            None => Err(ChunkError::UnknownFile(file_name.to_string())),
        }
    }

    /// Assemble a complete transfer and retire its chunk set. The next chunk for the
    /// same file name starts a fresh transfer.
    pub fn complete(&mut self, file_name: &str) -> Result<AssembledFile, ChunkError> {
        let bytes = self.assemble(file_name)?;
        let set = self
            .active
            .remove(file_name)
            .ok_or_else(|| ChunkError::UnknownFile(file_name.to_string()))?;
        let source = set.origin.clone();
        self.retire(file_name.to_string(), set);
        Ok(AssembledFile {
            file_name: file_name.to_string(),
            bytes,
            source,
        })
    }

    /// Payload of a held chunk, from the live transfer or the retired one.
    pub fn payload(&self, file_name: &str, index: u32) -> Option<&[u8]> {
        self.active
            .get(file_name)
            .and_then(|s| s.chunks.get(&index))
            .or_else(|| self.retired.get(file_name).and_then(|s| s.chunks.get(&index)))
            .map(|c| c.payload.as_slice())
    }
}
