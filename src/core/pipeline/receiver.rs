//! Reassembly of chunked messages.
//!
//! # Memory model
//!
//! One [`ReassemblyBuffer`] per `(peer, chunk_id)`, holding `total` optional
//! string slots. Buffers are created by a `chunk-meta` frame and removed on
//! completion (successful or not) or when the peer is purged. A peer may
//! hold at most [`MAX_REASSEMBLY_BUFFERS_PER_PEER`] buffers at once. The
//! last [`RECENTLY_COMPLETED_PER_PEER`] completed ids are remembered so a
//! late repeated `chunk-meta` cannot allocate a buffer that never fills.
//!
//! # Duplicate-chunk safety
//!
//! A slot is filled at most once. A repeated index is reported as
//! [`InsertOutcome::Duplicate`] and never increments `filled_count`, so a
//! replayed frame can neither corrupt the payload nor complete it early.

use crate::core::config::{
    MAX_CHUNKS_PER_MESSAGE, MAX_REASSEMBLY_BUFFERS_PER_PEER, RECENTLY_COMPLETED_PER_PEER,
};
use crate::core::error::ReassemblyError;
use crate::core::pipeline::chunk::{ChunkData, ChunkMeta};
use std::collections::{HashMap, VecDeque};

/// Result of inserting a data frame into a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Slot filled, message not yet complete.
    Pending,
    /// Slot filled and every slot is now present.
    Complete,
    /// Slot was already filled; frame dropped.
    Duplicate,
}

/// Scratch state for one incoming chunked message.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    total: u32,
    filled_count: u32,
    slots: Vec<Option<String>>,
    original_type: Option<String>,
}

impl ReassemblyBuffer {
    pub fn new(total: u32, original_type: Option<String>) -> Self {
        Self {
            total,
            filled_count: 0,
            slots: vec![None; total as usize],
            original_type,
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn filled_count(&self) -> u32 {
        self.filled_count
    }

    pub fn original_type(&self) -> Option<&str> {
        self.original_type.as_deref()
    }

    pub fn is_complete(&self) -> bool {
        self.filled_count == self.total
    }

    /// Indices not yet received.
    pub fn missing(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Fill `slots[index]` if empty. `index` must be below `total`.
    pub fn insert(&mut self, index: u32, payload: String) -> InsertOutcome {
        let slot = &mut self.slots[index as usize];
        if slot.is_some() {
            return InsertOutcome::Duplicate;
        }
        *slot = Some(payload);
        self.filled_count += 1;
        if self.is_complete() {
            InsertOutcome::Complete
        } else {
            InsertOutcome::Pending
        }
    }

    /// Concatenate all slots in index order.
    fn assemble(self) -> String {
        let len = self.slots.iter().flatten().map(String::len).sum();
        let mut out = String::with_capacity(len);
        for slot in self.slots.into_iter().flatten() {
            out.push_str(&slot);
        }
        out
    }
}

/// What a data frame did to the buffer table.
#[derive(Debug)]
pub enum DataOutcome {
    Pending { filled: u32, total: u32 },
    Duplicate,
    /// Every slot filled; the joined payload and the announced original type.
    Complete {
        payload: String,
        original_type: Option<String>,
    },
}

#[derive(Debug, Default)]
struct PeerTransfers {
    active: HashMap<String, ReassemblyBuffer>,
    completed: VecDeque<String>,
}

impl PeerTransfers {
    fn remember(&mut self, chunk_id: String) {
        if self.completed.len() >= RECENTLY_COMPLETED_PER_PEER {
            self.completed.pop_front();
        }
        self.completed.push_back(chunk_id);
    }

    fn recently_completed(&self, chunk_id: &str) -> bool {
        self.completed.iter().any(|id| id == chunk_id)
    }
}

/// Reassembly buffers of every remote peer, keyed `peer → chunk_id`.
#[derive(Debug, Default)]
pub struct ReassemblyTable {
    peers: HashMap<String, PeerTransfers>,
}

impl ReassemblyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a buffer for an announced transfer.
    ///
    /// Returns `Ok(false)` if the id is already in progress or was recently
    /// completed (the repeat meta is ignored).
    pub fn start(&mut self, peer_id: &str, meta: ChunkMeta) -> Result<bool, ReassemblyError> {
        if meta.total_chunks == 0 || meta.total_chunks > MAX_CHUNKS_PER_MESSAGE {
            return Err(ReassemblyError::InvalidTotal {
                chunk_id: meta.chunk_id,
                total: meta.total_chunks,
            });
        }

        let transfers = self.peers.entry(peer_id.to_string()).or_default();
        if transfers.active.contains_key(&meta.chunk_id) || transfers.recently_completed(&meta.chunk_id) {
            return Ok(false);
        }
        if transfers.active.len() >= MAX_REASSEMBLY_BUFFERS_PER_PEER {
            return Err(ReassemblyError::TooManyTransfers {
                peer_id: peer_id.to_string(),
                limit: MAX_REASSEMBLY_BUFFERS_PER_PEER,
            });
        }

        transfers.active.insert(
            meta.chunk_id,
            ReassemblyBuffer::new(meta.total_chunks, meta.original_type),
        );
        Ok(true)
    }

    /// Place one data frame. On completion the buffer is removed.
    pub fn accept(&mut self, peer_id: &str, data: ChunkData) -> Result<DataOutcome, ReassemblyError> {
        let Some(transfers) = self.peers.get_mut(peer_id) else {
            return Err(ReassemblyError::Orphaned {
                chunk_id: data.chunk_id,
                index: data.index,
            });
        };
        let Some(buffer) = transfers.active.get_mut(&data.chunk_id) else {
            return Err(ReassemblyError::Orphaned {
                chunk_id: data.chunk_id,
                index: data.index,
            });
        };
        if data.index >= buffer.total() {
            return Err(ReassemblyError::IndexOutOfRange {
                chunk_id: data.chunk_id,
                index: data.index,
                total: buffer.total(),
            });
        }

        match buffer.insert(data.index, data.payload) {
            InsertOutcome::Duplicate => Ok(DataOutcome::Duplicate),
            InsertOutcome::Pending => Ok(DataOutcome::Pending {
                filled: buffer.filled_count(),
                total: buffer.total(),
            }),
            InsertOutcome::Complete => {
                let buffer = transfers
                    .active
                    .remove(&data.chunk_id)
                    .ok_or_else(|| ReassemblyError::Orphaned {
                        chunk_id: data.chunk_id.clone(),
                        index: data.index,
                    })?;
                transfers.remember(data.chunk_id);
                let original_type = buffer.original_type.clone();
                Ok(DataOutcome::Complete {
                    payload: buffer.assemble(),
                    original_type,
                })
            }
        }
    }

    /// Drop every buffer held for `peer_id`, along with its completed-id
    /// history. Returns how many pending buffers were dropped.
    pub fn purge(&mut self, peer_id: &str) -> usize {
        self.peers.remove(peer_id).map_or(0, |t| t.active.len())
    }

    /// Number of in-progress transfers from `peer_id`.
    pub fn pending_for(&self, peer_id: &str) -> usize {
        self.peers.get(peer_id).map_or(0, |t| t.active.len())
    }

    /// Missing indices of one transfer, if it is still pending.
    pub fn missing(&self, peer_id: &str, chunk_id: &str) -> Option<Vec<u32>> {
        self.peers
            .get(peer_id)?
            .active
            .get(chunk_id)
            .map(ReassemblyBuffer::missing)
    }
}
