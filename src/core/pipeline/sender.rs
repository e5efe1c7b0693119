//! Sender side of the chunk protocol: paced frame emission.
//!
//! ```text
//! encode_frames ──► meta ─(pace)─► data#0 ─(pace)─► data#1 … ──► PeerTransport::send
//! ```
//!
//! Frames are sent strictly in index order with a fixed delay between them
//! so a large message does not overrun the channel's send buffer in one
//! burst. A [`PendingSendRecord`] tracks each transfer for progress logging
//! and is dropped on completion, failure, or peer purge.

use crate::core::connection::PeerTransport;
use crate::core::error::TransportError;
use crate::core::pipeline::chunk::ChunkFrame;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Progress of one outgoing chunked transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSendRecord {
    pub peer_id: String,
    pub total: u32,
    pub sent_count: u32,
}

/// Outgoing transfers keyed by `chunk_id`.
#[derive(Debug, Clone, Default)]
pub struct PendingSends {
    records: Arc<Mutex<HashMap<String, PendingSendRecord>>>,
}

impl PendingSends {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingSendRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(&self, chunk_id: &str, peer_id: &str, total: u32) {
        self.lock().insert(
            chunk_id.to_string(),
            PendingSendRecord {
                peer_id: peer_id.to_string(),
                total,
                sent_count: 0,
            },
        );
    }

    /// Count one sent data frame. `false` once the record is gone (purged).
    fn advance(&self, chunk_id: &str) -> bool {
        match self.lock().get_mut(chunk_id) {
            Some(rec) => {
                rec.sent_count += 1;
                true
            }
            None => false,
        }
    }

    fn finish(&self, chunk_id: &str) -> Option<PendingSendRecord> {
        self.lock().remove(chunk_id)
    }

    pub fn get(&self, chunk_id: &str) -> Option<PendingSendRecord> {
        self.lock().get(chunk_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record addressed to `peer_id`. In-flight sends for those
    /// records stop before their next frame.
    pub fn purge_peer(&self, peer_id: &str) -> usize {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|_, r| r.peer_id != peer_id);
        before - records.len()
    }
}

/// Send `frames` (meta first) over `transport`, `pacing` apart.
///
/// Stops early with [`TransportError::Closed`] if the record is purged
/// mid-transfer, or with the transport's error if a send fails.
pub async fn send_paced(
    pending: &PendingSends,
    peer_id: &str,
    chunk_id: &str,
    frames: Vec<ChunkFrame>,
    transport: Arc<dyn PeerTransport>,
    pacing: Duration,
) -> Result<(), TransportError> {
    let total = frames.len().saturating_sub(1) as u32;
    pending.begin(chunk_id, peer_id, total);

    let result = emit(pending, chunk_id, frames, transport.as_ref(), pacing).await;

    match (&result, pending.finish(chunk_id)) {
        (Ok(()), Some(rec)) => {
            debug!(
                event = "chunk_send_complete",
                peer = peer_id,
                chunk_id,
                frames = rec.sent_count,
                "Chunked message sent"
            );
        }
        (Err(e), rec) => {
            warn!(
                event = "chunk_send_failed",
                peer = peer_id,
                chunk_id,
                sent = rec.map_or(0, |r| r.sent_count),
                total,
                error = %e,
                "Chunked message send aborted"
            );
        }
        (Ok(()), None) => {}
    }
    result
}

async fn emit(
    pending: &PendingSends,
    chunk_id: &str,
    frames: Vec<ChunkFrame>,
    transport: &dyn PeerTransport,
    pacing: Duration,
) -> Result<(), TransportError> {
    for (i, frame) in frames.into_iter().enumerate() {
        if i > 0 && !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }
        let is_data = matches!(frame, ChunkFrame::Data(_));
        if is_data && pending.get(chunk_id).is_none() {
            return Err(TransportError::Closed);
        }
        transport.send(frame.to_bytes()?)?;
        if is_data && !pending.advance(chunk_id) {
            return Err(TransportError::Closed);
        }
    }
    Ok(())
}
