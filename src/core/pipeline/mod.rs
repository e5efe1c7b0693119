//! Chunked message protocol above a peer transport's raw send primitive.
//!
//! [`ChunkTransport`] is the single entry point: `send` serializes a message
//! and either sends it directly or splits it into paced chunk frames;
//! `receive` turns incoming frames back into whole JSON messages.

pub mod chunk;
pub mod receiver;
pub mod sender;

use crate::core::config::{MAX_CHUNKS_PER_MESSAGE, TransportConfig};
use crate::core::connection::PeerTransport;
use crate::core::error::{ReassemblyError, TransportError};
use chunk::{ChunkFrame, encode_frames, new_chunk_id};
use receiver::{DataOutcome, ReassemblyTable};
use sender::{PendingSends, send_paced};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Chunk encoder/reassembler shared by every peer connection.
#[derive(Clone)]
pub struct ChunkTransport {
    chunk_size: usize,
    pacing: Duration,
    reassembly: Arc<Mutex<ReassemblyTable>>,
    pending: PendingSends,
}

impl ChunkTransport {
    pub fn new(chunk_size: usize, pacing: Duration) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            pacing,
            reassembly: Arc::new(Mutex::new(ReassemblyTable::new())),
            pending: PendingSends::new(),
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.chunk_size, config.chunk_pacing())
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Serialize `message` and send it to `peer_id` over `transport`.
    ///
    /// Payloads up to `chunk_size` bytes go out as a single frame. Larger
    /// ones become one `chunk-meta` plus `chunk-data` frames, paced apart;
    /// the future resolves after the last frame has been handed to the
    /// transport. Messages needing more than [`MAX_CHUNKS_PER_MESSAGE`]
    /// chunks are refused with [`TransportError::TooLarge`] before any frame
    /// is sent.
    pub async fn send(
        &self,
        peer_id: &str,
        transport: Arc<dyn PeerTransport>,
        message: &Value,
    ) -> Result<(), TransportError> {
        let payload = serde_json::to_string(message)?;
        if payload.len() <= self.chunk_size {
            return transport.send(payload.into_bytes());
        }

        let chunk_id = new_chunk_id();
        let original_type = message
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let frames = encode_frames(&chunk_id, &payload, self.chunk_size, original_type);
        let chunks = frames.len() - 1;
        if chunks > MAX_CHUNKS_PER_MESSAGE as usize {
            warn!(
                event = "chunk_send_rejected",
                peer = peer_id,
                bytes = payload.len(),
                chunks,
                limit = MAX_CHUNKS_PER_MESSAGE,
                "Message exceeds the receiver chunk limit"
            );
            return Err(TransportError::TooLarge {
                chunks,
                limit: MAX_CHUNKS_PER_MESSAGE,
            });
        }
        info!(
            event = "chunk_send_start",
            peer = peer_id,
            chunk_id = %chunk_id,
            bytes = payload.len(),
            chunks,
            "Sending oversized message in chunks"
        );
        send_paced(&self.pending, peer_id, &chunk_id, frames, transport, self.pacing).await
    }

    /// Process one raw frame from `peer_id`.
    ///
    /// Returns `Ok(Some(message))` for a direct message or the completion of
    /// a chunked one, `Ok(None)` while a chunked message is still pending or
    /// when a duplicate was dropped.
    pub fn receive(&self, peer_id: &str, bytes: &[u8]) -> Result<Option<Value>, ReassemblyError> {
        let value: Value = serde_json::from_slice(bytes)?;
        if !ChunkFrame::is_chunk_frame(&value) {
            return Ok(Some(value));
        }

        match serde_json::from_value::<ChunkFrame>(value)? {
            ChunkFrame::Meta(meta) => {
                let chunk_id = meta.chunk_id.clone();
                let total = meta.total_chunks;
                if self.table().start(peer_id, meta)? {
                    debug!(
                        event = "chunk_meta_received",
                        peer = peer_id,
                        chunk_id = %chunk_id,
                        total,
                        "Reassembly started"
                    );
                } else {
                    debug!(
                        event = "chunk_meta_repeat",
                        peer = peer_id,
                        chunk_id = %chunk_id,
                        "Repeated chunk-meta ignored"
                    );
                }
                Ok(None)
            }
            ChunkFrame::Data(data) => {
                let chunk_id = data.chunk_id.clone();
                let index = data.index;
                let outcome = self.table().accept(peer_id, data)?;
                match outcome {
                    DataOutcome::Pending { .. } => Ok(None),
                    DataOutcome::Duplicate => {
                        debug!(
                            event = "chunk_duplicate",
                            peer = peer_id,
                            chunk_id = %chunk_id,
                            index,
                            "Duplicate chunk dropped"
                        );
                        Ok(None)
                    }
                    DataOutcome::Complete {
                        payload,
                        original_type,
                    } => match serde_json::from_str::<Value>(&payload) {
                        Ok(message) => {
                            debug!(
                                event = "chunk_reassembled",
                                peer = peer_id,
                                chunk_id = %chunk_id,
                                bytes = payload.len(),
                                original_type = original_type.as_deref().unwrap_or("-"),
                                "Chunked message reassembled"
                            );
                            Ok(Some(message))
                        }
                        Err(e) => {
                            warn!(
                                event = "chunk_parse_failed",
                                peer = peer_id,
                                chunk_id = %chunk_id,
                                error = %e,
                                "Reassembled payload is not valid JSON, discarded"
                            );
                            Err(ReassemblyError::Malformed(e))
                        }
                    },
                }
            }
        }
    }

    /// Drop all reassembly buffers and pending send records for `peer_id`.
    pub fn purge_peer(&self, peer_id: &str) {
        let buffers = self.table().purge(peer_id);
        let sends = self.pending.purge_peer(peer_id);
        if buffers > 0 || sends > 0 {
            debug!(
                event = "chunk_state_purged",
                peer = peer_id,
                buffers,
                sends,
                "Chunk state purged for peer"
            );
        }
    }

    /// Number of incomplete incoming transfers from `peer_id`.
    pub fn pending_reassembly(&self, peer_id: &str) -> usize {
        self.table().pending_for(peer_id)
    }

    /// Number of outgoing transfers still in flight.
    pub fn pending_sends(&self) -> usize {
        self.pending.len()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, ReassemblyTable> {
        self.reassembly.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use serde_json::json;

    /// Records every frame handed to it.
    #[derive(Default)]
    struct RecordingTransport {
        frames: Mutex<Vec<Vec<u8>>>,
        fail_after: Option<usize>,
    }

    impl RecordingTransport {
        fn frames(&self) -> Vec<Vec<u8>> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl PeerTransport for RecordingTransport {
        fn signal(&self, _payload: Value) -> Result<(), TransportError> {
            Ok(())
        }

        fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
            let mut frames = self.frames.lock().unwrap();
            if self.fail_after.is_some_and(|n| frames.len() >= n) {
                return Err(TransportError::Send("buffer full".into()));
            }
            frames.push(bytes);
            Ok(())
        }

        fn close(&self) {}
    }

    fn big_message(len: usize) -> Value {
        json!({ "type": "chat", "from": "alice", "text": "x".repeat(len), "n": [1, 2, 3] })
    }

    async fn encode(ct: &ChunkTransport, message: &Value) -> Vec<Vec<u8>> {
        let transport = Arc::new(RecordingTransport::default());
        ct.send("bob", transport.clone(), message).await.unwrap();
        transport.frames()
    }

    fn feed(ct: &ChunkTransport, peer: &str, frames: &[Vec<u8>]) -> Vec<Value> {
        frames
            .iter()
            .filter_map(|f| ct.receive(peer, f).ok().flatten())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_200k_payload_with_64k_chunks() {
        let ct = ChunkTransport::new(65_536, Duration::from_millis(10));
        let message = json!({ "type": "chat", "text": "y".repeat(200_000) });

        let frames = encode(&ct, &message).await;
        assert_eq!(frames.len(), 5);

        let parsed: Vec<Value> = frames
            .iter()
            .map(|f| serde_json::from_slice(f).unwrap())
            .collect();
        assert_eq!(parsed[0]["type"], "chunk-meta");
        assert_eq!(parsed[0]["totalChunks"], 4);
        assert_eq!(parsed[0]["originalType"], "chat");
        for (i, frame) in parsed[1..].iter().enumerate() {
            assert_eq!(frame["type"], "chunk-data");
            assert_eq!(frame["index"], i as u64);
            assert_eq!(frame["chunkId"], parsed[0]["chunkId"]);
        }

        let receiver = ChunkTransport::new(65_536, Duration::ZERO);
        let out = feed(&receiver, "alice", &frames);
        assert_eq!(out, vec![message]);
        assert_eq!(ct.pending_sends(), 0);
    }

    #[tokio::test]
    async fn small_payload_bypasses_chunking() {
        let ct = ChunkTransport::new(1024, Duration::ZERO);
        let message = json!({ "type": "chat", "text": "hi" });
        let frames = encode(&ct, &message).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(serde_json::from_slice::<Value>(&frames[0]).unwrap(), message);
        assert_eq!(feed(&ct, "alice", &frames), vec![message]);
    }

    #[tokio::test]
    async fn round_trip_in_any_arrival_order() {
        let sender = ChunkTransport::new(100, Duration::ZERO);
        let message = big_message(2_000);
        let frames = encode(&sender, &message).await;
        let (meta, data) = frames.split_first().unwrap();

        let mut reversed = data.to_vec();
        reversed.reverse();
        let mut shuffled = data.to_vec();
        shuffled.shuffle(&mut rand::thread_rng());

        for order in [data.to_vec(), reversed, shuffled] {
            let receiver = ChunkTransport::new(100, Duration::ZERO);
            let mut all = vec![meta.clone()];
            all.extend(order);
            assert_eq!(feed(&receiver, "alice", &all), vec![message.clone()]);
            assert_eq!(receiver.pending_reassembly("alice"), 0);
        }
    }

    #[tokio::test]
    async fn interleaved_transfers_reassemble_independently() {
        let sender = ChunkTransport::new(64, Duration::ZERO);
        let a = big_message(500);
        let b = json!({ "type": "note", "body": "z".repeat(700) });
        let fa = encode(&sender, &a).await;
        let fb = encode(&sender, &b).await;

        let mut mixed = vec![fa[0].clone(), fb[0].clone()];
        let (da, db) = (&fa[1..], &fb[1..]);
        for i in 0..da.len().max(db.len()) {
            if let Some(f) = db.get(i) {
                mixed.push(f.clone());
            }
            if let Some(f) = da.get(i) {
                mixed.push(f.clone());
            }
        }

        let receiver = ChunkTransport::new(64, Duration::ZERO);
        let out = feed(&receiver, "alice", &mixed);
        assert_eq!(out.len(), 2);
        assert!(out.contains(&a));
        assert!(out.contains(&b));
    }

    #[tokio::test]
    async fn replayed_chunk_never_completes_early() {
        let sender = ChunkTransport::new(50, Duration::ZERO);
        let message = big_message(200);
        let frames = encode(&sender, &message).await;
        let receiver = ChunkTransport::new(50, Duration::ZERO);

        receiver.receive("alice", &frames[0]).unwrap();
        let last = frames.len() - 1;
        // Replay the first data frame as many times as there are slots.
        for _ in 0..last {
            assert_eq!(receiver.receive("alice", &frames[1]).unwrap(), None);
        }
        assert_eq!(receiver.pending_reassembly("alice"), 1);

        let out = feed(&receiver, "alice", &frames[2..]);
        assert_eq!(out, vec![message]);
        // Replays after completion are orphans, not second deliveries.
        assert!(matches!(
            receiver.receive("alice", &frames[1]),
            Err(ReassemblyError::Orphaned { .. })
        ));
    }

    #[tokio::test]
    async fn withheld_chunk_stays_pending_until_purge() {
        let sender = ChunkTransport::new(50, Duration::ZERO);
        let frames = encode(&sender, &big_message(300)).await;
        let receiver = ChunkTransport::new(50, Duration::ZERO);

        let withheld = 3;
        let delivered: Vec<_> = frames
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != withheld)
            .map(|(_, f)| f.clone())
            .collect();
        assert!(feed(&receiver, "alice", &delivered).is_empty());
        assert_eq!(receiver.pending_reassembly("alice"), 1);

        receiver.purge_peer("alice");
        assert_eq!(receiver.pending_reassembly("alice"), 0);
        assert!(matches!(
            receiver.receive("alice", &frames[withheld]),
            Err(ReassemblyError::Orphaned { .. })
        ));
    }

    #[test]
    fn malformed_reassembly_is_discarded() {
        let receiver = ChunkTransport::new(8, Duration::ZERO);
        let frames = encode_frames("bad", "{\"not\": json", 8, None);
        let bytes: Vec<_> = frames.iter().map(|f| f.to_bytes().unwrap()).collect();
        let (last, init) = bytes.split_last().unwrap();
        for f in init {
            assert_eq!(receiver.receive("alice", f).unwrap(), None);
        }
        assert!(matches!(
            receiver.receive("alice", last),
            Err(ReassemblyError::Malformed(_))
        ));
        assert_eq!(receiver.pending_reassembly("alice"), 0);
    }

    #[test]
    fn orphan_and_garbage_frames_are_errors() {
        let receiver = ChunkTransport::new(8, Duration::ZERO);
        let orphan = br#"{"type":"chunk-data","chunkId":"nope","index":0,"payload":"x"}"#;
        assert!(matches!(
            receiver.receive("alice", orphan),
            Err(ReassemblyError::Orphaned { .. })
        ));
        assert!(matches!(
            receiver.receive("alice", b"\xff not json"),
            Err(ReassemblyError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn failed_send_aborts_and_clears_record() {
        let ct = ChunkTransport::new(10, Duration::ZERO);
        let transport = Arc::new(RecordingTransport {
            fail_after: Some(2),
            ..Default::default()
        });
        let result = ct.send("bob", transport.clone(), &big_message(100)).await;
        assert!(matches!(result, Err(TransportError::Send(_))));
        assert_eq!(transport.frames().len(), 2);
        assert_eq!(ct.pending_sends(), 0);
    }

    #[tokio::test]
    async fn message_over_chunk_limit_is_refused_before_sending() {
        let ct = ChunkTransport::new(16, Duration::ZERO);
        let transport = Arc::new(RecordingTransport::default());
        let message = json!({ "type": "chat", "text": "x".repeat(300_000) });

        let err = ct.send("bob", transport.clone(), &message).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::TooLarge { chunks, limit } if chunks > limit as usize && limit == MAX_CHUNKS_PER_MESSAGE
        ));
        assert!(transport.frames().is_empty());
        assert_eq!(ct.pending_sends(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn message_at_chunk_limit_is_sent() {
        let ct = ChunkTransport::new(16, Duration::ZERO);
        let transport = Arc::new(RecordingTransport::default());
        // `{"text":"` and `"}` add 11 bytes around the text.
        let text_len = 16 * MAX_CHUNKS_PER_MESSAGE as usize - 11;
        let message = json!({ "text": "x".repeat(text_len) });

        ct.send("bob", transport.clone(), &message).await.unwrap();
        assert_eq!(transport.frames().len(), MAX_CHUNKS_PER_MESSAGE as usize + 1);
        assert_eq!(feed(&ct, "alice", &transport.frames()), vec![message]);
    }
}
