//! Chunk frame wire types and payload splitting.
//!
//! A message whose serialized form exceeds the configured chunk size travels
//! as one `chunk-meta` frame followed by `totalChunks` `chunk-data` frames:
//!
//! ```text
//! {"type":"chunk-meta","chunkId":"…","totalChunks":4,"originalType":"chat"}
//! {"type":"chunk-data","chunkId":"…","index":0,"payload":"{\"type\":\"chat\",…"}
//! …
//! ```
//!
//! Data frames address their slot explicitly, so the receiver does not
//! depend on arrival order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const FRAME_CHUNK_META: &str = "chunk-meta";
pub const FRAME_CHUNK_DATA: &str = "chunk-data";

/// Announces an incoming multi-frame message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    #[serde(rename = "chunkId")]
    pub chunk_id: String,
    #[serde(rename = "totalChunks")]
    pub total_chunks: u32,
    /// `type` field of the original message, if it had one.
    #[serde(rename = "originalType", default)]
    pub original_type: Option<String>,
}

/// One slice of a chunked message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkData {
    #[serde(rename = "chunkId")]
    pub chunk_id: String,
    pub index: u32,
    pub payload: String,
}

/// A chunk protocol frame, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChunkFrame {
    #[serde(rename = "chunk-meta")]
    Meta(ChunkMeta),
    #[serde(rename = "chunk-data")]
    Data(ChunkData),
}

impl ChunkFrame {
    pub fn chunk_id(&self) -> &str {
        match self {
            ChunkFrame::Meta(m) => &m.chunk_id,
            ChunkFrame::Data(d) => &d.chunk_id,
        }
    }

    /// Whether a parsed JSON value is a chunk protocol frame.
    pub fn is_chunk_frame(value: &Value) -> bool {
        matches!(
            value.get("type").and_then(Value::as_str),
            Some(FRAME_CHUNK_META | FRAME_CHUNK_DATA)
        )
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// A fresh transfer id.
pub fn new_chunk_id() -> String {
    Uuid::new_v4().to_string()
}

/// Split `payload` into contiguous slices of at most `chunk_size` bytes,
/// never cutting a UTF-8 character in half.
///
/// For ASCII payloads this yields exactly `ceil(len / chunk_size)` slices.
/// A character wider than `chunk_size` gets a slice of its own.
pub fn split_payload(payload: &str, chunk_size: usize) -> Vec<&str> {
    let chunk_size = chunk_size.max(1);
    let mut slices = Vec::with_capacity(payload.len().div_ceil(chunk_size));
    let mut rest = payload;
    while !rest.is_empty() {
        let mut end = chunk_size.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            // First character alone exceeds chunk_size.
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(end);
        slices.push(head);
        rest = tail;
    }
    slices
}

/// Build the full frame sequence (meta first, then data in index order)
/// for an oversized payload.
pub fn encode_frames(
    chunk_id: &str,
    payload: &str,
    chunk_size: usize,
    original_type: Option<String>,
) -> Vec<ChunkFrame> {
    let slices = split_payload(payload, chunk_size);
    let mut frames = Vec::with_capacity(slices.len() + 1);
    frames.push(ChunkFrame::Meta(ChunkMeta {
        chunk_id: chunk_id.to_string(),
        total_chunks: slices.len() as u32,
        original_type,
    }));
    frames.extend(slices.into_iter().enumerate().map(|(index, slice)| {
        ChunkFrame::Data(ChunkData {
            chunk_id: chunk_id.to_string(),
            index: index as u32,
            payload: slice.to_string(),
        })
    }));
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_ascii_exact_count() {
        let payload = "a".repeat(200_000);
        let slices = split_payload(&payload, 65_536);
        assert_eq!(slices.len(), 4);
        assert_eq!(slices[0].len(), 65_536);
        assert_eq!(slices[3].len(), 200_000 - 3 * 65_536);
        assert_eq!(slices.concat(), payload);
    }

    #[test]
    fn split_respects_char_boundaries() {
        let payload = "héllo wörld ✓✓✓";
        let slices = split_payload(payload, 4);
        assert!(slices.iter().all(|s| s.len() <= 4));
        assert_eq!(slices.concat(), payload);
    }

    #[test]
    fn split_wide_char_larger_than_chunk() {
        let slices = split_payload("✓x", 1);
        assert_eq!(slices, vec!["✓", "x"]);
    }

    #[test]
    fn meta_frame_wire_shape() {
        let frame = ChunkFrame::Meta(ChunkMeta {
            chunk_id: "abc".into(),
            total_chunks: 3,
            original_type: Some("chat".into()),
        });
        let v: Value = serde_json::from_slice(&frame.to_bytes().unwrap()).unwrap();
        assert_eq!(v["type"], "chunk-meta");
        assert_eq!(v["chunkId"], "abc");
        assert_eq!(v["totalChunks"], 3);
        assert_eq!(v["originalType"], "chat");
        assert!(ChunkFrame::is_chunk_frame(&v));
    }

    #[test]
    fn data_frame_parses_from_wire() {
        let raw = r#"{"type":"chunk-data","chunkId":"x","index":2,"payload":"abc"}"#;
        let frame: ChunkFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(
            frame,
            ChunkFrame::Data(ChunkData {
                chunk_id: "x".into(),
                index: 2,
                payload: "abc".into(),
            })
        );
    }

    #[test]
    fn encode_emits_meta_then_ordered_data() {
        let frames = encode_frames("id", "abcdefghij", 4, None);
        assert_eq!(frames.len(), 4);
        assert!(matches!(&frames[0], ChunkFrame::Meta(m) if m.total_chunks == 3));
        let indices: Vec<u32> = frames[1..]
            .iter()
            .map(|f| match f {
                ChunkFrame::Data(d) => d.index,
                ChunkFrame::Meta(_) => u32::MAX,
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn chunk_ids_are_unique() {
        assert_ne!(new_chunk_id(), new_chunk_id());
    }
}
