//! Signaling wire frames.
//!
//! Every WebSocket text message to or from the rendezvous server is one JSON
//! object: `{"type": "...", "fromId"?, "toId"?, "payload"?, "isSilent"?}`.
//! Only `PING`/`PONG` are interpreted by the channel itself; `SIGNAL` frames
//! are routed by the registry and everything else is forwarded untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const FRAME_PING: &str = "PING";
pub const FRAME_PONG: &str = "PONG";
pub const FRAME_SIGNAL: &str = "SIGNAL";
pub const FRAME_REGISTER: &str = "REGISTER";

fn is_false(b: &bool) -> bool {
    !*b
}

/// One signaling frame as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "fromId", default, skip_serializing_if = "Option::is_none")]
    pub from_id: Option<String>,
    #[serde(rename = "toId", default, skip_serializing_if = "Option::is_none")]
    pub to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(rename = "isSilent", default, skip_serializing_if = "is_false")]
    pub is_silent: bool,
    /// Server-specific fields this crate does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SignalFrame {
    fn bare(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            from_id: None,
            to_id: None,
            payload: None,
            is_silent: false,
            extra: Map::new(),
        }
    }

    pub fn ping() -> Self {
        Self::bare(FRAME_PING)
    }

    pub fn pong() -> Self {
        Self::bare(FRAME_PONG)
    }

    /// Announces this node's peer id to the rendezvous server.
    pub fn register(local_id: &str) -> Self {
        Self {
            from_id: Some(local_id.to_string()),
            ..Self::bare(FRAME_REGISTER)
        }
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// A routed signaling payload between two peers.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEnvelope {
    pub from_id: String,
    pub to_id: String,
    pub payload: Value,
    pub is_silent: bool,
}

impl From<SignalEnvelope> for SignalFrame {
    fn from(env: SignalEnvelope) -> Self {
        SignalFrame {
            kind: FRAME_SIGNAL.to_string(),
            from_id: Some(env.from_id),
            to_id: Some(env.to_id),
            payload: Some(env.payload),
            is_silent: env.is_silent,
            extra: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ping_is_minimal() {
        assert_eq!(SignalFrame::ping().to_text().unwrap(), r#"{"type":"PING"}"#);
    }

    #[test]
    fn envelope_becomes_signal_frame() {
        let frame: SignalFrame = SignalEnvelope {
            from_id: "a".into(),
            to_id: "b".into(),
            payload: json!({"sdp": "offer"}),
            is_silent: true,
        }
        .into();
        let v: Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(
            v,
            json!({"type": "SIGNAL", "fromId": "a", "toId": "b", "payload": {"sdp": "offer"}, "isSilent": true})
        );
    }

    #[test]
    fn unknown_frames_keep_their_fields() {
        let frame =
            SignalFrame::from_text(r#"{"type":"PEERS","payload":["a","b"],"room":"r1"}"#).unwrap();
        assert!(frame.is("PEERS"));
        assert_eq!(frame.payload, Some(json!(["a", "b"])));
        assert_eq!(frame.extra.get("room"), Some(&json!("r1")));
        assert!(!frame.is_silent);
    }
}
