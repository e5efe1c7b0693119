//! A [`PeerTransport`] that tunnels everything through the signaling server.
//!
//! Useful when no direct data channel is available, and as the reference
//! transport for the CLI node. Every payload is a JSON object with a
//! `relay` discriminator:
//!
//! | `relay` | direction          | meaning                                  |
//! |---------|--------------------|------------------------------------------|
//! | `hello` | initiator → remote | open request                             |
//! | `ack`   | remote → initiator | open accepted, both sides now connected  |
//! | `data`  | either             | one frame; `body` holds the UTF-8 bytes  |
//! | `bye`   | either             | the sender closed its side               |
//!
//! `data` payloads are marked silent so they are not logged per frame.

use super::{PeerTransport, Role, TransportEvent, TransportFactory};
use crate::core::error::TransportError;
use crate::core::signaling::{SignalEnvelope, SignalSink};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

const RELAY_HELLO: &str = "hello";
const RELAY_ACK: &str = "ack";
const RELAY_DATA: &str = "data";
const RELAY_BYE: &str = "bye";

#[derive(Default)]
struct RelayState {
    open: bool,
    closed: bool,
}

pub struct RelayTransport {
    local_id: String,
    peer_id: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    // Teardown detaches the event channel before `close` runs, so the
    // farewell goes straight to the sink.
    sink: Arc<dyn SignalSink>,
    state: Mutex<RelayState>,
}

impl RelayTransport {
    fn state(&self) -> std::sync::MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit_signal(&self, kind: &str, body: Option<String>, silent: bool) {
        let mut payload = json!({ "relay": kind });
        if let Some(body) = body {
            payload["body"] = Value::String(body);
        }
        let _ = self.events.send(TransportEvent::Signal { payload, silent });
    }

    fn mark_open(&self) {
        let newly_open = {
            let mut s = self.state();
            let newly = !s.open && !s.closed;
            s.open |= newly;
            newly
        };
        if newly_open {
            let _ = self.events.send(TransportEvent::Connected);
        }
    }
}

impl PeerTransport for RelayTransport {
    fn signal(&self, payload: Value) -> Result<(), TransportError> {
        if self.state().closed {
            return Err(TransportError::Closed);
        }

        match payload.get("relay").and_then(Value::as_str) {
            Some(RELAY_HELLO) => {
                self.emit_signal(RELAY_ACK, None, false);
                self.mark_open();
                Ok(())
            }
            Some(RELAY_ACK) => {
                self.mark_open();
                Ok(())
            }
            Some(RELAY_DATA) => {
                if !self.state().open {
                    return Err(TransportError::NotOpen);
                }
                let body = payload
                    .get("body")
                    .and_then(Value::as_str)
                    .ok_or_else(|| TransportError::Serialization("relay data without body".into()))?;
                let _ = self
                    .events
                    .send(TransportEvent::Data(body.as_bytes().to_vec()));
                Ok(())
            }
            Some(RELAY_BYE) => {
                self.state().closed = true;
                debug!(event = "relay_bye_received", peer = %self.peer_id, "Remote closed relay");
                let _ = self.events.send(TransportEvent::Closed);
                Ok(())
            }
            _ => Err(TransportError::Serialization(format!(
                "unrecognized relay payload: {payload}"
            ))),
        }
    }

    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        {
            let s = self.state();
            if s.closed {
                return Err(TransportError::Closed);
            }
            if !s.open {
                return Err(TransportError::NotOpen);
            }
        }
        let body = String::from_utf8(bytes).map_err(|e| TransportError::Serialization(e.to_string()))?;
        self.emit_signal(RELAY_DATA, Some(body), true);
        Ok(())
    }

    fn close(&self) {
        {
            let mut s = self.state();
            if s.closed {
                return;
            }
            s.closed = true;
        }
        self.sink.send_signal(SignalEnvelope {
            from_id: self.local_id.clone(),
            to_id: self.peer_id.clone(),
            payload: json!({ "relay": RELAY_BYE }),
            is_silent: false,
        });
        let _ = self.events.send(TransportEvent::Closed);
    }
}

/// Builds [`RelayTransport`]s that say goodbye through `sink`.
pub struct RelayTransportFactory {
    local_id: String,
    sink: Arc<dyn SignalSink>,
}

impl RelayTransportFactory {
    pub fn new(local_id: impl Into<String>, sink: Arc<dyn SignalSink>) -> Self {
        Self {
            local_id: local_id.into(),
            sink,
        }
    }
}

impl TransportFactory for RelayTransportFactory {
    fn create(
        &self,
        peer_id: &str,
        role: Role,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = RelayTransport {
            local_id: self.local_id.clone(),
            peer_id: peer_id.to_string(),
            events,
            sink: self.sink.clone(),
            state: Mutex::new(RelayState::default()),
        };
        if role == Role::Initiator {
            transport.emit_signal(RELAY_HELLO, None, false);
        }
        Ok(Arc::new(transport))
    }

    /// Only `hello` starts a connection; a late `bye` or `data` from a
    /// closed peer must not resurrect it.
    fn opens_connection(&self, payload: &Value) -> bool {
        payload.get("relay").and_then(Value::as_str) == Some(RELAY_HELLO)
    }
}
