//! Peer connection bookkeeping above an external transport capability.
//!
//! The actual data channel (ICE, DTLS, SCTP) is provided by whoever
//! implements [`PeerTransport`]. This module only tracks one transport per
//! remote peer, relays its signaling payloads, and republishes its events.

pub mod events;
pub mod registry;
pub mod relay;

pub use events::{EventBus, PeerEvent, RemoteStream};
pub use registry::{PeerConnection, PeerConnectionRegistry};
pub use relay::RelayTransportFactory;

use crate::core::error::TransportError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Which side of the offer/answer exchange a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

/// Lifecycle of a [`PeerConnection`]. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerState {
    New,
    Signaling,
    Connected,
    Closed,
    Failed,
}

impl PeerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Closed | PeerState::Failed)
    }
}

/// Events a transport reports to its owner.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Signaling payload to deliver to the remote peer. `silent` payloads
    /// carry traffic rather than setup and are not logged per frame.
    Signal { payload: Value, silent: bool },
    /// The data channel is open.
    Connected,
    /// One raw frame from the remote peer.
    Data(Vec<u8>),
    /// The remote peer attached a media stream.
    Stream(RemoteStream),
    /// The transport closed normally.
    Closed,
    /// The transport failed.
    Error(String),
}

/// A live data-channel transport to one remote peer.
pub trait PeerTransport: Send + Sync {
    /// Feed a signaling payload received from the remote peer.
    fn signal(&self, payload: Value) -> Result<(), TransportError>;

    /// Queue one frame for delivery.
    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Tear the transport down. Idempotent.
    fn close(&self);
}

/// Creates transports for the registry.
pub trait TransportFactory: Send + Sync {
    /// Build a transport for `peer_id` in `role`, reporting on `events`.
    ///
    /// An initiator starts its offer immediately (emitting `Signal` events);
    /// a responder waits for the first `signal` call.
    fn create(
        &self,
        peer_id: &str,
        role: Role,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;

    /// Whether a signaling payload from a peer with no live connection may
    /// create a responder for it. Payloads refused here are dropped.
    fn opens_connection(&self, _payload: &Value) -> bool {
        true
    }
}
