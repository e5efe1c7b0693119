//! Error taxonomy for the transport core.
//!
//! Only [`TransportError`] on the initial signaling connect ever reaches a
//! caller directly. Routing and reassembly errors are logged by the
//! component that detects them and the offending frame is dropped; timer
//! errors are contained per tick.

use thiserror::Error;

/// Socket or channel open/send failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Opening the connection failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The connection is not open.
    #[error("connection not open")]
    NotOpen,

    /// The peer has no live connection in `connected` state.
    #[error("not connected to peer {0}")]
    NotConnected(String),

    /// The underlying send primitive rejected the frame.
    #[error("send failed: {0}")]
    Send(String),

    /// The connection was torn down while the operation was in flight.
    #[error("connection closed")]
    Closed,

    /// The payload could not be serialized for the wire.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The message would need more chunks than a receiver accepts.
    #[error("message too large: {chunks} chunks, limit {limit}")]
    TooLarge { chunks: usize, limit: u32 },
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Serialization(e.to_string())
    }
}

/// A signaling payload that could not be routed to a peer transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalRoutingError {
    /// The frame carried no sender id.
    #[error("signal frame without sender id")]
    MissingSender,

    /// The frame claims to come from this node.
    #[error("signal from own peer id {0}")]
    SelfSignal(String),

    /// The frame carried no payload.
    #[error("signal from {0} without payload")]
    MissingPayload(String),

    /// The target connection is already terminal.
    #[error("peer {0} connection is terminal")]
    TerminalPeer(String),

    /// The peer transport refused the payload.
    #[error("transport for {peer_id} rejected signal: {reason}")]
    Rejected { peer_id: String, reason: String },
}

/// An incoming frame that could not be turned into a whole message.
#[derive(Error, Debug)]
pub enum ReassemblyError {
    /// Reassembled (or direct) payload is not valid JSON.
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A data frame arrived for a chunk id with no live buffer.
    #[error("orphaned chunk frame {chunk_id}#{index}")]
    Orphaned { chunk_id: String, index: u32 },

    /// A data frame index outside `[0, total)`.
    #[error("chunk {chunk_id} index {index} out of range (total {total})")]
    IndexOutOfRange {
        chunk_id: String,
        index: u32,
        total: u32,
    },

    /// A meta frame announced an unusable chunk count.
    #[error("chunk {chunk_id} announces invalid total {total}")]
    InvalidTotal { chunk_id: String, total: u32 },

    /// The peer has too many transfers in flight.
    #[error("peer {peer_id} exceeded {limit} concurrent transfers")]
    TooManyTransfers { peer_id: String, limit: usize },
}

/// A periodic task callback failed during one tick.
#[derive(Error, Debug)]
pub enum TimerTaskError {
    #[error("task {name} failed: {source}")]
    Failed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("task {name} panicked: {message}")]
    Panicked { name: String, message: String },
}

/// Crate-level error wrapping every component error.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    SignalRouting(#[from] SignalRoutingError),

    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),

    #[error(transparent)]
    TimerTask(#[from] TimerTaskError),
}

/// Result type for the transport core.
pub type Result<T> = std::result::Result<T, Error>;

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
