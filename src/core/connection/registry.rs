//! One live transport per remote peer.
//!
//! The registry owns every [`PeerConnection`]. Each connection gets a pump
//! task draining its transport's event channel; the pump drops events as
//! soon as its connection is no longer the registered one for that peer, so
//! a closed or replaced transport can never publish anything.
//!
//! Teardown removes the registry entry first. Removal is the single gate
//! for `connection_closed` / `connection_failed`, which is what makes those
//! events fire exactly once per connection.

use super::events::{EventBus, PeerEvent};
use super::{PeerState, PeerTransport, Role, TransportEvent, TransportFactory};
use crate::core::error::{SignalRoutingError, TransportError};
use crate::core::pipeline::ChunkTransport;
use crate::core::signaling::frame::FRAME_SIGNAL;
use crate::core::signaling::{SignalEnvelope, SignalFrame, SignalSink, SignalingEvent};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// A transport to one remote peer plus its lifecycle state.
pub struct PeerConnection {
    peer_id: String,
    serial: u64,
    role: Role,
    transport: Arc<dyn PeerTransport>,
    state: Mutex<PeerState>,
}

impl PeerConnection {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_live(&self) -> bool {
        !self.state().is_terminal()
    }

    pub fn transport(&self) -> Arc<dyn PeerTransport> {
        self.transport.clone()
    }

    /// Move forward to `next`. Returns `false` if that would go backwards,
    /// repeat the current state, or leave a terminal state.
    fn advance(&self, next: PeerState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_terminal() || next <= *state {
            return false;
        }
        *state = next;
        true
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_id", &self.peer_id)
            .field("serial", &self.serial)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

struct Inner {
    local_id: String,
    factory: Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalSink>,
    chunks: ChunkTransport,
    bus: EventBus,
    peers: Mutex<HashMap<String, Arc<PeerConnection>>>,
    next_serial: AtomicU64,
}

/// Tracks peer connections, relays their signaling and republishes their
/// events on an [`EventBus`]. Clones share state.
#[derive(Clone)]
pub struct PeerConnectionRegistry {
    inner: Arc<Inner>,
}

impl PeerConnectionRegistry {
    pub fn new(
        local_id: impl Into<String>,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalSink>,
        chunks: ChunkTransport,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                local_id: local_id.into(),
                factory,
                signaling,
                chunks,
                bus: EventBus::new(),
                peers: Mutex::new(HashMap::new()),
                next_serial: AtomicU64::new(1),
            }),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    /// Application event surface.
    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn chunks(&self) -> &ChunkTransport {
        &self.inner.chunks
    }

    /// Return the live connection to `peer_id`, creating one in `role` if
    /// there is none. Must be called from within a tokio runtime.
    pub fn get_connection(&self, peer_id: &str, role: Role) -> Result<Arc<PeerConnection>, TransportError> {
        if peer_id.is_empty() || peer_id == self.inner.local_id {
            return Err(TransportError::Connect(format!("invalid peer id {peer_id:?}")));
        }

        let mut peers = self.inner.peers();
        if let Some(existing) = peers.get(peer_id) {
            if existing.is_live() {
                return Ok(existing.clone());
            }
        }

        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = self.inner.factory.create(peer_id, role, tx)?;
        let conn = Arc::new(PeerConnection {
            peer_id: peer_id.to_string(),
            serial,
            role,
            transport,
            state: Mutex::new(PeerState::New),
        });
        peers.insert(peer_id.to_string(), conn.clone());
        drop(peers);

        tokio::spawn(pump(
            Arc::downgrade(&self.inner),
            peer_id.to_string(),
            serial,
            rx,
        ));

        info!(
            event = "peer_connection_created",
            peer = peer_id,
            role = ?role,
            serial,
            "Peer connection created"
        );
        Ok(conn)
    }

    /// The registered connection for `peer_id`, if any.
    pub fn connection(&self, peer_id: &str) -> Option<Arc<PeerConnection>> {
        self.inner.peers().get(peer_id).cloned()
    }

    /// Feed a signaling payload from `from_id`, creating a responder
    /// connection first if none exists and the factory accepts the payload
    /// as an opener. Anything else from an unknown peer is dropped.
    pub fn handle_signal(&self, from_id: &str, payload: Value) -> Result<(), SignalRoutingError> {
        if from_id.is_empty() {
            return Err(SignalRoutingError::MissingSender);
        }
        if from_id == self.inner.local_id {
            return Err(SignalRoutingError::SelfSignal(from_id.to_string()));
        }

        let live = self.connection(from_id).is_some_and(|c| c.is_live());
        if !live && !self.inner.factory.opens_connection(&payload) {
            debug!(
                event = "signal_without_connection",
                peer = from_id,
                "Dropping signal for a connection that does not exist"
            );
            return Ok(());
        }

        let conn = self
            .get_connection(from_id, Role::Responder)
            .map_err(|e| SignalRoutingError::Rejected {
                peer_id: from_id.to_string(),
                reason: e.to_string(),
            })?;
        if !conn.is_live() {
            return Err(SignalRoutingError::TerminalPeer(from_id.to_string()));
        }
        conn.advance(PeerState::Signaling);

        conn.transport
            .signal(payload)
            .map_err(|e| SignalRoutingError::Rejected {
                peer_id: from_id.to_string(),
                reason: e.to_string(),
            })
    }

    /// Route a `SIGNAL` frame from the rendezvous server. Other frame types
    /// and frames addressed to another node are ignored. Routing errors are
    /// logged and returned; the frame is dropped either way.
    pub fn handle_signal_frame(&self, frame: &SignalFrame) -> Result<(), SignalRoutingError> {
        if !frame.is(FRAME_SIGNAL) {
            return Ok(());
        }
        if let Some(to) = frame.to_id.as_deref() {
            if to != self.inner.local_id {
                debug!(event = "signal_misaddressed", to, "Signal addressed to another node ignored");
                return Ok(());
            }
        }

        let result = match (frame.from_id.as_deref(), frame.payload.clone()) {
            (None, _) => Err(SignalRoutingError::MissingSender),
            (Some(from), None) => Err(SignalRoutingError::MissingPayload(from.to_string())),
            (Some(from), Some(payload)) => {
                if !frame.is_silent {
                    debug!(event = "signal_in", from, "Signal received");
                }
                self.handle_signal(from, payload)
            }
        };

        if let Err(e) = &result {
            warn!(
                event = "signal_routing_failed",
                from = frame.from_id.as_deref().unwrap_or("-"),
                error = %e,
                "Dropping signal frame"
            );
        }
        result
    }

    /// Consume one event from the signaling channel.
    pub fn handle_signaling_event(&self, event: &SignalingEvent) {
        match event {
            SignalingEvent::Message(frame) if frame.is(FRAME_SIGNAL) => {
                let _ = self.handle_signal_frame(frame);
            }
            SignalingEvent::Message(frame) => {
                debug!(event = "signaling_frame_ignored", kind = %frame.kind, "Non-signal frame");
            }
            SignalingEvent::StatusChanged(open) => {
                debug!(
                    event = "signaling_status",
                    open,
                    peers = self.inner.peers().len(),
                    "Signaling status changed; peer links unaffected"
                );
            }
            SignalingEvent::ReconnectFailed { .. } => {}
        }
    }

    /// Send one application message to a connected peer, chunking it if
    /// it is larger than the configured chunk size.
    pub async fn send(&self, peer_id: &str, message: &Value) -> Result<(), TransportError> {
        let transport = match self.connection(peer_id) {
            Some(conn) if conn.state() == PeerState::Connected => conn.transport(),
            _ => return Err(TransportError::NotConnected(peer_id.to_string())),
        };

        let result = self.inner.chunks.send(peer_id, transport, message).await;
        if let Err(e) = &result {
            warn!(event = "peer_send_failed", peer = peer_id, error = %e, "Send to peer failed");
        }
        result
    }

    /// Tear down the connection to `peer_id`. Returns `false` if there was none.
    pub fn close_connection(&self, peer_id: &str) -> bool {
        match self.connection(peer_id) {
            Some(conn) => self.inner.teardown(&conn, None),
            None => false,
        }
    }

    /// Tear down every connection. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let conns: Vec<Arc<PeerConnection>> = self.inner.peers().values().cloned().collect();
        conns
            .iter()
            .filter(|conn| self.inner.teardown(conn, None))
            .count()
    }

    pub fn is_connected_to(&self, peer_id: &str) -> bool {
        self.inner
            .peers()
            .get(peer_id)
            .is_some_and(|c| c.state() == PeerState::Connected)
    }

    /// Ids of all peers in `connected` state, sorted.
    pub fn connected_peers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .peers()
            .values()
            .filter(|c| c.state() == PeerState::Connected)
            .map(|c| c.peer_id.clone())
            .collect();
        ids.sort();
        ids
    }
}

impl Inner {
    fn peers(&self) -> MutexGuard<'_, HashMap<String, Arc<PeerConnection>>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current(&self, peer_id: &str, serial: u64) -> Option<Arc<PeerConnection>> {
        self.peers()
            .get(peer_id)
            .filter(|c| c.serial == serial)
            .cloned()
    }

    fn on_transport_event(&self, conn: &Arc<PeerConnection>, event: TransportEvent) {
        let peer_id = conn.peer_id.as_str();
        match event {
            TransportEvent::Signal { payload, silent } => {
                conn.advance(PeerState::Signaling);
                let envelope = SignalEnvelope {
                    from_id: self.local_id.clone(),
                    to_id: peer_id.to_string(),
                    payload,
                    is_silent: silent,
                };
                if !self.signaling.send_signal(envelope) {
                    warn!(
                        event = "signal_relay_failed",
                        peer = peer_id,
                        silent,
                        "Signaling channel not open, signal dropped"
                    );
                }
            }
            TransportEvent::Connected => {
                if conn.advance(PeerState::Connected) {
                    info!(event = "peer_connected", peer = peer_id, "Peer connected");
                    self.bus.publish(PeerEvent::ConnectionEstablished {
                        peer_id: peer_id.to_string(),
                    });
                }
            }
            TransportEvent::Data(bytes) => match self.chunks.receive(peer_id, &bytes) {
                Ok(Some(message)) => self.bus.publish(PeerEvent::DataReceived {
                    peer_id: peer_id.to_string(),
                    message,
                }),
                Ok(None) => {}
                Err(e) => warn!(
                    event = "peer_frame_dropped",
                    peer = peer_id,
                    bytes = bytes.len(),
                    error = %e,
                    "Dropping frame from peer"
                ),
            },
            TransportEvent::Stream(stream) => {
                debug!(event = "peer_stream", peer = peer_id, stream_id = %stream.stream_id, "Remote stream");
                self.bus.publish(PeerEvent::RemoteStreamReceived {
                    peer_id: peer_id.to_string(),
                    stream,
                });
            }
            TransportEvent::Closed => {
                self.teardown(conn, None);
            }
            TransportEvent::Error(reason) => {
                self.teardown(conn, Some(reason));
            }
        }
    }

    /// Remove `conn` if it is still the registered connection for its peer,
    /// then close its transport, purge chunk state and publish the outcome.
    fn teardown(&self, conn: &Arc<PeerConnection>, failure: Option<String>) -> bool {
        {
            let mut peers = self.peers();
            match peers.get(&conn.peer_id) {
                Some(current) if current.serial == conn.serial => {
                    peers.remove(&conn.peer_id);
                }
                _ => return false,
            }
        }

        let peer_id = conn.peer_id.clone();
        conn.advance(if failure.is_some() {
            PeerState::Failed
        } else {
            PeerState::Closed
        });
        conn.transport.close();
        self.chunks.purge_peer(&peer_id);

        match failure {
            Some(reason) => {
                warn!(event = "peer_failed", peer = %peer_id, reason = %reason, "Peer connection failed");
                self.bus.publish(PeerEvent::ConnectionFailed { peer_id, reason });
            }
            None => {
                info!(event = "peer_closed", peer = %peer_id, "Peer connection closed");
                self.bus.publish(PeerEvent::ConnectionClosed { peer_id });
            }
        }
        true
    }
}

/// Drain one transport's events until it is no longer the registered
/// connection for `peer_id`.
async fn pump(
    inner: Weak<Inner>,
    peer_id: String,
    serial: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let Some(conn) = inner.current(&peer_id, serial) else {
            trace!(event = "stale_transport_event", peer = %peer_id, serial, "Dropping event");
            return;
        };
        inner.on_transport_event(&conn, event);
    }

    // Transport dropped its sender while still registered.
    if let Some(inner) = inner.upgrade() {
        if let Some(conn) = inner.current(&peer_id, serial) {
            inner.teardown(&conn, None);
        }
    }
}
