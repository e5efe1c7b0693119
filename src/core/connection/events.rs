//! App-facing event surface of the registry.
//!
//! Subscribers are plain callbacks. Each one is invoked in isolation: a
//! panicking subscriber is logged and the event still reaches the others.
//! [`EventBus::channel`] adapts the bus to an mpsc receiver for async
//! consumers.

use crate::core::error::panic_message;
use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::error;

/// Opaque handle to a media stream attached by a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub stream_id: String,
    pub kind: String,
}

/// Events republished to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    ConnectionEstablished { peer_id: String },
    ConnectionClosed { peer_id: String },
    ConnectionFailed { peer_id: String, reason: String },
    /// One whole (reassembled if needed) application message.
    DataReceived { peer_id: String, message: Value },
    RemoteStreamReceived { peer_id: String, stream: RemoteStream },
}

impl PeerEvent {
    pub fn peer_id(&self) -> &str {
        match self {
            PeerEvent::ConnectionEstablished { peer_id }
            | PeerEvent::ConnectionClosed { peer_id }
            | PeerEvent::ConnectionFailed { peer_id, .. }
            | PeerEvent::DataReceived { peer_id, .. }
            | PeerEvent::RemoteStreamReceived { peer_id, .. } => peer_id,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            PeerEvent::ConnectionEstablished { .. } => "connection_established",
            PeerEvent::ConnectionClosed { .. } => "connection_closed",
            PeerEvent::ConnectionFailed { .. } => "connection_failed",
            PeerEvent::DataReceived { .. } => "data_received",
            PeerEvent::RemoteStreamReceived { .. } => "remote_stream_received",
        }
    }
}

type Subscriber = Arc<dyn Fn(&PeerEvent) + Send + Sync>;

/// Fan-out of [`PeerEvent`]s to every subscriber.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: impl Fn(&PeerEvent) + Send + Sync + 'static) {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(handler));
    }

    /// Subscribe through an unbounded channel. The subscription stays
    /// registered after the receiver is dropped but sends become no-ops.
    pub fn channel(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    pub fn publish(&self, event: PeerEvent) {
        // Snapshot so a subscriber may subscribe without deadlocking.
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for (idx, subscriber) in subscribers.iter().enumerate() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| subscriber(&event))) {
                error!(
                    event = "subscriber_panicked",
                    subscriber = idx,
                    peer_event = event.name(),
                    peer = event.peer_id(),
                    message = %panic_message(payload.as_ref()),
                    "Event subscriber panicked"
                );
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn panicking_subscriber_is_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(|_| panic!("bad subscriber"));
        let s = seen.clone();
        bus.subscribe(move |e| s.lock().unwrap().push(e.peer_id().to_string()));

        bus.publish(PeerEvent::ConnectionEstablished {
            peer_id: "alice".into(),
        });
        bus.publish(PeerEvent::ConnectionClosed {
            peer_id: "bob".into(),
        });

        assert_eq!(*seen.lock().unwrap(), vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn channel_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.channel();
        bus.publish(PeerEvent::ConnectionFailed {
            peer_id: "carol".into(),
            reason: "ice".into(),
        });
        assert_eq!(
            rx.recv().await,
            Some(PeerEvent::ConnectionFailed {
                peer_id: "carol".into(),
                reason: "ice".into(),
            })
        );
        assert_eq!(bus.subscriber_count(), 1);
    }
}
