//! Persistent WebSocket control connection to the rendezvous server.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──ok──► Open
//!      ▲                          │                │ unexpected close
//!      │                        error              ▼
//!      │                          ▼          Closed / Error
//!      └── disconnect() / budget exhausted ◄── (backoff) ──► Connecting …
//! ```
//!
//! Each successful open gets a fresh session serial. The reader task, the
//! heartbeat tick and pending reconnect timers all carry the serial they
//! were created for and do nothing once it is stale, so a torn-down socket
//! can never mutate the channel.
//!
//! Only the caller-driven [`SignalingChannel::connect`] reports failure
//! directly. Failures of automatic reconnect attempts feed back into the
//! backoff schedule until it is exhausted, at which point a single
//! [`SignalingEvent::ReconnectFailed`] is emitted.

pub mod frame;

pub use frame::{SignalEnvelope, SignalFrame};

use crate::core::config::{
    HEARTBEAT_TASK, ReconnectPolicy, SIGNALING_CONNECT_TIMEOUT, TransportConfig,
};
use crate::core::error::TransportError;
use crate::core::timer::TimerManager;
use frame::{FRAME_PING, FRAME_PONG};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Anything that can carry a signaling envelope to a remote peer.
pub trait SignalSink: Send + Sync {
    /// Queue `envelope` for delivery. `false` if the channel is not open.
    fn send_signal(&self, envelope: SignalEnvelope) -> bool;
}

/// Connection state of the signaling channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    Closed,
    Error,
}

/// Events emitted by the signaling channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Open (`true`) or lost (`false`). Never repeats the same value twice in a row.
    StatusChanged(bool),
    /// Any frame other than `PING`/`PONG`.
    Message(SignalFrame),
    /// Reconnect budget exhausted; the channel stays down.
    ReconnectFailed { attempts: u32 },
}

struct Shared {
    state: ChannelState,
    session: u64,
    attempts: u32,
    announced_open: bool,
    manual_close: bool,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    reader: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

struct Inner {
    url: String,
    local_id: String,
    heartbeat_task: String,
    policy: ReconnectPolicy,
    heartbeat_interval: Duration,
    timers: TimerManager,
    events: mpsc::UnboundedSender<SignalingEvent>,
    shared: Mutex<Shared>,
}

/// Client side of the rendezvous connection. Clones share one socket.
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<Inner>,
}

impl SignalingChannel {
    /// Create a disconnected channel. Events are delivered on the returned receiver.
    pub fn new(
        url: impl Into<String>,
        local_id: impl Into<String>,
        config: &TransportConfig,
        timers: TimerManager,
    ) -> (Self, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (url, local_id) = (url.into(), local_id.into());
        let inner = Arc::new(Inner {
            heartbeat_task: format!("{HEARTBEAT_TASK}:{local_id}@{url}"),
            url,
            local_id,
            policy: config.reconnect.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            timers,
            events,
            shared: Mutex::new(Shared {
                state: ChannelState::Disconnected,
                session: 0,
                attempts: 0,
                announced_open: false,
                manual_close: false,
                outbound: None,
                reader: None,
                reconnect: None,
            }),
        });
        (Self { inner }, rx)
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    /// Timer task name of this channel's heartbeat.
    pub fn heartbeat_task(&self) -> &str {
        &self.inner.heartbeat_task
    }

    /// Open the connection. A no-op if it is already open or opening.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] if this attempt fails, or
    /// [`TransportError::Closed`] if [`disconnect`](Self::disconnect) was
    /// called while the handshake was in flight.
    pub async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut s = self.inner.lock();
            if matches!(s.state, ChannelState::Open | ChannelState::Connecting) {
                return Ok(());
            }
            s.manual_close = false;
            s.state = ChannelState::Connecting;
            if let Some(pending) = s.reconnect.take() {
                pending.abort();
            }
        }

        info!(event = "signaling_connecting", url = %self.inner.url, "Connecting to signaling server");
        match Inner::open(&self.inner).await {
            Ok(()) => Ok(()),
            Err(e) => {
                {
                    let mut s = self.inner.lock();
                    if s.state == ChannelState::Connecting {
                        s.state = ChannelState::Error;
                    }
                }
                warn!(
                    event = "signaling_connect_failed",
                    url = %self.inner.url,
                    error = %e,
                    "Initial signaling connect failed"
                );
                Err(e)
            }
        }
    }

    /// Close the connection and suppress automatic reconnects.
    pub fn disconnect(&self) {
        let (was_open, outbound, reader, reconnect) = {
            let mut s = self.inner.lock();
            s.manual_close = true;
            s.session += 1;
            s.state = ChannelState::Disconnected;
            s.attempts = 0;
            let was_open = std::mem::take(&mut s.announced_open);
            if was_open {
                let _ = self.inner.events.send(SignalingEvent::StatusChanged(false));
            }
            (was_open, s.outbound.take(), s.reader.take(), s.reconnect.take())
        };

        self.inner.timers.remove_periodic_task(&self.inner.heartbeat_task);
        if let Some(task) = reconnect {
            task.abort();
        }
        if let Some(task) = reader {
            task.abort();
        }
        if let Some(tx) = outbound {
            let _ = tx.send(Message::Close(None));
        }
        info!(event = "signaling_disconnected", was_open, "Signaling channel disconnected");
    }

    /// Serialize and queue `frame`. `false` if the channel is not open.
    pub fn send_raw(&self, frame: &SignalFrame) -> bool {
        self.inner.send_frame(frame)
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Reconnect attempts made since the channel was last open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().attempts
    }
}

impl SignalSink for SignalingChannel {
    fn send_signal(&self, envelope: SignalEnvelope) -> bool {
        if !envelope.is_silent {
            debug!(
                event = "signal_out",
                to = %envelope.to_id,
                "Relaying signal to peer"
            );
        }
        self.send_raw(&envelope.into())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_live(&self, session: u64) -> bool {
        let s = self.lock();
        s.session == session && s.state == ChannelState::Open && !s.manual_close
    }

    fn send_frame(&self, frame: &SignalFrame) -> bool {
        let text = match frame.to_text() {
            Ok(t) => t,
            Err(e) => {
                warn!(event = "signaling_encode_failed", error = %e, "Failed to encode signaling frame");
                return false;
            }
        };
        let s = self.lock();
        match (&s.state, &s.outbound) {
            (ChannelState::Open, Some(tx)) => tx.send(Message::Text(text)).is_ok(),
            _ => false,
        }
    }

    /// Perform the WebSocket handshake and, if the channel still wants it,
    /// install the new session.
    async fn open(self: &Arc<Self>) -> Result<(), TransportError> {
        let (ws, _response) = tokio::time::timeout(SIGNALING_CONNECT_TIMEOUT, connect_async(self.url.as_str()))
            .await
            .map_err(|_| TransportError::Connect("handshake timed out".into()))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();

        let session = {
            let mut s = self.lock();
            if s.manual_close || s.state != ChannelState::Connecting {
                return Err(TransportError::Closed);
            }
            s.session += 1;
            s.state = ChannelState::Open;
            s.attempts = 0;
            s.outbound = Some(tx.clone());
            if !s.announced_open {
                s.announced_open = true;
                let _ = self.events.send(SignalingEvent::StatusChanged(true));
            }

            let session = s.session;
            tokio::spawn(write_loop(sink, rx));
            s.reader = Some(tokio::spawn(read_loop(
                Arc::downgrade(self),
                session,
                stream,
                tx.clone(),
            )));
            session
        };

        if let Ok(text) = SignalFrame::register(&self.local_id).to_text() {
            let _ = tx.send(Message::Text(text));
        }
        if self.is_live(session) {
            self.start_heartbeat(session);
        }

        info!(
            event = "signaling_open",
            url = %self.url,
            session,
            "Signaling channel open"
        );
        Ok(())
    }

    fn start_heartbeat(self: &Arc<Self>, session: u64) {
        let weak = Arc::downgrade(self);
        self.timers.add_periodic_task(
            &self.heartbeat_task,
            Arc::new(move || {
                let Some(inner) = weak.upgrade() else {
                    return Ok(());
                };
                if !inner.is_live(session) {
                    return Ok(());
                }
                if !inner.send_frame(&SignalFrame::ping()) {
                    anyhow::bail!("heartbeat PING not queued");
                }
                trace!(event = "heartbeat_sent", session, "PING");
                Ok(())
            }),
            self.heartbeat_interval,
            false,
        );
    }

    fn on_text(&self, text: &str, replies: &mpsc::UnboundedSender<Message>) {
        let frame = match SignalFrame::from_text(text) {
            Ok(f) => f,
            Err(e) => {
                warn!(event = "signaling_frame_malformed", error = %e, "Dropping malformed signaling frame");
                return;
            }
        };

        if frame.is(FRAME_PONG) {
            trace!(event = "heartbeat_pong", "PONG");
            return;
        }
        if frame.is(FRAME_PING) {
            if let Ok(pong) = SignalFrame::pong().to_text() {
                let _ = replies.send(Message::Text(pong));
            }
            return;
        }
        let _ = self.events.send(SignalingEvent::Message(frame));
    }

    /// The socket of `session` went away without `disconnect()`.
    fn on_unexpected_close(self: &Arc<Self>, session: u64, next: ChannelState, reason: &str) {
        {
            let mut s = self.lock();
            if s.session != session || s.manual_close || s.state != ChannelState::Open {
                return;
            }
            s.state = next;
            s.outbound = None;
            s.reader = None;
            if std::mem::take(&mut s.announced_open) {
                let _ = self.events.send(SignalingEvent::StatusChanged(false));
            }
        }
        self.timers.remove_periodic_task(&self.heartbeat_task);
        warn!(
            event = "signaling_lost",
            session,
            reason,
            "Signaling connection lost"
        );
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut s = self.lock();
        if s.manual_close {
            return;
        }
        s.attempts += 1;
        let attempt = s.attempts;

        let Some(delay) = self.policy.delay_for(attempt) else {
            s.state = ChannelState::Disconnected;
            let attempts = attempt - 1;
            let _ = self.events.send(SignalingEvent::ReconnectFailed { attempts });
            drop(s);
            error!(
                event = "signaling_reconnect_exhausted",
                attempts,
                "Giving up on signaling reconnect"
            );
            return;
        };

        info!(
            event = "signaling_reconnect_scheduled",
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling signaling reconnect"
        );
        let session = s.session;
        let weak = Arc::downgrade(self);
        s.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.attempt_reconnect(session, attempt).await;
            }
        }));
    }

    async fn attempt_reconnect(self: &Arc<Self>, session: u64, attempt: u32) {
        {
            let mut s = self.lock();
            if s.manual_close
                || s.session != session
                || matches!(s.state, ChannelState::Open | ChannelState::Connecting)
            {
                return;
            }
            s.state = ChannelState::Connecting;
            s.reconnect = None;
        }

        info!(event = "signaling_reconnecting", attempt, "Reconnecting to signaling server");
        if let Err(e) = self.open().await {
            {
                let mut s = self.lock();
                if s.state != ChannelState::Connecting {
                    return;
                }
                s.state = ChannelState::Error;
            }
            warn!(
                event = "signaling_reconnect_failed",
                attempt,
                error = %e,
                "Signaling reconnect attempt failed"
            );
            self.schedule_reconnect();
        }
    }
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            debug!(event = "signaling_write_failed", error = %e, "Signaling write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    inner: Weak<Inner>,
    session: u64,
    mut stream: SplitStream<WsStream>,
    replies: mpsc::UnboundedSender<Message>,
) {
    let (next, reason) = loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(event = "signaling_binary_dropped", "Dropping non-UTF-8 signaling frame");
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                break (ChannelState::Closed, format!("closed by server: {frame:?}"));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break (ChannelState::Error, e.to_string()),
            None => break (ChannelState::Closed, "stream ended".to_string()),
        };

        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.is_live(session) {
            return;
        }
        inner.on_text(&text, &replies);
    };

    if let Some(inner) = inner.upgrade() {
        inner.on_unexpected_close(session, next, &reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, String) {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", l.local_addr().unwrap());
        (l, url)
    }

    async fn accept(l: &TcpListener) -> WebSocketStream<TcpStream> {
        let (s, _) = l.accept().await.unwrap();
        tokio_tungstenite::accept_async(s).await.unwrap()
    }

    async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> SignalFrame {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(t) => return SignalFrame::from_text(&t).unwrap(),
                _ => continue,
            }
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    fn config(heartbeat_ms: u64, max_attempts: u32) -> TransportConfig {
        TransportConfig {
            heartbeat_interval_ms: heartbeat_ms,
            reconnect: ReconnectPolicy {
                max_attempts,
                initial_delay_ms: 20,
                backoff_factor: 2.0,
                max_delay_ms: 100,
            },
            ..TransportConfig::default()
        }
    }

    #[tokio::test]
    async fn initial_connect_failure_is_reported() {
        let (l, url) = listener().await;
        drop(l);
        let (channel, mut rx) = SignalingChannel::new(url, "me", &config(1000, 3), TimerManager::new());

        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
        assert_eq!(channel.state(), ChannelState::Error);
        assert!(!channel.send_raw(&SignalFrame::ping()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn open_registers_heartbeats_and_filters_pong() {
        let (l, url) = listener().await;
        let timers = TimerManager::new();
        let (channel, mut rx) = SignalingChannel::new(url, "me", &config(50, 3), timers.clone());

        let server = tokio::spawn(async move {
            let mut ws = accept(&l).await;
            let register = next_text(&mut ws).await;
            assert!(register.is(frame::FRAME_REGISTER));
            assert_eq!(register.from_id.as_deref(), Some("me"));

            ws.send(Message::Text(r#"{"type":"PONG"}"#.into())).await.unwrap();
            ws.send(Message::Text(
                json!({"type": "SIGNAL", "fromId": "bob", "toId": "me", "payload": {"sdp": "x"}})
                    .to_string(),
            ))
            .await
            .unwrap();

            let ping = next_text(&mut ws).await;
            assert!(ping.is(FRAME_PING));
            ws
        });

        channel.connect().await.unwrap();
        channel.connect().await.unwrap();
        assert!(channel.is_open());
        assert!(timers.is_running(channel.heartbeat_task()));

        assert_eq!(next_event(&mut rx).await, SignalingEvent::StatusChanged(true));
        match next_event(&mut rx).await {
            SignalingEvent::Message(frame) => {
                assert!(frame.is(frame::FRAME_SIGNAL));
                assert_eq!(frame.from_id.as_deref(), Some("bob"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        let _ws = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();

        channel.disconnect();
        assert_eq!(next_event(&mut rx).await, SignalingEvent::StatusChanged(false));
        assert!(!timers.is_running(channel.heartbeat_task()));
    }

    #[tokio::test]
    async fn disconnect_announces_once_and_never_reconnects() {
        let (l, url) = listener().await;
        let (channel, mut rx) = SignalingChannel::new(url, "me", &config(1000, 3), TimerManager::new());

        let server = tokio::spawn(async move {
            let mut ws = accept(&l).await;
            // Drain until the client closes.
            while let Some(Ok(msg)) = ws.next().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
            }
            l
        });

        channel.connect().await.unwrap();
        assert_eq!(next_event(&mut rx).await, SignalingEvent::StatusChanged(true));

        channel.disconnect();
        channel.disconnect();
        assert_eq!(next_event(&mut rx).await, SignalingEvent::StatusChanged(false));
        assert_eq!(channel.state(), ChannelState::Disconnected);

        let l = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        // No reconnect attempt reaches the server.
        assert!(
            tokio::time::timeout(Duration::from_millis(300), l.accept())
                .await
                .is_err()
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unexpected_close_reconnects_and_resets_attempts() {
        let (l, url) = listener().await;
        let (channel, mut rx) = SignalingChannel::new(url, "me", &config(1000, 3), TimerManager::new());

        let server = tokio::spawn(async move {
            let ws = accept(&l).await;
            drop(ws);
            let mut second = accept(&l).await;
            let register = next_text(&mut second).await;
            assert!(register.is(frame::FRAME_REGISTER));
            second
        });

        channel.connect().await.unwrap();
        assert_eq!(next_event(&mut rx).await, SignalingEvent::StatusChanged(true));
        assert_eq!(next_event(&mut rx).await, SignalingEvent::StatusChanged(false));
        assert_eq!(next_event(&mut rx).await, SignalingEvent::StatusChanged(true));

        let _second = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(channel.is_open());
        assert_eq!(channel.reconnect_attempts(), 0);
        channel.disconnect();
    }

    #[tokio::test]
    async fn exhausted_budget_emits_single_terminal_event() {
        let (l, url) = listener().await;
        let (channel, mut rx) = SignalingChannel::new(url, "me", &config(1000, 2), TimerManager::new());

        let server = tokio::spawn(async move {
            let ws = accept(&l).await;
            drop(l);
            drop(ws);
        });

        channel.connect().await.unwrap();
        assert_eq!(next_event(&mut rx).await, SignalingEvent::StatusChanged(true));
        server.await.unwrap();

        assert_eq!(next_event(&mut rx).await, SignalingEvent::StatusChanged(false));
        assert_eq!(
            next_event(&mut rx).await,
            SignalingEvent::ReconnectFailed { attempts: 2 }
        );
        assert_eq!(channel.state(), ChannelState::Disconnected);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn server_ping_is_answered_and_not_forwarded() {
        let (l, url) = listener().await;
        let (channel, mut rx) = SignalingChannel::new(url, "me", &config(60_000, 3), TimerManager::new());

        let server = tokio::spawn(async move {
            let mut ws = accept(&l).await;
            assert!(next_text(&mut ws).await.is(frame::FRAME_REGISTER));

            ws.send(Message::Text(r#"{"type":"PING"}"#.into())).await.unwrap();
            let reply = next_text(&mut ws).await;
            assert!(reply.is(FRAME_PONG));

            ws.send(Message::Text(
                json!({"type": "SIGNAL", "fromId": "bob", "toId": "me", "payload": {}}).to_string(),
            ))
            .await
            .unwrap();
            ws
        });

        channel.connect().await.unwrap();
        assert_eq!(next_event(&mut rx).await, SignalingEvent::StatusChanged(true));
        match next_event(&mut rx).await {
            SignalingEvent::Message(frame) => assert!(frame.is(frame::FRAME_SIGNAL)),
            other => panic!("unexpected event {other:?}"),
        }

        let _ws = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(rx.try_recv().is_err());
        channel.disconnect();
    }

    #[tokio::test]
    async fn channels_sharing_timers_keep_separate_heartbeats() {
        let (l, url) = listener().await;
        let timers = TimerManager::new();
        let (a, mut a_rx) = SignalingChannel::new(url.clone(), "alice", &config(1000, 3), timers.clone());
        let (b, mut b_rx) = SignalingChannel::new(url, "bob", &config(1000, 3), timers.clone());
        assert_ne!(a.heartbeat_task(), b.heartbeat_task());

        let server = tokio::spawn(async move {
            let first = accept(&l).await;
            let second = accept(&l).await;
            (l, first, second)
        });

        a.connect().await.unwrap();
        b.connect().await.unwrap();
        let _sockets = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next_event(&mut a_rx).await, SignalingEvent::StatusChanged(true));
        assert_eq!(next_event(&mut b_rx).await, SignalingEvent::StatusChanged(true));
        assert_eq!(timers.task_count(), 2);

        a.disconnect();
        assert_eq!(next_event(&mut a_rx).await, SignalingEvent::StatusChanged(false));
        assert!(!timers.is_running(a.heartbeat_task()));
        assert!(timers.is_running(b.heartbeat_task()));
        assert!(b.is_open());
        assert!(b_rx.try_recv().is_err());

        b.disconnect();
        assert!(!timers.is_running(b.heartbeat_task()));
    }
}
