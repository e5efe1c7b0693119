//! peerlink: a signaling-assisted peer connection manager with a chunked
//! message protocol for payloads larger than one data-channel frame.

pub mod app;
pub mod core;
pub mod utils;

pub use crate::core::config::TransportConfig;
pub use crate::core::connection::{PeerConnectionRegistry, PeerEvent, Role};
pub use crate::core::error::{Error, Result};
pub use crate::core::pipeline::ChunkTransport;
pub use crate::core::signaling::{SignalingChannel, SignalingEvent};
pub use crate::core::timer::TimerManager;
