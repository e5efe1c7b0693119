//! Transport core: signaling, peer connection bookkeeping, chunked
//! messaging and the timer service they share.

pub mod config;
pub mod connection;
pub mod error;
pub mod pipeline;
pub mod signaling;
pub mod timer;
