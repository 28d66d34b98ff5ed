//! # Audio Relay
//!
//! Duplex forwarding between a client WebSocket and the upstream voice
//! service's per-call WebSocket.
//!
//! ## Module Structure:
//! - `messages`: client/upstream wire formats and their mapping
//! - `pump`: the per-direction forwarding loops
//! - `socket`: the client-facing actix actor

pub mod messages;
pub mod pump;
pub mod socket;

pub use socket::relay_websocket;
