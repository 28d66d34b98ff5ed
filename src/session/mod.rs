//! # Voice Sessions
//!
//! Provisioning of upstream calls and the process-wide session registry.
//!
//! ## Module Structure:
//! - `registry`: session id → session and active connection pair
//! - `upstream`: REST provisioning client and upstream WebSocket connect
//! - `manager`: the session-start operation tying the two together

pub mod manager;
pub mod registry;
pub mod upstream;

pub use manager::{streaming_endpoint, SessionService};
pub use registry::{PairHandle, SessionRegistry, UPSTREAM_QUEUE_CAPACITY};
pub use upstream::{connect_upstream, VapiProvider};
