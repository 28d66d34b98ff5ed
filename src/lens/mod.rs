//! # Snap Lens Integration
//!
//! Backend side of the AR training lens: a WebSocket hub for lens clients,
//! the training-step validator and the AR event messages sent to the voice
//! assistant.
//!
//! ## Module Structure:
//! - `training`: scenarios, steps and progress
//! - `events`: `add-message` / `say` builders and spoken responses
//! - `hub`: client registry and message handling
//! - `socket`: the per-client actix actor

pub mod events;
pub mod hub;
pub mod socket;
pub mod training;

pub use hub::LensHub;
pub use socket::lens_websocket;
