//! # Audio Processing Module
//!
//! Signal-path helpers for the relay.
//!
//! ## Audio Format Requirements (upstream side):
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod capture; // Float capture blocks -> PCM16 @ 16 kHz

pub use capture::{decode_f32_le, encode_pcm16_le, validate_pcm16, CapturePreprocessor};
