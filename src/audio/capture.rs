//! # Capture Preprocessing
//!
//! Turns blocks of floating-point microphone samples, captured at the device's
//! native rate (commonly 48 kHz), into the 16-bit / 16 kHz / mono PCM the
//! upstream voice service expects.
//!
//! ## Algorithm:
//! Nearest-neighbour decimation. For a block of `K` samples at native rate `R`
//! and target rate `T`:
//! - output length is `floor(K * T / R)`
//! - output sample `i` is input sample `round(i * R / T)` (capped at `K - 1`)
//! - each picked sample is clamped to `[-1.0, 1.0]` and scaled to `i16`
//!
//! There is no anti-aliasing filter; for speech this is an accepted trade-off.
//! Blocks are independent: when `R / T` is not an integer the fractional phase is
//! not carried from one block to the next.

use crate::error::{AppError, AppResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Rate the upstream expects audio in.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Stateless-per-block downsampler from native capture rate to 16 kHz PCM16.
#[derive(Debug, Clone)]
pub struct CapturePreprocessor {
    native_rate: u32,
    target_rate: u32,
    /// Left-over input samples; cleared after every block.
    remainder: Vec<f32>,
}

impl CapturePreprocessor {
    /// Create a preprocessor for the given native capture rate.
    ///
    /// Upsampling is not supported: a native rate below the target is rejected.
    pub fn new(native_rate: u32) -> AppResult<Self> {
        let target_rate = TARGET_SAMPLE_RATE;
        if native_rate < target_rate {
            return Err(AppError::InvalidRequest(format!(
                "native sample rate {} Hz is below the {} Hz target; upsampling is not supported",
                native_rate, target_rate
            )));
        }
        Ok(Self {
            native_rate,
            target_rate,
            remainder: Vec::new(),
        })
    }

    pub fn native_rate(&self) -> u32 {
        self.native_rate
    }

    /// Number of output samples produced for an input block of `input_len` samples.
    pub fn output_len(&self, input_len: usize) -> usize {
        ((input_len as u64 * self.target_rate as u64) / self.native_rate as u64) as usize
    }

    /// Downsample one capture block.
    pub fn process(&mut self, block: &[f32]) -> Vec<i16> {
        let out_len = self.output_len(block.len());
        let native = self.native_rate as u64;
        let target = self.target_rate as u64;

        let mut output = Vec::with_capacity(out_len);
        for i in 0..out_len as u64 {
            // round(i * R / T) in integer arithmetic
            let idx = ((2 * i * native + target) / (2 * target)) as usize;
            let sample = block[idx.min(block.len() - 1)];
            output.push(scale_to_i16(sample));
        }

        self.remainder.clear();
        output
    }
}

/// Clamp to [-1, 1] and scale asymmetrically so both ends of the i16 range are reachable.
fn scale_to_i16(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Serialise PCM16 samples as little-endian bytes.
pub fn encode_pcm16_le(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail.
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}

/// Parse little-endian f32 samples, as produced by `Float32Array` buffers.
pub fn decode_f32_le(bytes: &[u8]) -> AppResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(AppError::InvalidRequest(format!(
            "float32 capture block length {} is not a multiple of 4",
            bytes.len()
        )));
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 4);
    while let Ok(sample) = cursor.read_f32::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Check that a payload can be PCM16: non-empty and an even number of bytes.
pub fn validate_pcm16(data: &[u8]) -> AppResult<()> {
    if data.is_empty() {
        return Err(AppError::InvalidRequest("Audio data is empty".to_string()));
    }
    if data.len() % 2 != 0 {
        return Err(AppError::InvalidRequest(
            "Audio data length must be even for 16-bit samples".to_string(),
        ));
    }
    Ok(())
}
