//! # Audio Frames
//!
//! The unit that moves through every queue in the bridge. A frame is created
//! once by the adapter that received it and never mutated afterwards; the
//! payload sits behind an `Arc` so the observer tap can hold a copy without
//! duplicating the bytes.
//!
//! Both telephony directions carry G.711 mu-law at 8 kHz, one companded byte
//! per sample, so that is the only layout a frame holds. Conversions to other
//! rates and encodings happen at the edges (`codec`).

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Sample rate of the telephony leg.
pub const TELEPHONY_SAMPLE_RATE: u32 = 8_000;

/// Sample rate the AI transport uses for linear PCM.
pub const REALTIME_SAMPLE_RATE: u32 = 24_000;

/// One chunk of companded audio with ordering and timing metadata.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    payload: Arc<[u8]>,
    /// Monotonic per direction, assigned by the session.
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
}

impl AudioFrame {
    pub fn mulaw(payload: Vec<u8>, sequence: u64) -> Self {
        Self {
            payload: payload.into(),
            sequence,
            captured_at: Utc::now(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}
