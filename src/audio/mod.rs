//! # Audio Module
//!
//! Frame representation, codec conversions and the bounded queues that carry
//! frames between the telephony and AI legs of a call.
//!
//! ## Audio Formats:
//! - **Telephony leg**: G.711 mu-law, 8 kHz, mono, one byte per sample
//! - **AI leg**: linear PCM16 little-endian at 24 kHz (or mu-law pass-through)
//! - **Dashboards**: linear PCM16 at whatever rate the subscriber asked for

pub mod codec; // mu-law <-> linear, resampling, PCM16 framing
pub mod frame; // AudioFrame and sample rates
pub mod queue; // drop-oldest bounded queue

pub use frame::{AudioFrame, REALTIME_SAMPLE_RATE, TELEPHONY_SAMPLE_RATE};
pub use queue::{BoundedQueue, FrameQueue, QueueStats};
