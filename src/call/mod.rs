//! Call sessions: lifecycle state, transcript, registry and the per-call
//! bridge task that wires the two adapters together.

pub mod bridge;
pub mod registry;
pub mod session;
pub mod state;
pub mod transcript;

pub use bridge::{run_call, BridgeContext, BridgeSettings};
pub use registry::{RegistrySummary, SessionRegistry};
pub use session::{AiControl, CallSession, FinalizeEvent, Leg, SessionSettings, TelephonyControl};
pub use state::{CallState, EndReason};
pub use transcript::{Speaker, TranscriptTurn};
