//! Telephony side of the bridge: the provider's media-stream protocol and the
//! adapter that relays it.

pub mod adapter;
pub mod protocol;

pub use adapter::{await_start, TelephonyAdapter};
pub use protocol::InboundMessage;
