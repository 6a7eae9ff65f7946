//! Realtime AI side of the bridge: wire protocol, WebSocket connector and the
//! adapter that relays a call through it.

pub mod adapter;
pub mod connector;
pub mod protocol;

pub use adapter::{AiAdapter, RealtimeSettings};
pub use connector::{connect_with_retry, RealtimeConnector, RetryPolicy, WsConnector};
pub use protocol::RealtimeAudioFormat;
