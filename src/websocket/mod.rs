//! # WebSocket Endpoints
//!
//! Three kinds of long-lived connection, each handled by an actix actor:
//! - `/media-stream`: the telephony provider's bidirectional media stream
//! - `/dashboard-stream`: read-only observer feed for a live call
//! - `/human-audio/{call_id}`: a human operator talking to the caller
//!
//! ## Key Rust Concepts Used:
//! - **Actors**: each connection is an `Actor` with a `WebsocketContext`
//! - **StreamHandler**: inbound socket frames and outbound channel items both
//!   arrive as streams; when the outbound stream ends the socket is closed
//! - **run_interval**: heartbeat pings and idle-client detection

use std::time::Duration;

pub mod media;
pub mod observer;
pub mod operator;

pub use media::media_stream;
pub use observer::dashboard_stream;
pub use operator::human_audio;

/// How often the server pings a connected client
pub(crate) const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Silence after which a client is considered gone
pub(crate) const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);
