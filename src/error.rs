//! # Error Handling
//!
//! One error type for the whole bridge. Per-frame and per-message failures
//! (`Decode`, `Protocol`) are logged and dropped by the adapters; handshake
//! failures become `AiUnavailable` after the retry budget is spent; registry
//! and session-API misuse is returned synchronously to the caller and, when it
//! crosses the HTTP boundary, rendered as a JSON error body.
//!
//! ## Key Rust Concepts Used:
//! - **enum with data**: each variant carries the context needed for a useful message
//! - **Display / Error traits**: implemented by hand so `?` works with `anyhow` at startup
//! - **From trait**: lets `?` convert library errors into `BridgeError` automatically
//! - **ResponseError trait**: converts errors into HTTP responses for actix-web handlers
//!
//! Queue overflow is deliberately absent: it is counted on the queue, never raised.

use crate::call::CallState;
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors raised by the bridge and its HTTP surface.
///
/// ## Error Categories:
/// - **Decode / Protocol**: a single frame or message was malformed (400 when surfaced)
/// - **Connect / AiUnavailable**: the AI transport could not be reached
/// - **DuplicateCallId / NotFound / InvalidStateTransition**: registry or session API misuse
/// - **CapacityReached**: the registry is full
/// - **BadRequest / Validation / Config / Internal**: the usual service-level failures
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// Audio payload could not be decoded (bad base64, odd PCM length, ...)
    Decode(String),

    /// Provider message was not valid JSON or had an unexpected shape
    Protocol(String),

    /// A single connection attempt to the AI transport failed
    Connect(String),

    /// Every connection attempt failed
    AiUnavailable { attempts: u32 },

    /// A session with this call id is already registered
    DuplicateCallId(String),

    /// No session with this call id
    NotFound(String),

    /// The requested operation is not allowed in the session's current state
    InvalidStateTransition {
        call_id: String,
        from: CallState,
        operation: &'static str,
    },

    /// The registry refused a new call because it is at its limit
    CapacityReached(usize),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Input failed validation rules
    Validation(String),

    /// Configuration file or environment variable problems
    Config(String),

    /// Anything else
    Internal(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Decode(msg) => write!(f, "Decode error: {}", msg),
            BridgeError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            BridgeError::Connect(msg) => write!(f, "Connect error: {}", msg),
            BridgeError::AiUnavailable { attempts } => {
                write!(f, "AI transport unavailable after {} attempts", attempts)
            }
            BridgeError::DuplicateCallId(id) => write!(f, "Call '{}' is already registered", id),
            BridgeError::NotFound(id) => write!(f, "Call '{}' not found", id),
            BridgeError::InvalidStateTransition { call_id, from, operation } => {
                write!(f, "Cannot {} call '{}' in state {}", operation, call_id, from)
            }
            BridgeError::CapacityReached(max) => {
                write!(f, "Maximum concurrent calls ({}) reached", max)
            }
            BridgeError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            BridgeError::Validation(msg) => write!(f, "Validation error: {}", msg),
            BridgeError::Config(msg) => write!(f, "Configuration error: {}", msg),
            BridgeError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {}

impl BridgeError {
    /// Machine-readable error type used in JSON bodies and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Decode(_) => "decode_error",
            BridgeError::Protocol(_) => "protocol_error",
            BridgeError::Connect(_) => "connect_error",
            BridgeError::AiUnavailable { .. } => "ai_unavailable",
            BridgeError::DuplicateCallId(_) => "duplicate_call_id",
            BridgeError::NotFound(_) => "not_found",
            BridgeError::InvalidStateTransition { .. } => "invalid_state_transition",
            BridgeError::CapacityReached(_) => "capacity_reached",
            BridgeError::BadRequest(_) => "bad_request",
            BridgeError::Validation(_) => "validation_error",
            BridgeError::Config(_) => "config_error",
            BridgeError::Internal(_) => "internal_error",
        }
    }
}

/// HTTP mapping for the control API.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "invalid_state_transition",
///     "message": "Cannot resume call 'CA123' in state STREAMING",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for BridgeError {
    fn status_code(&self) -> StatusCode {
        match self {
            BridgeError::NotFound(_) => StatusCode::NOT_FOUND,
            BridgeError::DuplicateCallId(_) | BridgeError::InvalidStateTransition { .. } => {
                StatusCode::CONFLICT
            }
            BridgeError::AiUnavailable { .. } | BridgeError::CapacityReached(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            BridgeError::Decode(_)
            | BridgeError::Protocol(_)
            | BridgeError::BadRequest(_)
            | BridgeError::Validation(_) => StatusCode::BAD_REQUEST,
            BridgeError::Connect(_) | BridgeError::Config(_) | BridgeError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for BridgeError {
    fn from(err: anyhow::Error) -> Self {
        BridgeError::Internal(err.to_string())
    }
}

/// JSON errors are almost always caused by the peer, so they are treated as
/// protocol errors rather than internal failures.
impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Protocol(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for BridgeError {
    fn from(err: config::ConfigError) -> Self {
        BridgeError::Config(err.to_string())
    }
}

impl From<base64::DecodeError> for BridgeError {
    fn from(err: base64::DecodeError) -> Self {
        BridgeError::Decode(format!("invalid base64 payload: {}", err))
    }
}

/// Shorthand for `Result<T, BridgeError>`.
pub type BridgeResult<T> = Result<T, BridgeError>;
