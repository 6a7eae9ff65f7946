//! # Realtime AI Wire Format
//!
//! Typed client and server events for the realtime speech service. Events are
//! JSON objects discriminated by `type`.
//!
//! ## Key Rust Concepts Used:
//! - **internally tagged enums**: `#[serde(tag = "type")]` maps the dotted event
//!   names straight onto variants
//! - **aliases**: the service has shipped two spellings for several output
//!   events; `#[serde(alias)]` accepts both
//! - **`#[serde(other)]`**: unknown server events parse as `Other` and are ignored

use crate::audio::{codec, AudioFrame, REALTIME_SAMPLE_RATE};
use crate::error::{BridgeError, BridgeResult};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;

/// Audio encoding negotiated with the AI service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeAudioFormat {
    /// 24 kHz little-endian linear PCM; transcoded on both directions
    Pcm16,
    /// Companded 8 kHz, passed through untouched
    G711Ulaw,
}

impl RealtimeAudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            RealtimeAudioFormat::Pcm16 => "pcm16",
            RealtimeAudioFormat::G711Ulaw => "g711_ulaw",
        }
    }

    /// Base64 payload for `input_audio_buffer.append`.
    pub fn encode_input(&self, frame: &AudioFrame) -> String {
        match self {
            RealtimeAudioFormat::G711Ulaw => B64.encode(frame.payload()),
            RealtimeAudioFormat::Pcm16 => {
                B64.encode(codec::pcm16_to_bytes(&codec::frame_to_linear(frame, REALTIME_SAMPLE_RATE)))
            }
        }
    }

    /// Companded 8 kHz audio from a base64 output delta.
    pub fn decode_output(&self, delta: &str) -> BridgeResult<Vec<u8>> {
        let bytes = B64.decode(delta.as_bytes())?;
        match self {
            RealtimeAudioFormat::G711Ulaw => Ok(bytes),
            RealtimeAudioFormat::Pcm16 => codec::pcm16_bytes_to_mulaw(&bytes, REALTIME_SAMPLE_RATE),
        }
    }
}

impl FromStr for RealtimeAudioFormat {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pcm16" => Ok(RealtimeAudioFormat::Pcm16),
            "g711_ulaw" => Ok(RealtimeAudioFormat::G711Ulaw),
            other => Err(BridgeError::Validation(format!("unsupported AI audio format '{}'", other))),
        }
    }
}

impl fmt::Display for RealtimeAudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioClear,
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<ResponseOptions>,
    },
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientEvent {
    pub fn to_json(&self) -> BridgeResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// A user message asking the assistant to say something, e.g. a greeting.
    pub fn user_text(text: impl Into<String>) -> Self {
        ClientEvent::ConversationItemCreate {
            item: ConversationItem {
                kind: "message",
                role: "user",
                content: vec![ContentPart {
                    kind: "input_text",
                    text: text.into(),
                }],
            },
        }
    }

    pub fn respond() -> Self {
        ClientEvent::ResponseCreate { response: None }
    }

    pub fn respond_with(instructions: impl Into<String>) -> Self {
        ClientEvent::ResponseCreate {
            response: Some(ResponseOptions {
                instructions: instructions.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub modalities: Vec<&'static str>,
    pub instructions: String,
    pub voice: String,
    pub temperature: f32,
    pub input_audio_format: &'static str,
    pub output_audio_format: &'static str,
    pub input_audio_transcription: TranscriptionConfig,
    pub turn_detection: TurnDetection,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionConfig {
    pub model: &'static str,
    pub language: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: serde_json::Value,
}

pub const END_CALL_TOOL: &str = "end_call";

impl ToolDefinition {
    pub fn end_call() -> Self {
        Self {
            kind: "function",
            name: END_CALL_TOOL,
            description: "Politely end the phone call when the caller says goodbye or asks to end the conversation.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "reason": {
                        "type": "string",
                        "description": "Brief reason for ending, e.g. caller said bye."
                    }
                },
                "required": []
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub role: &'static str,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseOptions {
    pub instructions: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseInfo },
    #[serde(rename = "response.audio.delta", alias = "response.output_audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: Option<String>,
        delta: String,
    },
    #[serde(rename = "response.audio.done", alias = "response.output_audio.done")]
    AudioDone,
    #[serde(
        rename = "response.audio_transcript.done",
        alias = "response.output_audio_transcript.done"
    )]
    AudioTranscriptDone { transcript: String },
    #[serde(rename = "response.done")]
    ResponseDone { response: ResponseInfo },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted { transcript: String },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        arguments: String,
    },
    #[serde(rename = "error")]
    Error { error: ErrorDetail },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorDetail {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

pub fn parse(text: &str) -> BridgeResult<ServerEvent> {
    Ok(serde_json::from_str(text)?)
}

/// `reason` argument of an `end_call` invocation, if any.
pub fn end_call_reason(arguments: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(arguments).ok()?;
    value
        .get("reason")
        .and_then(|r| r.as_str())
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
}
