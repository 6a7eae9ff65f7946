//! # Media Stream Wire Format
//!
//! JSON messages exchanged with the telephony provider over the media-stream
//! WebSocket. Every message carries an `event` discriminator; audio payloads
//! are base64 companded 8 kHz mono.
//!
//! ## Inbound:
//! `connected`, `start`, `media`, `mark`, `dtmf`, `stop`. Anything else parses
//! as `Unknown` and is ignored.
//!
//! ## Outbound:
//! `media` (audio for the caller) and `clear` (drop buffered playback).

use crate::error::{BridgeError, BridgeResult};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundMessage {
    Connected(ConnectedMessage),
    Start(StartMessage),
    Media(MediaMessage),
    Mark(MarkMessage),
    Dtmf(DtmfMessage),
    Stop(StopMessage),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectedMessage {
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMessage {
    #[serde(default)]
    pub sequence_number: Option<String>,
    pub start: StreamStart,
}

/// Stream metadata announced once per call.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    pub stream_sid: String,
    pub call_sid: String,
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub tracks: Vec<String>,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
    #[serde(default)]
    pub media_format: Option<MediaFormat>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMessage {
    #[serde(default)]
    pub sequence_number: Option<String>,
    pub media: MediaPayload,
}

impl MediaMessage {
    /// Provider sequence numbers arrive as decimal strings.
    pub fn sequence(&self) -> Option<u64> {
        self.sequence_number.as_deref().and_then(|s| s.parse().ok())
    }

    pub fn decode_payload(&self) -> BridgeResult<Vec<u8>> {
        let bytes = B64.decode(self.media.payload.as_bytes())?;
        if bytes.is_empty() {
            return Err(BridgeError::Decode("empty media payload".to_string()));
        }
        Ok(bytes)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaPayload {
    #[serde(default)]
    pub track: Option<String>,
    #[serde(default)]
    pub chunk: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    pub payload: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarkMessage {
    pub mark: MarkPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DtmfMessage {
    pub dtmf: DtmfPayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DtmfPayload {
    pub digit: String,
    #[serde(default)]
    pub track: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StopMessage {
    #[serde(default)]
    pub stop: Option<StopPayload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopPayload {
    #[serde(default)]
    pub call_sid: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundMessage {
    #[serde(rename_all = "camelCase")]
    Media { stream_sid: String, media: OutboundMedia },
    #[serde(rename_all = "camelCase")]
    Clear { stream_sid: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundMedia {
    pub payload: String,
}

impl OutboundMessage {
    pub fn media(stream_sid: &str, companded: &[u8]) -> Self {
        OutboundMessage::Media {
            stream_sid: stream_sid.to_string(),
            media: OutboundMedia {
                payload: B64.encode(companded),
            },
        }
    }

    pub fn clear(stream_sid: &str) -> Self {
        OutboundMessage::Clear {
            stream_sid: stream_sid.to_string(),
        }
    }

    pub fn to_json(&self) -> BridgeResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

pub fn parse(text: &str) -> BridgeResult<InboundMessage> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start() {
        let text = r#"{
            "event": "start",
            "sequenceNumber": "1",
            "start": {
                "accountSid": "AC1",
                "streamSid": "MZ123",
                "callSid": "CA123",
                "tracks": ["inbound"],
                "customParameters": {"caller": "+15550001111"},
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
            },
            "streamSid": "MZ123"
        }"#;

        match parse(text).unwrap() {
            InboundMessage::Start(msg) => {
                assert_eq!(msg.start.call_sid, "CA123");
                assert_eq!(msg.start.stream_sid, "MZ123");
                assert_eq!(msg.start.custom_parameters["caller"], "+15550001111");
                assert_eq!(msg.start.media_format.unwrap().sample_rate, 8000);
            }
            other => panic!("expected start, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_media() {
        let text = r#"{"event":"media","sequenceNumber":"7","media":{"track":"inbound","chunk":"2","timestamp":"40","payload":"//8="},"streamSid":"MZ1"}"#;
        match parse(text).unwrap() {
            InboundMessage::Media(msg) => {
                assert_eq!(msg.sequence(), Some(7));
                assert_eq!(msg.decode_payload().unwrap(), vec![0xFF, 0xFF]);
            }
            other => panic!("expected media, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_payload_is_decode_error() {
        let text = r#"{"event":"media","sequenceNumber":"1","media":{"payload":"***"}}"#;
        match parse(text).unwrap() {
            InboundMessage::Media(msg) => {
                assert!(matches!(msg.decode_payload(), Err(BridgeError::Decode(_))));
            }
            other => panic!("expected media, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_and_malformed() {
        assert!(matches!(parse(r#"{"event":"bogus"}"#).unwrap(), InboundMessage::Unknown));
        assert!(matches!(parse("not json"), Err(BridgeError::Protocol(_))));
        assert!(matches!(parse(r#"{"event":"stop"}"#).unwrap(), InboundMessage::Stop(_)));
    }

    #[test]
    fn test_outbound_shapes() {
        let media: serde_json::Value =
            serde_json::from_str(&OutboundMessage::media("MZ1", &[0xFF]).to_json().unwrap()).unwrap();
        assert_eq!(media["event"], "media");
        assert_eq!(media["streamSid"], "MZ1");
        assert_eq!(media["media"]["payload"], "/w==");

        let clear: serde_json::Value =
            serde_json::from_str(&OutboundMessage::clear("MZ1").to_json().unwrap()).unwrap();
        assert_eq!(clear, serde_json::json!({"event": "clear", "streamSid": "MZ1"}));
    }
}
