//! # Human Operator Audio
//!
//! Lets a person speak to the caller directly. While the call is in
//! `HUMAN_TAKEOVER`, caller audio is routed to this connection instead of the
//! AI, and operator audio is injected into the stream heading to the phone.
//!
//! ## Message Format:
//! - **Operator → Server**:
//!   - `{"type":"audio","audio":"<b64>","format":"mulaw"|"pcm16","sampleRate":<hz>}`
//!   - `{"type":"transcript","text":"..."}` (optional text for the call transcript)
//! - **Server → Operator**: `{"type":"caller_audio","audio":"<b64 mulaw>","sequence":n}`
//!
//! Disconnecting during a takeover hands control back to the AI.

use crate::audio::{codec, AudioFrame, FrameQueue, TELEPHONY_SAMPLE_RATE};
use crate::call::{CallSession, Speaker};
use crate::error::BridgeResult;
use crate::state::AppState;
use crate::websocket::{CLIENT_TIMEOUT, HEARTBEAT_INTERVAL};
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OperatorMessage {
    Audio {
        audio: String,
        #[serde(default)]
        format: OperatorAudioFormat,
        #[serde(rename = "sampleRate")]
        sample_rate: Option<u32>,
    },
    Transcript {
        text: String,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum OperatorAudioFormat {
    #[default]
    Mulaw,
    Pcm16,
}

/// Companded 8 kHz payload for the telephony leg.
fn to_telephony_payload(audio: &str, format: OperatorAudioFormat, sample_rate: Option<u32>) -> BridgeResult<Vec<u8>> {
    let bytes = B64.decode(audio)?;
    match format {
        OperatorAudioFormat::Mulaw => Ok(bytes),
        OperatorAudioFormat::Pcm16 => {
            codec::pcm16_bytes_to_mulaw(&bytes, sample_rate.unwrap_or(TELEPHONY_SAMPLE_RATE))
        }
    }
}

pub struct OperatorSocket {
    session: Arc<CallSession>,
    queue: Arc<FrameQueue>,
    last_heartbeat: Instant,
}

impl OperatorSocket {
    pub fn new(session: Arc<CallSession>, queue: Arc<FrameQueue>) -> Self {
        Self {
            session,
            queue,
            last_heartbeat: Instant::now(),
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let call_id = self.session.call_id();
        let message = match serde_json::from_str::<OperatorMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                debug!(call_id, error = %err, "Ignoring unrecognized operator message");
                return;
            }
        };

        match message {
            OperatorMessage::Audio { audio, format, sample_rate } => {
                let payload = match to_telephony_payload(&audio, format, sample_rate) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(call_id, error = %err, "Bad operator audio");
                        ctx.text(json!({"type": "error", "message": err.to_string()}).to_string());
                        return;
                    }
                };
                if let Err(err) = self.session.inject_human_audio(payload) {
                    debug!(call_id, error = %err, "Dropping operator audio outside takeover");
                }
            }
            OperatorMessage::Transcript { text } => {
                self.session.append_transcript(Speaker::HumanAgent, &text);
            }
        }
    }
}

impl Actor for OperatorSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(call_id = self.session.call_id(), "Operator connected");

        // Ends when the queue is closed: operator replaced, detached or call over.
        let frames = futures_util::stream::unfold(self.queue.clone(), |queue| async move {
            queue.pop().await.map(|frame| (frame, queue))
        });
        ctx.add_stream(frames);

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(call_id = act.session.call_id(), "Operator heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let resumed = self.session.detach_operator(&self.queue);
        info!(call_id = self.session.call_id(), resumed, "Operator disconnected");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for OperatorSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Binary(_)) => {
                warn!(call_id = self.session.call_id(), "Ignoring binary frame from operator");
            }
            Ok(_) => {}
            Err(err) => {
                warn!(call_id = self.session.call_id(), "Operator protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Caller audio routed to the operator.
impl StreamHandler<AudioFrame> for OperatorSocket {
    fn handle(&mut self, frame: AudioFrame, ctx: &mut Self::Context) {
        trace!(call_id = self.session.call_id(), sequence = frame.sequence, "Caller audio to operator");
        let message = json!({
            "type": "caller_audio",
            "audio": B64.encode(frame.payload()),
            "sequence": frame.sequence,
        });
        ctx.text(message.to_string());
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// `GET /human-audio/{call_id}`
pub async fn human_audio(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let call_id = path.into_inner();
    let session = app_state.registry().get(&call_id)?;
    let queue = session.attach_operator()?;

    match ws::start(OperatorSocket::new(session.clone(), queue.clone()), &req, stream) {
        Ok(response) => Ok(response),
        Err(err) => {
            session.detach_operator(&queue);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::error::BridgeError;
    use crate::state::testing::test_state;
    use actix_web::{test as atest, App};

    #[test]
    fn test_operator_message_parsing() {
        let audio: OperatorMessage =
            serde_json::from_str(r#"{"type":"audio","audio":"AAA=","format":"pcm16","sampleRate":16000}"#).unwrap();
        assert!(matches!(
            audio,
            OperatorMessage::Audio { format: OperatorAudioFormat::Pcm16, sample_rate: Some(16000), .. }
        ));

        let bare: OperatorMessage = serde_json::from_str(r#"{"type":"audio","audio":"AAA="}"#).unwrap();
        assert!(matches!(bare, OperatorMessage::Audio { format: OperatorAudioFormat::Mulaw, .. }));

        let text: OperatorMessage = serde_json::from_str(r#"{"type":"transcript","text":"hello"}"#).unwrap();
        assert!(matches!(text, OperatorMessage::Transcript { .. }));
    }

    #[test]
    fn test_pcm16_operator_audio_is_companded() {
        // 20 ms of silence at 16 kHz: 320 samples
        let pcm = vec![0u8; 640];
        let payload = to_telephony_payload(&B64.encode(&pcm), OperatorAudioFormat::Pcm16, Some(16_000)).unwrap();
        assert_eq!(payload.len(), 160);

        let mulaw = vec![0xFFu8; 160];
        let payload = to_telephony_payload(&B64.encode(&mulaw), OperatorAudioFormat::Mulaw, None).unwrap();
        assert_eq!(payload, mulaw);

        assert!(matches!(
            to_telephony_payload("not base64!", OperatorAudioFormat::Mulaw, None),
            Err(BridgeError::Decode(_))
        ));
    }

    #[actix_web::test]
    async fn test_unknown_call_is_not_found() {
        let (state, _peers) = test_state(AppConfig::default());
        let app = atest::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/human-audio/{call_id}", web::get().to(human_audio)),
        )
        .await;

        let req = atest::TestRequest::get().uri("/human-audio/CA404").to_request();
        let resp = atest::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);
    }
}
