//! # AI Stream Adapter
//!
//! Drives one realtime AI connection on behalf of a call session. It primes
//! the service with `session.update` (plus an optional greeting) and then runs
//! two loops over the same connection:
//!
//! - **send loop**: caller frames from the telephony→AI queue become
//!   `input_audio_buffer.append`; `AiControl` commands from the session become
//!   `response.cancel`, `input_audio_buffer.clear` or a fresh `session.update`
//! - **receive loop**: audio deltas are transcoded into the AI→telephony
//!   queue, transcripts go to the session, and barge-in and the `end_call`
//!   tool are handled here
//!
//! ## Interrupts:
//! Every interrupt bumps the session's epoch. The receive loop remembers the
//! epoch at which the current response was created; deltas from an older
//! epoch belong to a cancelled response and are discarded until the next
//! `response.created`.
//!
//! ## Reconnects:
//! If the connection drops while the call is still active, the adapter
//! reconnects with the same retry policy and re-primes the service. Running
//! out of attempts ends the call with `ai_unavailable`.

use crate::audio::FrameQueue;
use crate::call::{AiControl, CallSession, CallState, EndReason, Leg, Speaker};
use crate::realtime::connector::{connect_with_retry, RealtimeConnector, RetryPolicy};
use crate::realtime::protocol::{
    self, end_call_reason, ClientEvent, RealtimeAudioFormat, ServerEvent, SessionConfig, ToolDefinition,
    TranscriptionConfig, TurnDetection, END_CALL_TOOL,
};
use crate::transport::Link;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

const FAREWELL_INSTRUCTIONS: &str = "Deliver a brief, polite goodbye to the caller. \
    Keep it to one short sentence. Do not call any tools; speak the goodbye now.";

/// Per-call settings for the AI leg.
#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    pub instructions: String,
    pub voice: String,
    pub language: String,
    pub temperature: f32,
    pub greeting: Option<String>,
    pub audio_format: RealtimeAudioFormat,
    pub vad_threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    pub barge_in: bool,
    pub end_call_tool: bool,
    pub end_call_grace: Duration,
    pub farewell_watchdog: Duration,
    pub retry: RetryPolicy,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            instructions: "You are a helpful and friendly phone assistant. Keep answers short.".to_string(),
            voice: "alloy".to_string(),
            language: "en".to_string(),
            temperature: 0.8,
            greeting: None,
            audio_format: RealtimeAudioFormat::Pcm16,
            vad_threshold: 0.5,
            prefix_padding_ms: 100,
            silence_duration_ms: 200,
            barge_in: true,
            end_call_tool: true,
            end_call_grace: Duration::from_secs(3),
            farewell_watchdog: Duration::from_secs(4),
            retry: RetryPolicy::default(),
        }
    }
}

impl RealtimeSettings {
    pub fn session_config(&self) -> SessionConfig {
        let format = self.audio_format.as_str();
        let tools = if self.end_call_tool {
            vec![ToolDefinition::end_call()]
        } else {
            Vec::new()
        };
        SessionConfig {
            modalities: vec!["audio", "text"],
            instructions: self.instructions.clone(),
            voice: self.voice.clone(),
            temperature: self.temperature,
            input_audio_format: format,
            output_audio_format: format,
            input_audio_transcription: TranscriptionConfig {
                model: "whisper-1",
                language: self.language.clone(),
            },
            turn_detection: TurnDetection {
                kind: "server_vad",
                threshold: self.vad_threshold,
                prefix_padding_ms: self.prefix_padding_ms,
                silence_duration_ms: self.silence_duration_ms,
            },
            tool_choice: if tools.is_empty() { None } else { Some("auto") },
            tools,
        }
    }
}

/// Why a relay over one connection stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayExit {
    SessionClosing,
    ConnectionLost,
}

pub struct AiAdapter {
    session: Arc<CallSession>,
    settings: RealtimeSettings,
    connector: Arc<dyn RealtimeConnector>,
    to_ai: Arc<FrameQueue>,
    control: mpsc::UnboundedReceiver<AiControl>,
}

impl AiAdapter {
    pub fn new(
        session: Arc<CallSession>,
        settings: RealtimeSettings,
        connector: Arc<dyn RealtimeConnector>,
        to_ai: Arc<FrameQueue>,
        control: mpsc::UnboundedReceiver<AiControl>,
    ) -> Self {
        Self {
            session,
            settings,
            connector,
            to_ai,
            control,
        }
    }

    /// Relay over `link` (and any reconnection) until the call ends, then
    /// report the AI leg closed.
    pub async fn run(mut self, link: Link) {
        let call_id = self.session.call_id().to_string();
        let mut link = link;
        let mut first_connection = true;

        loop {
            let exit = self.relay(&mut link, first_connection).await;
            first_connection = false;

            if exit == RelayExit::SessionClosing || self.session.state().is_closing() {
                break;
            }

            warn!(call_id = %call_id, "AI transport dropped, reconnecting");
            match connect_with_retry(self.connector.as_ref(), &self.settings.retry, &call_id).await {
                Ok(next) => link = next,
                Err(err) => {
                    warn!(call_id = %call_id, error = %err, "AI transport unavailable");
                    self.session.request_end(EndReason::AiUnavailable);
                    break;
                }
            }
        }

        // dropping the link closes the socket
        drop(link);
        info!(call_id = %call_id, "AI adapter closed");
        self.session.mark_leg_closed(Leg::Ai);
    }

    async fn relay(&mut self, link: &mut Link, greet: bool) -> RelayExit {
        if let Err(exit) = self.prime(&link.outgoing, greet) {
            return exit;
        }

        let sender = SendLoop {
            session: &self.session,
            settings: &self.settings,
            to_ai: &self.to_ai,
            control: &mut self.control,
            outgoing: &link.outgoing,
        };
        let receiver = ReceiveLoop::new(&self.session, &self.settings, &link.outgoing);

        tokio::select! {
            exit = sender.run() => exit,
            exit = receiver.run(&mut link.incoming) => exit,
        }
    }

    fn prime(&self, outgoing: &mpsc::UnboundedSender<String>, greet: bool) -> Result<(), RelayExit> {
        let mut events = vec![ClientEvent::SessionUpdate {
            session: self.settings.session_config(),
        }];
        if greet {
            if let Some(greeting) = &self.settings.greeting {
                events.push(ClientEvent::user_text(greeting.clone()));
                events.push(ClientEvent::respond());
            }
        }
        for event in events {
            send(self.session.call_id(), outgoing, &event)?;
        }
        debug!(call_id = %self.session.call_id(), greet, "AI session primed");
        Ok(())
    }
}

fn send(call_id: &str, outgoing: &mpsc::UnboundedSender<String>, event: &ClientEvent) -> Result<(), RelayExit> {
    let json = match event.to_json() {
        Ok(json) => json,
        Err(err) => {
            warn!(call_id, error = %err, "Failed to encode AI event");
            return Ok(());
        }
    };
    outgoing.send(json).map_err(|_| RelayExit::ConnectionLost)
}

struct SendLoop<'a> {
    session: &'a CallSession,
    settings: &'a RealtimeSettings,
    to_ai: &'a FrameQueue,
    control: &'a mut mpsc::UnboundedReceiver<AiControl>,
    outgoing: &'a mpsc::UnboundedSender<String>,
}

impl SendLoop<'_> {
    async fn run(self) -> RelayExit {
        let call_id = self.session.call_id();
        loop {
            tokio::select! {
                biased;
                Some(command) = self.control.recv() => {
                    let events = match command {
                        AiControl::Interrupt { clear_input: true } => {
                            vec![ClientEvent::ResponseCancel, ClientEvent::InputAudioClear]
                        }
                        AiControl::Interrupt { clear_input: false } => vec![ClientEvent::ResponseCancel],
                        AiControl::Refresh => vec![
                            ClientEvent::InputAudioClear,
                            ClientEvent::SessionUpdate { session: self.settings.session_config() },
                        ],
                    };
                    debug!(call_id, command = ?command, "AI control command");
                    for event in events {
                        if let Err(exit) = send(call_id, self.outgoing, &event) {
                            return exit;
                        }
                    }
                }
                frame = self.to_ai.pop() => {
                    let Some(frame) = frame else {
                        return RelayExit::SessionClosing;
                    };
                    let audio = self.settings.audio_format.encode_input(&frame);
                    trace!(call_id, sequence = frame.sequence, "Caller frame to AI");
                    if let Err(exit) = send(call_id, self.outgoing, &ClientEvent::InputAudioAppend { audio }) {
                        return exit;
                    }
                }
            }
        }
    }
}

/// State of an `end_call` request.
#[derive(Debug, Default)]
struct Goodbye {
    pending: bool,
    audio_heard: bool,
    hangup_at: Option<Instant>,
    watchdog_at: Option<Instant>,
}

struct ReceiveLoop<'a> {
    session: &'a CallSession,
    settings: &'a RealtimeSettings,
    outgoing: &'a mpsc::UnboundedSender<String>,
    responding: bool,
    response_epoch: u64,
    goodbye: Goodbye,
}

impl<'a> ReceiveLoop<'a> {
    fn new(
        session: &'a CallSession,
        settings: &'a RealtimeSettings,
        outgoing: &'a mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            session,
            settings,
            outgoing,
            responding: false,
            response_epoch: session.interrupt_epoch(),
            goodbye: Goodbye::default(),
        }
    }

    async fn run(mut self, incoming: &mut mpsc::UnboundedReceiver<String>) -> RelayExit {
        loop {
            let deadline = match (self.goodbye.hangup_at, self.goodbye.watchdog_at) {
                (Some(hangup), _) => Some(hangup),
                (None, watchdog) => watchdog,
            };

            let text = tokio::select! {
                text = incoming.recv() => text,
                _ = self.session.closing() => return RelayExit::SessionClosing,
                _ = wait_until(deadline) => {
                    info!(call_id = %self.session.call_id(), "Assistant ended the call");
                    self.session.request_end(EndReason::AssistantEnded);
                    return RelayExit::SessionClosing;
                }
            };

            let Some(text) = text else {
                return RelayExit::ConnectionLost;
            };

            match protocol::parse(&text) {
                Ok(event) => {
                    if let Err(exit) = self.handle(event) {
                        return exit;
                    }
                }
                Err(err) => {
                    warn!(call_id = %self.session.call_id(), error = %err, "Malformed AI event");
                }
            }
        }
    }

    fn handle(&mut self, event: ServerEvent) -> Result<(), RelayExit> {
        let session = self.session;
        let call_id = session.call_id();
        match event {
            ServerEvent::SessionCreated => debug!(call_id, "AI session created"),
            ServerEvent::SessionUpdated => debug!(call_id, "AI session updated"),
            ServerEvent::ResponseCreated { response } => {
                self.responding = true;
                self.response_epoch = self.session.interrupt_epoch();
                debug!(call_id, response_id = ?response.id, "Response started");
            }
            ServerEvent::AudioDelta { delta, .. } => self.on_audio_delta(&delta),
            ServerEvent::AudioDone => trace!(call_id, "Response audio done"),
            ServerEvent::AudioTranscriptDone { transcript } => {
                self.session.append_transcript(Speaker::Assistant, &transcript);
            }
            ServerEvent::InputTranscriptionCompleted { transcript } => {
                self.session.append_transcript(Speaker::Caller, &transcript);
            }
            ServerEvent::ResponseDone { response } => {
                self.responding = false;
                debug!(call_id, response_id = ?response.id, status = ?response.status, "Response done");
                if self.goodbye.pending && self.goodbye.audio_heard && self.goodbye.hangup_at.is_none() {
                    self.goodbye.hangup_at = Some(Instant::now() + self.settings.end_call_grace);
                    debug!(call_id, "Farewell delivered, hanging up after grace period");
                }
            }
            ServerEvent::SpeechStarted => self.on_speech_started(),
            ServerEvent::SpeechStopped => trace!(call_id, "Caller speech stopped"),
            ServerEvent::FunctionCallArgumentsDone { name, arguments } => {
                if name.as_deref() == Some(END_CALL_TOOL) {
                    self.on_end_call(&arguments)?;
                } else {
                    debug!(call_id, tool = ?name, "Ignoring unknown tool call");
                }
            }
            ServerEvent::Error { error } => {
                warn!(call_id, kind = ?error.kind, code = ?error.code, message = %error.message, "AI service error");
            }
            ServerEvent::Other => {}
        }
        Ok(())
    }

    fn on_audio_delta(&mut self, delta: &str) {
        let session = self.session;
        let call_id = session.call_id();
        if self.session.state() != CallState::Streaming {
            trace!(call_id, "Dropping AI audio while not in control");
            return;
        }
        if self.response_epoch != self.session.interrupt_epoch() {
            trace!(call_id, "Dropping audio from interrupted response");
            return;
        }

        match self.settings.audio_format.decode_output(delta) {
            Ok(companded) if !companded.is_empty() => {
                if self.goodbye.pending {
                    self.goodbye.audio_heard = true;
                }
                self.session.push_assistant_audio(companded);
            }
            Ok(_) => {}
            Err(err) => warn!(call_id, error = %err, "Dropping undecodable AI audio"),
        }
    }

    /// Playback usually trails generation, so queued audio is flushed even
    /// when the response is already done; only a live response is cancelled.
    fn on_speech_started(&mut self) {
        if !self.settings.barge_in || self.session.state() != CallState::Streaming {
            return;
        }
        let epoch = if self.responding {
            self.responding = false;
            self.session.interrupt(false)
        } else {
            self.session.flush_playback()
        };
        info!(call_id = %self.session.call_id(), epoch, "Caller barged in");
    }

    fn on_end_call(&mut self, arguments: &str) -> Result<(), RelayExit> {
        let session = self.session;
        let call_id = session.call_id();
        if !self.settings.end_call_tool {
            return Ok(());
        }
        if self.goodbye.pending {
            debug!(call_id, "End call already pending");
            return Ok(());
        }

        let reason = end_call_reason(arguments);
        info!(call_id, reason = ?reason, "Assistant requested end of call");
        let mut instructions = FAREWELL_INSTRUCTIONS.to_string();
        if reason.is_some() {
            instructions.push_str(" Acknowledge that the caller asked to end the call.");
        }

        self.goodbye = Goodbye {
            pending: true,
            audio_heard: false,
            hangup_at: None,
            watchdog_at: Some(Instant::now() + self.settings.farewell_watchdog),
        };
        send(call_id, self.outgoing, &ClientEvent::respond_with(instructions))
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{SessionSettings, TelephonyControl};
    use crate::realtime::connector::testing::ScriptedConnector;
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine as _;
    use serde_json::Value;

    struct Harness {
        session: Arc<CallSession>,
        service: Link,
        handles: crate::call::session::RelayHandles,
        task: tokio::task::JoinHandle<()>,
        peers: mpsc::UnboundedReceiver<Link>,
    }

    fn settings() -> RealtimeSettings {
        RealtimeSettings {
            audio_format: RealtimeAudioFormat::G711Ulaw,
            end_call_grace: Duration::from_millis(10),
            farewell_watchdog: Duration::from_millis(500),
            retry: RetryPolicy {
                attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
            ..RealtimeSettings::default()
        }
    }

    fn start(settings: RealtimeSettings, failures: u32) -> Harness {
        let session = Arc::new(CallSession::new("CA1", SessionSettings::default()));
        let mut handles = session.begin_streaming().unwrap();
        let (connector, peers) = ScriptedConnector::new(failures);
        let (client, service) = Link::pair();

        let (_, placeholder) = mpsc::unbounded_channel();
        let control = std::mem::replace(&mut handles.ai_control, placeholder);
        let adapter = AiAdapter::new(
            session.clone(),
            settings,
            Arc::new(connector),
            handles.to_ai.clone(),
            control,
        );
        let task = tokio::spawn(adapter.run(client));
        Harness { session, service, handles, task, peers }
    }

    async fn next_event(link: &mut Link) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(1), link.incoming.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&text).unwrap()
    }

    async fn next_of_type(link: &mut Link, kind: &str) -> Value {
        loop {
            let event = next_event(link).await;
            if event["type"] == kind {
                return event;
            }
        }
    }

    fn emit(link: &Link, event: Value) {
        link.outgoing.send(event.to_string()).unwrap();
    }

    fn delta(response: &str) -> Value {
        serde_json::json!({"type": "response.audio.delta", "response_id": response, "delta": B64.encode([0x7Fu8; 160])})
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_primes_session_and_forwards_caller_audio() {
        let mut h = start(settings(), 0);

        let update = next_event(&mut h.service).await;
        assert_eq!(update["type"], "session.update");
        assert_eq!(update["session"]["input_audio_format"], "g711_ulaw");
        assert_eq!(update["session"]["tools"][0]["name"], "end_call");

        h.session.route_caller_audio(vec![0xFF; 160]);
        let append = next_event(&mut h.service).await;
        assert_eq!(append["type"], "input_audio_buffer.append");
        assert_eq!(B64.decode(append["audio"].as_str().unwrap()).unwrap(), vec![0xFF; 160]);
    }

    #[tokio::test]
    async fn test_barge_in_cancels_and_drops_stale_audio() {
        let mut h = start(settings(), 0);
        next_of_type(&mut h.service, "session.update").await;

        emit(&h.service, serde_json::json!({"type": "response.created", "response": {"id": "r1"}}));
        emit(&h.service, delta("r1"));
        emit(&h.service, delta("r1"));
        settle().await;
        assert_eq!(h.handles.to_telephony.len(), 2);

        emit(&h.service, serde_json::json!({"type": "input_audio_buffer.speech_started"}));
        next_of_type(&mut h.service, "response.cancel").await;
        assert!(h.handles.to_telephony.is_empty());

        // late audio from the cancelled response never reaches the caller
        emit(&h.service, delta("r1"));
        settle().await;
        assert!(h.handles.to_telephony.is_empty());

        emit(&h.service, serde_json::json!({"type": "response.created", "response": {"id": "r2"}}));
        emit(&h.service, delta("r2"));
        settle().await;
        assert_eq!(h.handles.to_telephony.len(), 1);
    }

    #[tokio::test]
    async fn test_barge_in_after_response_done_flushes_playback() {
        let mut h = start(settings(), 0);
        next_of_type(&mut h.service, "session.update").await;

        emit(&h.service, serde_json::json!({"type": "response.created", "response": {"id": "r1"}}));
        for _ in 0..3 {
            emit(&h.service, delta("r1"));
        }
        emit(&h.service, serde_json::json!({"type": "response.done", "response": {"id": "r1"}}));
        settle().await;
        assert_eq!(h.handles.to_telephony.len(), 3);
        let epoch = h.session.interrupt_epoch();

        emit(&h.service, serde_json::json!({"type": "input_audio_buffer.speech_started"}));
        settle().await;

        assert!(h.handles.to_telephony.is_empty());
        assert_eq!(h.handles.telephony_control.try_recv().unwrap(), TelephonyControl::Clear);
        assert_eq!(h.session.interrupt_epoch(), epoch + 1);

        // nothing left to cancel on the AI side
        h.session.route_caller_audio(vec![0xFF; 160]);
        let next = next_event(&mut h.service).await;
        assert_eq!(next["type"], "input_audio_buffer.append");
    }

    #[tokio::test]
    async fn test_transcripts_recorded_and_noise_filtered() {
        let h = start(settings(), 0);
        emit(&h.service, serde_json::json!({
            "type": "conversation.item.input_audio_transcription.completed",
            "transcript": "um"
        }));
        emit(&h.service, serde_json::json!({
            "type": "conversation.item.input_audio_transcription.completed",
            "transcript": "I'd like to book a table"
        }));
        emit(&h.service, serde_json::json!({
            "type": "response.output_audio_transcript.done",
            "transcript": "Sure, for how many people?"
        }));
        settle().await;

        let turns = h.session.transcript();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].speaker, Speaker::Caller);
        assert_eq!(turns[1].speaker, Speaker::Assistant);
    }

    #[tokio::test]
    async fn test_end_call_tool_hangs_up_after_farewell() {
        let mut h = start(settings(), 0);
        next_of_type(&mut h.service, "session.update").await;

        emit(&h.service, serde_json::json!({
            "type": "response.function_call_arguments.done",
            "name": "end_call",
            "call_id": "tool1",
            "arguments": "{\"reason\":\"caller said bye\"}"
        }));
        let farewell = next_of_type(&mut h.service, "response.create").await;
        assert!(farewell["response"]["instructions"].as_str().unwrap().contains("goodbye"));

        emit(&h.service, serde_json::json!({"type": "response.created", "response": {"id": "r9"}}));
        emit(&h.service, delta("r9"));
        emit(&h.service, serde_json::json!({"type": "response.done", "response": {"id": "r9"}}));

        tokio::time::timeout(Duration::from_secs(1), h.session.closing()).await.unwrap();
        assert_eq!(h.session.end_reason(), Some(EndReason::AssistantEnded));
        tokio::time::timeout(Duration::from_secs(1), h.task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_and_reprimes() {
        let mut h = start(settings(), 0);
        next_of_type(&mut h.service, "session.update").await;

        drop(h.service);
        let mut replacement = tokio::time::timeout(Duration::from_secs(1), h.peers.recv())
            .await
            .unwrap()
            .unwrap();
        next_of_type(&mut replacement, "session.update").await;
        assert_eq!(h.session.state(), CallState::Streaming);
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_ends_call() {
        let h = start(settings(), 5);
        drop(h.service);

        tokio::time::timeout(Duration::from_secs(1), h.task).await.unwrap().unwrap();
        assert_eq!(h.session.end_reason(), Some(EndReason::AiUnavailable));
        assert_eq!(h.session.state(), CallState::Ending);
    }

    #[tokio::test]
    async fn test_takeover_sends_cancel_and_clear() {
        let mut h = start(settings(), 0);
        next_of_type(&mut h.service, "session.update").await;

        h.session.begin_takeover().unwrap();
        next_of_type(&mut h.service, "response.cancel").await;
        next_of_type(&mut h.service, "input_audio_buffer.clear").await;

        // AI audio is discarded while a human is in control
        emit(&h.service, serde_json::json!({"type": "response.created", "response": {"id": "r3"}}));
        emit(&h.service, delta("r3"));
        settle().await;
        assert!(h.handles.to_telephony.is_empty());

        h.session.resume_ai().unwrap();
        next_of_type(&mut h.service, "input_audio_buffer.clear").await;
        next_of_type(&mut h.service, "session.update").await;
    }
}
