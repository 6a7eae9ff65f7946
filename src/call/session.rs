//! # Call Session
//!
//! Owns everything one phone call needs: its lifecycle state, the two relay
//! queues, the transcript, the observer hub and the control channels used to
//! steer the adapters.
//!
//! ## Concurrency model:
//! - **state** lives in a `tokio::sync::watch` channel so supervisors can
//!   `await` a transition instead of polling; every change goes through
//!   `send_if_modified`, which makes check-and-set atomic
//! - **relay queues** are created only once the AI leg is up and are the sole
//!   data path between the telephony and AI adapters
//! - **control channels** carry out-of-band commands (interrupt, refresh,
//!   clear) to the adapters' write loops
//! - **counters** are atomics; nothing here holds a lock across an `.await`
//!
//! The session never touches a socket. Adapters call in to route audio and
//! transcripts; operators and the HTTP API call in to take over, resume or
//! end the call.

use crate::audio::{AudioFrame, FrameQueue, QueueStats};
use crate::call::state::{CallState, EndReason};
use crate::call::transcript::{is_meaningful, Speaker, Transcript, TranscriptTurn};
use crate::error::{BridgeError, BridgeResult};
use crate::observer::{ObserverEvent, ObserverHub, Subscription};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-call tunables, snapshotted from `AppConfig` when the call starts.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub queue_capacity: usize,
    pub operator_queue_capacity: usize,
    pub observer_queue_capacity: usize,
    /// Bound on `ENDING → ENDED`
    pub shutdown_grace: Duration,
    pub max_call_duration: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 200,
            operator_queue_capacity: 200,
            observer_queue_capacity: 256,
            shutdown_grace: Duration::from_secs(2),
            max_call_duration: None,
        }
    }
}

/// What the telephony provider told us in its `start` message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallMetadata {
    pub stream_sid: Option<String>,
    pub account_sid: Option<String>,
    pub custom_parameters: HashMap<String, String>,
}

/// Commands for the AI adapter's write loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiControl {
    /// Cancel the in-flight response; optionally drop buffered input audio too.
    Interrupt { clear_input: bool },
    /// Re-prime the AI after a takeover ends.
    Refresh,
}

/// Commands for the telephony adapter's write loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelephonyControl {
    /// Tell the provider to discard audio it has buffered for playback.
    Clear,
}

/// Which way a caller frame went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRoute {
    Assistant,
    Operator,
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Telephony,
    Ai,
}

/// Receiving ends handed to the adapters when streaming starts.
pub struct RelayHandles {
    pub to_ai: Arc<FrameQueue>,
    pub to_telephony: Arc<FrameQueue>,
    pub ai_control: mpsc::UnboundedReceiver<AiControl>,
    pub telephony_control: mpsc::UnboundedReceiver<TelephonyControl>,
}

struct Relay {
    to_ai: Arc<FrameQueue>,
    to_telephony: Arc<FrameQueue>,
    ai_control: mpsc::UnboundedSender<AiControl>,
    telephony_control: mpsc::UnboundedSender<TelephonyControl>,
}

#[derive(Debug, Clone, Copy, Default)]
struct ClosedLegs {
    telephony: bool,
    ai: bool,
}

/// Frame counters for both directions.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FrameStats {
    pub to_ai: QueueStats,
    pub to_telephony: QueueStats,
}

/// Terminal notification for archival collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct FinalizeEvent {
    pub call_id: String,
    pub stream_sid: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub transcript: Vec<TranscriptTurn>,
    pub takeover_occurred: bool,
    pub end_reason: EndReason,
    /// `None` when the call never reached `STREAMING`
    pub frames: Option<FrameStats>,
    pub custom_parameters: HashMap<String, String>,
}

/// Point-in-time view for the control API.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub call_id: String,
    pub stream_sid: Option<String>,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub elapsed_secs: f64,
    pub turn_count: usize,
    pub takeover_active: bool,
    pub takeover_occurred: bool,
    pub operator_attached: bool,
    pub observers: usize,
    pub frames: Option<FrameStats>,
    pub end_reason: Option<EndReason>,
}

pub struct CallSession {
    call_id: String,
    settings: SessionSettings,
    metadata: RwLock<CallMetadata>,
    started_at: DateTime<Utc>,
    ended_at: RwLock<Option<DateTime<Utc>>>,
    state: watch::Sender<CallState>,
    end_reason: RwLock<Option<EndReason>>,
    relay: RwLock<Option<Relay>>,
    operator: RwLock<Option<Arc<FrameQueue>>>,
    transcript: Transcript,
    observers: ObserverHub,
    legs: watch::Sender<ClosedLegs>,
    connect_abort: Notify,
    takeover_occurred: AtomicBool,
    interrupt_epoch: AtomicU64,
    inbound_sequence: AtomicU64,
    outbound_sequence: AtomicU64,
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("call_id", &self.call_id)
            .field("state", &self.state())
            .field("end_reason", &self.end_reason())
            .finish_non_exhaustive()
    }
}

impl CallSession {
    pub fn new(call_id: impl Into<String>, settings: SessionSettings) -> Self {
        let call_id = call_id.into();
        let (state, _) = watch::channel(CallState::Initiated);
        let (legs, _) = watch::channel(ClosedLegs::default());
        Self {
            observers: ObserverHub::new(call_id.clone(), settings.observer_queue_capacity),
            call_id,
            settings,
            metadata: RwLock::new(CallMetadata::default()),
            started_at: Utc::now(),
            ended_at: RwLock::new(None),
            state,
            end_reason: RwLock::new(None),
            relay: RwLock::new(None),
            operator: RwLock::new(None),
            transcript: Transcript::new(),
            legs,
            connect_abort: Notify::new(),
            takeover_occurred: AtomicBool::new(false),
            interrupt_epoch: AtomicU64::new(0),
            inbound_sequence: AtomicU64::new(0),
            outbound_sequence: AtomicU64::new(0),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        *self.end_reason.read()
    }

    pub fn set_metadata(&self, metadata: CallMetadata) {
        *self.metadata.write() = metadata;
    }

    pub fn metadata(&self) -> CallMetadata {
        self.metadata.read().clone()
    }

    pub fn transcript(&self) -> Vec<TranscriptTurn> {
        self.transcript.snapshot()
    }

    pub fn turn_count(&self) -> usize {
        self.transcript.len()
    }

    pub fn takeover_occurred(&self) -> bool {
        self.takeover_occurred.load(Ordering::SeqCst)
    }

    /// Bumped on every interrupt; audio from responses that started before
    /// the current epoch is stale.
    pub fn interrupt_epoch(&self) -> u64 {
        self.interrupt_epoch.load(Ordering::SeqCst)
    }

    /// Whether the relay queues were ever created.
    pub fn has_relay(&self) -> bool {
        self.relay.read().is_some()
    }

    fn transition(&self, to: CallState, operation: &'static str) -> BridgeResult<CallState> {
        let mut from = to;
        let changed = self.state.send_if_modified(|state| {
            from = *state;
            if state.can_transition_to(to) {
                *state = to;
                true
            } else {
                false
            }
        });

        if !changed {
            return Err(BridgeError::InvalidStateTransition {
                call_id: self.call_id.clone(),
                from,
                operation,
            });
        }

        info!(call_id = %self.call_id, from = %from, to = %to, "Call state changed");
        self.observers.publish(ObserverEvent::State(to));
        Ok(from)
    }

    fn record_end_reason(&self, reason: EndReason) {
        let mut current = self.end_reason.write();
        if current.is_none() {
            *current = Some(reason);
        }
    }

    /// `INITIATED → STREAMING`: the AI leg is connected. Creates both relay
    /// queues and the control channels.
    pub fn begin_streaming(&self) -> BridgeResult<RelayHandles> {
        let to_ai = Arc::new(FrameQueue::new(self.settings.queue_capacity));
        let to_telephony = Arc::new(FrameQueue::new(self.settings.queue_capacity));
        let (ai_tx, ai_rx) = mpsc::unbounded_channel();
        let (tel_tx, tel_rx) = mpsc::unbounded_channel();

        *self.relay.write() = Some(Relay {
            to_ai: to_ai.clone(),
            to_telephony: to_telephony.clone(),
            ai_control: ai_tx,
            telephony_control: tel_tx,
        });

        if let Err(err) = self.transition(CallState::Streaming, "start streaming") {
            *self.relay.write() = None;
            return Err(err);
        }

        Ok(RelayHandles {
            to_ai,
            to_telephony,
            ai_control: ai_rx,
            telephony_control: tel_rx,
        })
    }

    /// `STREAMING → HUMAN_TAKEOVER`. Cancels whatever the AI was saying and
    /// stops forwarding caller audio to it.
    pub fn begin_takeover(&self) -> BridgeResult<()> {
        self.transition(CallState::HumanTakeover, "take over")?;
        self.takeover_occurred.store(true, Ordering::SeqCst);
        self.interrupt(true);
        self.observers.publish(ObserverEvent::Takeover { active: true });
        info!(call_id = %self.call_id, "Human takeover started");
        Ok(())
    }

    /// `HUMAN_TAKEOVER → STREAMING`. The AI adapter re-primes its session.
    pub fn resume_ai(&self) -> BridgeResult<()> {
        self.transition(CallState::Streaming, "resume")?;
        if let Some(operator) = self.operator.read().as_ref() {
            operator.clear();
        }
        if let Some(relay) = self.relay.read().as_ref() {
            let _ = relay.ai_control.send(AiControl::Refresh);
        }
        self.observers.publish(ObserverEvent::Takeover { active: false });
        info!(call_id = %self.call_id, "AI control resumed");
        Ok(())
    }

    /// Cancel the in-flight assistant response and flush queued playback.
    /// Returns the new interrupt epoch.
    pub fn interrupt(&self, clear_input: bool) -> u64 {
        self.cut_playback(Some(AiControl::Interrupt { clear_input }))
    }

    /// Flush queued playback and tell the provider to drop its buffer, without
    /// touching the AI. Used when the caller talks over audio whose response
    /// has already finished generating. Returns the new interrupt epoch.
    pub fn flush_playback(&self) -> u64 {
        self.cut_playback(None)
    }

    fn cut_playback(&self, command: Option<AiControl>) -> u64 {
        let epoch = self.interrupt_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(relay) = self.relay.read().as_ref() {
            let flushed = relay.to_telephony.clear();
            let _ = relay.telephony_control.send(TelephonyControl::Clear);
            if let Some(command) = command {
                let _ = relay.ai_control.send(command);
            }
            debug!(call_id = %self.call_id, epoch, flushed, cancelled = command.is_some(), "Playback interrupted");
        }
        epoch
    }

    /// Ask the call to end. From an active state this moves to `ENDING` and
    /// closes both relay queues; while still `INITIATED` it aborts the
    /// pending AI connect. Returns `false` if the call was already ending.
    pub fn request_end(&self, reason: EndReason) -> bool {
        match self.state() {
            CallState::Initiated => {
                self.record_end_reason(reason);
                self.connect_abort.notify_one();
                info!(call_id = %self.call_id, reason = %reason, "End requested before streaming");
                true
            }
            CallState::Streaming | CallState::HumanTakeover => {
                if self.transition(CallState::Ending, "end").is_err() {
                    return false;
                }
                self.record_end_reason(reason);
                if let Some(relay) = self.relay.read().as_ref() {
                    relay.to_ai.close();
                    relay.to_telephony.close();
                }
                if let Some(operator) = self.operator.read().as_ref() {
                    operator.close();
                }
                info!(call_id = %self.call_id, reason = %reason, "Call ending");
                true
            }
            CallState::Ending | CallState::Ended => false,
        }
    }

    /// Resolves when `request_end` is called while the call is `INITIATED`.
    pub async fn connect_aborted(&self) -> EndReason {
        self.connect_abort.notified().await;
        self.end_reason().unwrap_or(EndReason::OperatorEnded)
    }

    /// Resolves once the call is `ENDING` or `ENDED`.
    pub async fn closing(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| state.is_closing()).await;
    }

    pub fn mark_leg_closed(&self, leg: Leg) {
        self.legs.send_modify(|legs| match leg {
            Leg::Telephony => legs.telephony = true,
            Leg::Ai => legs.ai = true,
        });
        debug!(call_id = %self.call_id, leg = ?leg, "Adapter closed");
    }

    /// Resolves once both adapters have reported closed.
    pub async fn legs_closed(&self) {
        let mut rx = self.legs.subscribe();
        let _ = rx.wait_for(|legs| legs.telephony && legs.ai).await;
    }

    /// `ENDING → ENDED`.
    pub fn finish(&self) -> BridgeResult<FinalizeEvent> {
        self.transition(CallState::Ended, "finish")?;
        Ok(self.seal())
    }

    /// `INITIATED → ENDED`, used when the AI leg never came up.
    pub fn finish_without_streaming(&self, reason: EndReason) -> BridgeResult<FinalizeEvent> {
        self.transition(CallState::Ended, "finish")?;
        self.record_end_reason(reason);
        Ok(self.seal())
    }

    fn seal(&self) -> FinalizeEvent {
        let ended_at = Utc::now();
        *self.ended_at.write() = Some(ended_at);
        let reason = self.end_reason().unwrap_or(EndReason::TelephonyDisconnected);

        self.observers.publish(ObserverEvent::Ended {
            reason,
            duration_secs: self.elapsed_secs(),
        });
        self.observers.close();

        let metadata = self.metadata();
        FinalizeEvent {
            call_id: self.call_id.clone(),
            stream_sid: metadata.stream_sid,
            started_at: self.started_at,
            ended_at,
            duration_secs: self.elapsed_secs(),
            transcript: self.transcript(),
            takeover_occurred: self.takeover_occurred(),
            end_reason: reason,
            frames: self.frame_stats(),
            custom_parameters: metadata.custom_parameters,
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        let end = (*self.ended_at.read()).unwrap_or_else(Utc::now);
        end.signed_duration_since(self.started_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn frame_stats(&self) -> Option<FrameStats> {
        self.relay.read().as_ref().map(|relay| FrameStats {
            to_ai: relay.to_ai.stats(),
            to_telephony: relay.to_telephony.stats(),
        })
    }

    /// Route one companded caller frame according to who is in control.
    pub fn route_caller_audio(&self, payload: Vec<u8>) -> FrameRoute {
        let sequence = self.inbound_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = AudioFrame::mulaw(payload, sequence);

        let state = self.state();
        if state.is_active() {
            self.observers.publish(ObserverEvent::Audio {
                speaker: Speaker::Caller,
                frame: frame.clone(),
            });
        }

        match state {
            CallState::Streaming => match self.relay.read().as_ref() {
                Some(relay) => {
                    relay.to_ai.push(frame);
                    FrameRoute::Assistant
                }
                None => FrameRoute::Dropped,
            },
            CallState::HumanTakeover => match self.operator.read().as_ref() {
                Some(operator) => {
                    operator.push(frame);
                    FrameRoute::Operator
                }
                None => FrameRoute::Dropped,
            },
            _ => FrameRoute::Dropped,
        }
    }

    /// Queue companded assistant audio for the caller. Ignored unless the AI
    /// is in control.
    pub fn push_assistant_audio(&self, payload: Vec<u8>) -> bool {
        if self.state() != CallState::Streaming {
            return false;
        }
        self.push_outbound(Speaker::Assistant, payload)
    }

    /// Queue companded operator audio for the caller.
    pub fn inject_human_audio(&self, payload: Vec<u8>) -> BridgeResult<()> {
        let state = self.state();
        if state != CallState::HumanTakeover {
            return Err(BridgeError::InvalidStateTransition {
                call_id: self.call_id.clone(),
                from: state,
                operation: "inject operator audio into",
            });
        }
        self.push_outbound(Speaker::HumanAgent, payload);
        Ok(())
    }

    fn push_outbound(&self, speaker: Speaker, payload: Vec<u8>) -> bool {
        let relay = self.relay.read();
        let Some(relay) = relay.as_ref() else {
            return false;
        };
        let sequence = self.outbound_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = AudioFrame::mulaw(payload, sequence);
        self.observers.publish(ObserverEvent::Audio {
            speaker,
            frame: frame.clone(),
        });
        relay.to_telephony.push(frame);
        true
    }

    /// Append a transcript turn. Noise and assistant text produced while a
    /// human has control are discarded.
    pub fn append_transcript(&self, speaker: Speaker, text: &str) -> Option<TranscriptTurn> {
        let text = text.trim();
        if !is_meaningful(speaker, text) {
            debug!(call_id = %self.call_id, speaker = speaker.as_str(), text, "Transcript filtered");
            return None;
        }
        if speaker == Speaker::Assistant && self.state() == CallState::HumanTakeover {
            return None;
        }

        let turn = self.transcript.append(speaker, text);
        info!(call_id = %self.call_id, speaker = speaker.as_str(), text, "Transcript turn");
        self.observers.publish(ObserverEvent::Transcript(turn.clone()));
        Some(turn)
    }

    /// Subscribe a dashboard. Only possible while the relay is running.
    pub fn subscribe_observer(&self, sample_rate: u32) -> Option<Subscription> {
        if !self.state().is_active() {
            return None;
        }
        Some(self.observers.subscribe(sample_rate))
    }

    pub fn unsubscribe_observer(&self, id: &Uuid) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Attach an operator audio feed, replacing any previous one.
    pub fn attach_operator(&self) -> BridgeResult<Arc<FrameQueue>> {
        let state = self.state();
        if state.is_closing() {
            return Err(BridgeError::InvalidStateTransition {
                call_id: self.call_id.clone(),
                from: state,
                operation: "attach an operator to",
            });
        }

        let queue = Arc::new(FrameQueue::new(self.settings.operator_queue_capacity));
        if let Some(previous) = self.operator.write().replace(queue.clone()) {
            warn!(call_id = %self.call_id, "Replacing existing operator connection");
            previous.close();
        }
        Ok(queue)
    }

    /// Detach an operator feed. If that operator was in control, the AI takes
    /// over again. Returns whether control was handed back.
    pub fn detach_operator(&self, queue: &Arc<FrameQueue>) -> bool {
        {
            let mut operator = self.operator.write();
            match operator.as_ref() {
                Some(current) if Arc::ptr_eq(current, queue) => {
                    current.close();
                    *operator = None;
                }
                _ => return false,
            }
        }

        if self.state() == CallState::HumanTakeover {
            info!(call_id = %self.call_id, "Operator left during takeover, resuming AI");
            return self.resume_ai().is_ok();
        }
        false
    }

    pub fn operator_attached(&self) -> bool {
        self.operator.read().is_some()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let state = self.state();
        CallSnapshot {
            call_id: self.call_id.clone(),
            stream_sid: self.metadata.read().stream_sid.clone(),
            state,
            started_at: self.started_at,
            ended_at: *self.ended_at.read(),
            elapsed_secs: self.elapsed_secs(),
            turn_count: self.turn_count(),
            takeover_active: state == CallState::HumanTakeover,
            takeover_occurred: self.takeover_occurred(),
            operator_attached: self.operator_attached(),
            observers: self.observers.subscriber_count(),
            frames: self.frame_stats(),
            end_reason: self.end_reason(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streaming_session() -> (CallSession, RelayHandles) {
        let session = CallSession::new("CA1", SessionSettings::default());
        let handles = session.begin_streaming().unwrap();
        (session, handles)
    }

    #[test]
    fn test_new_session_is_initiated_without_relay() {
        let session = CallSession::new("CA1", SessionSettings::default());
        assert_eq!(session.state(), CallState::Initiated);
        assert!(!session.has_relay());
        assert!(session.frame_stats().is_none());
    }

    #[test]
    fn test_takeover_requires_streaming() {
        let session = CallSession::new("CA1", SessionSettings::default());
        let err = session.begin_takeover().unwrap_err();
        assert!(matches!(
            err,
            BridgeError::InvalidStateTransition { from: CallState::Initiated, .. }
        ));
    }

    #[test]
    fn test_caller_audio_routing_follows_control() {
        let (session, handles) = streaming_session();
        let operator = session.attach_operator().unwrap();

        assert_eq!(session.route_caller_audio(vec![0xFF; 160]), FrameRoute::Assistant);
        assert_eq!(handles.to_ai.len(), 1);

        session.begin_takeover().unwrap();
        assert_eq!(session.route_caller_audio(vec![0xFF; 160]), FrameRoute::Operator);
        assert_eq!(session.route_caller_audio(vec![0xFF; 160]), FrameRoute::Operator);
        assert_eq!(handles.to_ai.len(), 1);
        assert_eq!(operator.len(), 2);

        session.resume_ai().unwrap();
        assert_eq!(session.route_caller_audio(vec![0xFF; 160]), FrameRoute::Assistant);
        assert_eq!(handles.to_ai.len(), 2);
    }

    #[test]
    fn test_takeover_interrupts_ai_and_flushes_playback() {
        let (session, mut handles) = streaming_session();
        assert!(session.push_assistant_audio(vec![0xFF; 160]));
        assert!(session.push_assistant_audio(vec![0xFF; 160]));
        assert_eq!(handles.to_telephony.len(), 2);

        session.begin_takeover().unwrap();

        assert!(handles.to_telephony.is_empty());
        assert_eq!(
            handles.ai_control.try_recv().unwrap(),
            AiControl::Interrupt { clear_input: true }
        );
        assert_eq!(handles.telephony_control.try_recv().unwrap(), TelephonyControl::Clear);
        assert!(session.takeover_occurred());
        assert_eq!(session.interrupt_epoch(), 1);

        // assistant audio is paused while a human is in control
        assert!(!session.push_assistant_audio(vec![0xFF; 160]));
        assert!(session.inject_human_audio(vec![0x7F; 160]).is_ok());
        assert_eq!(handles.to_telephony.len(), 1);

        session.resume_ai().unwrap();
        assert_eq!(handles.ai_control.try_recv().unwrap(), AiControl::Refresh);
    }

    #[test]
    fn test_flush_playback_leaves_ai_alone() {
        let (session, mut handles) = streaming_session();
        assert!(session.push_assistant_audio(vec![0xFF; 160]));

        assert_eq!(session.flush_playback(), 1);
        assert!(handles.to_telephony.is_empty());
        assert_eq!(handles.telephony_control.try_recv().unwrap(), TelephonyControl::Clear);
        assert!(handles.ai_control.try_recv().is_err());
    }

    #[test]
    fn test_inject_outside_takeover_is_rejected() {
        let (session, _handles) = streaming_session();
        assert!(session.inject_human_audio(vec![0xFF; 160]).is_err());
    }

    #[test]
    fn test_request_end_closes_queues_once() {
        let (session, handles) = streaming_session();
        assert!(session.request_end(EndReason::CallerHungUp));
        assert_eq!(session.state(), CallState::Ending);
        assert!(handles.to_ai.is_closed());
        assert!(handles.to_telephony.is_closed());

        assert!(!session.request_end(EndReason::OperatorEnded));
        assert_eq!(session.end_reason(), Some(EndReason::CallerHungUp));
    }

    #[test]
    fn test_finish_builds_finalize_event() {
        let (session, _handles) = streaming_session();
        session.route_caller_audio(vec![0xFF; 160]);
        session.append_transcript(Speaker::Assistant, "Hello, how can I help?");
        session.request_end(EndReason::CallerHungUp);

        let event = session.finish().unwrap();
        assert_eq!(event.call_id, "CA1");
        assert_eq!(event.end_reason, EndReason::CallerHungUp);
        assert_eq!(event.transcript.len(), 1);
        assert!(!event.takeover_occurred);
        assert_eq!(event.frames.unwrap().to_ai.pushed, 1);
        assert_eq!(session.state(), CallState::Ended);

        // ENDED is terminal
        assert!(session.finish().is_err());
        assert!(session.begin_takeover().is_err());
    }

    #[tokio::test]
    async fn test_observer_receives_call_ended_after_hangup() {
        let (session, _handles) = streaming_session();
        let sub = session.subscribe_observer(8_000).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let delivery = tokio::spawn(crate::observer::deliver("CA1".to_string(), sub, tx));

        session.request_end(EndReason::CallerHungUp);
        session.finish().unwrap();

        tokio::time::timeout(Duration::from_secs(1), delivery)
            .await
            .unwrap()
            .unwrap();
        let mut messages = Vec::new();
        while let Some(message) = rx.recv().await {
            messages.push(message);
        }
        let ended: Vec<_> = messages
            .iter()
            .filter(|m| m.contains("\"messageType\":\"callEnded\""))
            .collect();
        assert_eq!(ended.len(), 1);
        assert!(ended[0].contains("caller_hung_up"));
    }

    #[test]
    fn test_finish_requires_ending() {
        let (session, _handles) = streaming_session();
        assert!(session.finish().is_err());
    }

    #[test]
    fn test_observer_subscription_only_while_active() {
        let session = CallSession::new("CA1", SessionSettings::default());
        assert!(session.subscribe_observer(24_000).is_none());

        let _handles = session.begin_streaming().unwrap();
        let sub = session.subscribe_observer(24_000).unwrap();
        session.route_caller_audio(vec![0xFF; 160]);
        assert_eq!(sub.queue.len(), 1);

        session.request_end(EndReason::OperatorEnded);
        assert!(session.subscribe_observer(24_000).is_none());
    }

    #[test]
    fn test_assistant_transcript_dropped_during_takeover() {
        let (session, _handles) = streaming_session();
        session.begin_takeover().unwrap();
        assert!(session.append_transcript(Speaker::Assistant, "late assistant text").is_none());
        assert!(session.append_transcript(Speaker::HumanAgent, "Hi, this is Sam").is_some());
        assert_eq!(session.turn_count(), 1);
    }

    #[test]
    fn test_operator_detach_resumes_ai() {
        let (session, _handles) = streaming_session();
        let operator = session.attach_operator().unwrap();
        session.begin_takeover().unwrap();

        assert!(session.detach_operator(&operator));
        assert_eq!(session.state(), CallState::Streaming);
        assert!(operator.is_closed());
        assert!(!session.operator_attached());
    }

    #[tokio::test]
    async fn test_end_while_initiated_aborts_connect() {
        let session = Arc::new(CallSession::new("CA1", SessionSettings::default()));
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.connect_aborted().await })
        };

        assert!(session.request_end(EndReason::CallerHungUp));
        assert_eq!(waiter.await.unwrap(), EndReason::CallerHungUp);
        assert_eq!(session.state(), CallState::Initiated);

        let event = session.finish_without_streaming(EndReason::CallerHungUp).unwrap();
        assert!(event.frames.is_none());
        assert_eq!(session.state(), CallState::Ended);
    }

    #[tokio::test]
    async fn test_legs_closed_waits_for_both() {
        let session = Arc::new(CallSession::new("CA1", SessionSettings::default()));
        session.mark_leg_closed(Leg::Telephony);

        let pending = tokio::time::timeout(Duration::from_millis(30), session.legs_closed()).await;
        assert!(pending.is_err());

        session.mark_leg_closed(Leg::Ai);
        tokio::time::timeout(Duration::from_secs(1), session.legs_closed())
            .await
            .unwrap();
    }
}
