//! # Observer Fan-out
//!
//! Read-only taps for dashboards. Publishing clones the event into each
//! subscriber's own drop-oldest queue and returns immediately, so a stalled
//! dashboard costs the relay one bounded push per event and nothing more.
//! Transcoding to the subscriber's sample rate happens later, on that
//! subscriber's delivery task.

use crate::audio::{codec, AudioFrame, BoundedQueue};
use crate::call::{CallState, EndReason, Speaker, TranscriptTurn};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Something worth showing on a dashboard.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    Audio { speaker: Speaker, frame: AudioFrame },
    Transcript(TranscriptTurn),
    Takeover { active: bool },
    State(CallState),
    Ended { reason: EndReason, duration_secs: f64 },
}

/// Wire format pushed to dashboard clients.
#[derive(Debug, Serialize)]
#[serde(tag = "messageType", rename_all = "camelCase")]
pub enum ObserverMessage {
    #[serde(rename_all = "camelCase")]
    Audio {
        call_sid: String,
        speaker: Speaker,
        /// Base64 PCM16 little-endian at `sample_rate`
        audio: String,
        format: &'static str,
        sample_rate: u32,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Transcription {
        call_sid: String,
        speaker: Speaker,
        text: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    TakeoverStatus { call_sid: String, active: bool },
    #[serde(rename_all = "camelCase")]
    CallStatus { call_sid: String, state: CallState },
    #[serde(rename_all = "camelCase")]
    CallEnded {
        call_sid: String,
        reason: EndReason,
        duration_secs: f64,
    },
    Ping { timestamp: i64 },
    Error { message: String },
}

/// A live subscription. Dropping it does not unsubscribe; call
/// `ObserverHub::unsubscribe` with its id.
pub struct Subscription {
    pub id: Uuid,
    pub sample_rate: u32,
    pub queue: Arc<BoundedQueue<ObserverEvent>>,
}

/// Per-call set of dashboard subscribers.
pub struct ObserverHub {
    call_id: String,
    capacity: usize,
    subscribers: RwLock<HashMap<Uuid, Arc<BoundedQueue<ObserverEvent>>>>,
}

impl ObserverHub {
    pub fn new(call_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            call_id: call_id.into(),
            capacity,
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, sample_rate: u32) -> Subscription {
        let id = Uuid::new_v4();
        let queue = Arc::new(BoundedQueue::new(self.capacity));
        self.subscribers.write().insert(id, queue.clone());
        debug!(call_id = %self.call_id, subscriber = %id, sample_rate, "Observer subscribed");
        Subscription { id, sample_rate, queue }
    }

    pub fn unsubscribe(&self, id: &Uuid) -> bool {
        match self.subscribers.write().remove(id) {
            Some(queue) => {
                queue.close();
                debug!(call_id = %self.call_id, subscriber = %id, "Observer unsubscribed");
                true
            }
            None => false,
        }
    }

    pub fn publish(&self, event: ObserverEvent) {
        let subscribers = self.subscribers.read();
        for queue in subscribers.values() {
            queue.push(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Close every subscriber channel. Delivery tasks flush what is queued, then finish.
    pub fn close(&self) {
        let mut subscribers = self.subscribers.write();
        for queue in subscribers.values() {
            queue.close_after_drain();
        }
        subscribers.clear();
    }
}

/// Convert an event into the message a subscriber at `sample_rate` receives.
pub fn render(call_id: &str, event: &ObserverEvent, sample_rate: u32) -> ObserverMessage {
    let call_sid = call_id.to_string();
    match event {
        ObserverEvent::Audio { speaker, frame } => {
            let linear = codec::frame_to_linear(frame, sample_rate);
            ObserverMessage::Audio {
                call_sid,
                speaker: *speaker,
                audio: B64.encode(codec::pcm16_to_bytes(&linear)),
                format: "pcm16",
                sample_rate,
                sequence: frame.sequence,
                timestamp: frame.captured_at,
            }
        }
        ObserverEvent::Transcript(turn) => ObserverMessage::Transcription {
            call_sid,
            speaker: turn.speaker,
            text: turn.text.clone(),
            timestamp: turn.timestamp,
        },
        ObserverEvent::Takeover { active } => ObserverMessage::TakeoverStatus {
            call_sid,
            active: *active,
        },
        ObserverEvent::State(state) => ObserverMessage::CallStatus {
            call_sid,
            state: *state,
        },
        ObserverEvent::Ended { reason, duration_secs } => ObserverMessage::CallEnded {
            call_sid,
            reason: *reason,
            duration_secs: *duration_secs,
        },
    }
}

/// Drain a subscription into a text sink until the hub closes it or the
/// sink goes away. Returns the number of messages delivered.
pub async fn deliver(call_id: String, subscription: Subscription, out: mpsc::UnboundedSender<String>) -> u64 {
    let mut delivered = 0;
    while let Some(event) = subscription.queue.pop().await {
        let message = render(&call_id, &event, subscription.sample_rate);
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(err) => {
                warn!(call_id = %call_id, error = %err, "Failed to serialize observer event");
                continue;
            }
        };
        if out.send(json).is_err() {
            break;
        }
        delivered += 1;
    }
    debug!(call_id = %call_id, subscriber = %subscription.id, delivered, "Observer delivery finished");
    delivered
}
