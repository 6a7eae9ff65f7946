//! # Telephony Stream Adapter
//!
//! Owns the telephony half of a call once streaming has begun:
//!
//! - the **inbound loop** parses provider messages, drops out-of-sequence and
//!   undecodable media, and hands caller audio to the session for routing
//! - the **outbound pump** drains the AI→telephony queue into `media`
//!   messages and turns `TelephonyControl::Clear` into a `clear` message
//!
//! Both halves run inside one future so aborting the adapter task stops both.
//! When the pump finishes it drops its sender, which closes the socket.

use crate::call::{CallSession, EndReason, Leg, TelephonyControl};
use crate::audio::FrameQueue;
use crate::telephony::protocol::{self, InboundMessage, OutboundMessage, StreamStart};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Read provider messages until the stream `start` arrives.
///
/// Returns `None` if the caller hangs up or the connection drops first.
pub async fn await_start(incoming: &mut mpsc::UnboundedReceiver<String>) -> Option<StreamStart> {
    while let Some(text) = incoming.recv().await {
        match protocol::parse(&text) {
            Ok(InboundMessage::Start(msg)) => {
                info!(
                    call_id = %msg.start.call_sid,
                    stream_sid = %msg.start.stream_sid,
                    "Media stream started"
                );
                return Some(msg.start);
            }
            Ok(InboundMessage::Connected(msg)) => {
                debug!(protocol = ?msg.protocol, "Media stream connected");
            }
            Ok(InboundMessage::Media(_)) => {
                warn!("Dropping media received before stream start");
            }
            Ok(InboundMessage::Stop(_)) => {
                info!("Stream stopped before start");
                return None;
            }
            Ok(other) => {
                trace!(message = ?other, "Ignoring pre-start message");
            }
            Err(err) => {
                warn!(error = %err, "Malformed telephony message");
            }
        }
    }
    None
}

pub struct TelephonyAdapter {
    session: Arc<CallSession>,
    stream_sid: String,
    outgoing: mpsc::UnboundedSender<String>,
    incoming: mpsc::UnboundedReceiver<String>,
    to_telephony: Arc<FrameQueue>,
    control: mpsc::UnboundedReceiver<TelephonyControl>,
}

impl TelephonyAdapter {
    pub fn new(
        session: Arc<CallSession>,
        stream_sid: String,
        outgoing: mpsc::UnboundedSender<String>,
        incoming: mpsc::UnboundedReceiver<String>,
        to_telephony: Arc<FrameQueue>,
        control: mpsc::UnboundedReceiver<TelephonyControl>,
    ) -> Self {
        Self {
            session,
            stream_sid,
            outgoing,
            incoming,
            to_telephony,
            control,
        }
    }

    /// Run until the caller hangs up or the session ends, then report the
    /// telephony leg closed.
    pub async fn run(self) {
        let TelephonyAdapter {
            session,
            stream_sid,
            outgoing,
            incoming,
            to_telephony,
            control,
        } = self;

        let inbound = receive_loop(session.clone(), incoming);
        let outbound = send_loop(session.call_id().to_string(), stream_sid, outgoing, to_telephony, control);
        let (received, sent) = tokio::join!(inbound, outbound);

        info!(call_id = %session.call_id(), received, sent, "Telephony adapter closed");
        session.mark_leg_closed(Leg::Telephony);
    }
}

async fn receive_loop(session: Arc<CallSession>, mut incoming: mpsc::UnboundedReceiver<String>) -> u64 {
    let mut last_sequence: Option<u64> = None;
    let mut received = 0;

    loop {
        let text = tokio::select! {
            text = incoming.recv() => text,
            _ = session.closing() => break,
        };

        let Some(text) = text else {
            session.request_end(EndReason::TelephonyDisconnected);
            break;
        };

        let message = match protocol::parse(&text) {
            Ok(message) => message,
            Err(err) => {
                warn!(call_id = %session.call_id(), error = %err, "Malformed telephony message");
                continue;
            }
        };

        match message {
            InboundMessage::Media(media) => {
                if let Some(sequence) = media.sequence() {
                    if last_sequence.is_some_and(|last| sequence <= last) {
                        warn!(call_id = %session.call_id(), sequence, "Out-of-sequence media skipped");
                        continue;
                    }
                    last_sequence = Some(sequence);
                }

                match media.decode_payload() {
                    Ok(payload) => {
                        let route = session.route_caller_audio(payload);
                        received += 1;
                        trace!(call_id = %session.call_id(), route = ?route, "Caller frame");
                    }
                    Err(err) => {
                        warn!(call_id = %session.call_id(), error = %err, "Dropping undecodable media");
                    }
                }
            }
            InboundMessage::Stop(_) => {
                info!(call_id = %session.call_id(), "Caller hung up");
                session.request_end(EndReason::CallerHungUp);
                break;
            }
            InboundMessage::Mark(mark) => {
                debug!(call_id = %session.call_id(), mark = %mark.mark.name, "Playback mark");
            }
            InboundMessage::Dtmf(dtmf) => {
                info!(call_id = %session.call_id(), digit = %dtmf.dtmf.digit, "DTMF received");
            }
            InboundMessage::Start(_) => {
                warn!(call_id = %session.call_id(), "Duplicate stream start ignored");
            }
            InboundMessage::Connected(_) | InboundMessage::Unknown => {}
        }
    }

    received
}

async fn send_loop(
    call_id: String,
    stream_sid: String,
    outgoing: mpsc::UnboundedSender<String>,
    to_telephony: Arc<FrameQueue>,
    mut control: mpsc::UnboundedReceiver<TelephonyControl>,
) -> u64 {
    let mut sent = 0;

    loop {
        let message = tokio::select! {
            biased;
            Some(command) = control.recv() => match command {
                TelephonyControl::Clear => OutboundMessage::clear(&stream_sid),
            },
            frame = to_telephony.pop() => match frame {
                Some(frame) => OutboundMessage::media(&stream_sid, frame.payload()),
                None => break,
            },
        };

        let json = match message.to_json() {
            Ok(json) => json,
            Err(err) => {
                warn!(call_id = %call_id, error = %err, "Failed to encode telephony message");
                continue;
            }
        };
        if outgoing.send(json).is_err() {
            debug!(call_id = %call_id, "Telephony socket gone");
            break;
        }
        sent += 1;
    }

    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallState, SessionSettings};
    use crate::transport::Link;
    use std::time::Duration;

    fn media(sequence: u64, payload: &str) -> String {
        format!(
            r#"{{"event":"media","sequenceNumber":"{}","media":{{"payload":"{}"}},"streamSid":"MZ1"}}"#,
            sequence, payload
        )
    }

    #[tokio::test]
    async fn test_await_start_skips_preamble() {
        let (provider, mut bridge) = Link::pair();
        provider.outgoing.send(r#"{"event":"connected","protocol":"Call"}"#.to_string()).unwrap();
        provider.outgoing.send(media(1, "//8=")).unwrap();
        provider
            .outgoing
            .send(r#"{"event":"start","start":{"streamSid":"MZ1","callSid":"CA1"}}"#.to_string())
            .unwrap();

        let start = await_start(&mut bridge.incoming).await.unwrap();
        assert_eq!(start.call_sid, "CA1");
    }

    #[tokio::test]
    async fn test_adapter_relays_and_hangs_up() {
        let session = Arc::new(CallSession::new("CA1", SessionSettings::default()));
        let handles = session.begin_streaming().unwrap();
        let (mut provider, bridge) = Link::pair();
        let (outgoing, incoming) = bridge.split();

        let adapter = TelephonyAdapter::new(
            session.clone(),
            "MZ1".to_string(),
            outgoing,
            incoming,
            handles.to_telephony.clone(),
            handles.telephony_control,
        );
        let task = tokio::spawn(adapter.run());

        provider.outgoing.send(media(1, "//8=")).unwrap();
        provider.outgoing.send(media(1, "//8=")).unwrap(); // duplicate sequence
        provider.outgoing.send(media(2, "***")).unwrap(); // undecodable
        provider.outgoing.send(media(3, "//8=")).unwrap();

        session.push_assistant_audio(vec![0x7F; 160]);
        let sent = provider.incoming.recv().await.unwrap();
        assert!(sent.contains(r#""event":"media""#));

        provider.outgoing.send(r#"{"event":"stop"}"#.to_string()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        assert_eq!(handles.to_ai.stats().pushed, 2);
        assert_eq!(session.state(), CallState::Ending);
        assert_eq!(session.end_reason(), Some(EndReason::CallerHungUp));
        // pump dropped its sender, so the socket side sees the close
        assert_eq!(provider.incoming.recv().await, None);
    }

    #[tokio::test]
    async fn test_clear_command_is_forwarded() {
        let session = Arc::new(CallSession::new("CA1", SessionSettings::default()));
        let handles = session.begin_streaming().unwrap();
        let (mut provider, bridge) = Link::pair();
        let (outgoing, incoming) = bridge.split();

        tokio::spawn(
            TelephonyAdapter::new(
                session.clone(),
                "MZ1".to_string(),
                outgoing,
                incoming,
                handles.to_telephony.clone(),
                handles.telephony_control,
            )
            .run(),
        );

        session.interrupt(false);
        let sent = provider.incoming.recv().await.unwrap();
        assert_eq!(sent, r#"{"event":"clear","streamSid":"MZ1"}"#);
    }

    #[tokio::test]
    async fn test_socket_drop_ends_call() {
        let session = Arc::new(CallSession::new("CA1", SessionSettings::default()));
        let handles = session.begin_streaming().unwrap();
        let (provider, bridge) = Link::pair();
        let (outgoing, incoming) = bridge.split();

        let task = tokio::spawn(
            TelephonyAdapter::new(
                session.clone(),
                "MZ1".to_string(),
                outgoing,
                incoming,
                handles.to_telephony.clone(),
                handles.telephony_control,
            )
            .run(),
        );

        drop(provider);
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(session.end_reason(), Some(EndReason::TelephonyDisconnected));
    }
}
