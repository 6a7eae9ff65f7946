//! # Call Bridge
//!
//! One task per telephony connection. It waits for the stream `start`,
//! registers the call, connects the AI leg and then supervises both adapters
//! until the call is over.
//!
//! ## Lifecycle:
//! 1. `start` received → session registered as `INITIATED`
//! 2. AI connect (bounded retry) races caller hang-up and operator end
//! 3. success → `STREAMING`; adapters and the optional duration timer spawned
//! 4. any end request → `ENDING`; both legs get `shutdown_grace` to close
//! 5. `ENDED` → finalize event emitted, session evicted from the registry
//!
//! If the AI leg never comes up the session goes straight from `INITIATED`
//! to `ENDED` and no relay queues are ever created.

use crate::call::registry::SessionRegistry;
use crate::call::session::{CallMetadata, CallSession, FinalizeEvent, SessionSettings};
use crate::call::state::EndReason;
use crate::error::BridgeResult;
use crate::realtime::{connect_with_retry, AiAdapter, RealtimeConnector, RealtimeSettings};
use crate::telephony::{await_start, protocol, InboundMessage, TelephonyAdapter};
use crate::transport::Link;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Long-lived collaborators shared by every call.
pub struct BridgeContext {
    pub registry: Arc<SessionRegistry>,
    pub connector: Arc<dyn RealtimeConnector>,
    pub finalize_tx: mpsc::UnboundedSender<FinalizeEvent>,
}

/// Settings captured when a call starts; later config updates do not affect it.
#[derive(Debug, Clone, Default)]
pub struct BridgeSettings {
    pub session: SessionSettings,
    pub realtime: RealtimeSettings,
}

/// Bridge one telephony connection to the AI service. Returns the finalize
/// event, or `None` if the stream never produced a registered call.
pub async fn run_call(ctx: Arc<BridgeContext>, settings: BridgeSettings, telephony: Link) -> Option<FinalizeEvent> {
    let (outgoing, mut incoming) = telephony.split();

    let start = await_start(&mut incoming).await?;
    let call_id = start.call_sid.clone();

    let session = match ctx.registry.create(&call_id, settings.session.clone()) {
        Ok(session) => session,
        Err(err) => {
            warn!(call_id = %call_id, error = %err, "Rejecting media stream");
            return None;
        }
    };
    session.set_metadata(CallMetadata {
        stream_sid: Some(start.stream_sid.clone()),
        account_sid: start.account_sid.clone(),
        custom_parameters: start.custom_parameters.clone(),
    });

    let connected = tokio::select! {
        result = connect_with_retry(ctx.connector.as_ref(), &settings.realtime.retry, &call_id) => {
            result.map_err(|_| EndReason::AiUnavailable)
        }
        reason = hangup_before_streaming(&mut incoming) => Err(reason),
        reason = session.connect_aborted() => Err(reason),
    };

    let ai_link = match connected {
        Ok(link) => link,
        Err(reason) => {
            info!(call_id = %call_id, reason = %reason, "Call ended before streaming");
            return finalize(&ctx, &session, session.finish_without_streaming(reason));
        }
    };

    let handles = match session.begin_streaming() {
        Ok(handles) => handles,
        Err(err) => {
            warn!(call_id = %call_id, error = %err, "Could not start streaming");
            let reason = session.end_reason().unwrap_or(EndReason::AiUnavailable);
            return finalize(&ctx, &session, session.finish_without_streaming(reason));
        }
    };

    let ai_task = tokio::spawn(
        AiAdapter::new(
            session.clone(),
            settings.realtime.clone(),
            ctx.connector.clone(),
            handles.to_ai.clone(),
            handles.ai_control,
        )
        .run(ai_link),
    );
    let telephony_task = tokio::spawn(
        TelephonyAdapter::new(
            session.clone(),
            start.stream_sid,
            outgoing,
            incoming,
            handles.to_telephony.clone(),
            handles.telephony_control,
        )
        .run(),
    );
    let timer = settings
        .session
        .max_call_duration
        .map(|limit| tokio::spawn(duration_limit(session.clone(), limit)));

    // an end request that raced the connect was recorded but not yet applied
    if let Some(reason) = session.end_reason() {
        session.request_end(reason);
    }

    session.closing().await;
    let grace = session.settings().shutdown_grace;
    if tokio::time::timeout(grace, session.legs_closed()).await.is_err() {
        warn!(call_id = %call_id, grace_ms = grace.as_millis() as u64, "Adapters still running after grace period, aborting");
        ai_task.abort();
        telephony_task.abort();
    }
    if let Some(timer) = timer {
        timer.abort();
    }

    finalize(&ctx, &session, session.finish())
}

/// Watch the telephony side while the AI leg is connecting.
async fn hangup_before_streaming(incoming: &mut mpsc::UnboundedReceiver<String>) -> EndReason {
    while let Some(text) = incoming.recv().await {
        match protocol::parse(&text) {
            Ok(InboundMessage::Stop(_)) => return EndReason::CallerHungUp,
            Ok(InboundMessage::Media(_)) => trace!("Dropping media while AI connects"),
            Ok(_) => {}
            Err(err) => debug!(error = %err, "Malformed telephony message"),
        }
    }
    EndReason::TelephonyDisconnected
}

async fn duration_limit(session: Arc<CallSession>, limit: std::time::Duration) {
    tokio::select! {
        _ = tokio::time::sleep(limit) => {
            info!(call_id = %session.call_id(), limit_secs = limit.as_secs(), "Maximum call duration reached");
            session.request_end(EndReason::MaxDurationReached);
        }
        _ = session.closing() => {}
    }
}

fn finalize(
    ctx: &BridgeContext,
    session: &CallSession,
    result: BridgeResult<FinalizeEvent>,
) -> Option<FinalizeEvent> {
    let event = match result {
        Ok(event) => event,
        Err(err) => {
            warn!(call_id = %session.call_id(), error = %err, "Call could not be finalized");
            return None;
        }
    };

    info!(
        call_id = %event.call_id,
        reason = %event.end_reason,
        duration_secs = event.duration_secs,
        turns = event.transcript.len(),
        takeover = event.takeover_occurred,
        "Call ended"
    );
    if ctx.finalize_tx.send(event.clone()).is_err() {
        debug!(call_id = %event.call_id, "No finalize listener");
    }
    if let Err(err) = ctx.registry.remove(&event.call_id) {
        warn!(call_id = %event.call_id, error = %err, "Failed to evict call");
    }
    Some(event)
}
