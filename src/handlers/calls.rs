//! Control API for live calls: inspect, hand over to a human, hand back, hang up.

use crate::call::{CallState, EndReason};
use crate::error::BridgeError;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /calls`
pub async fn list_calls(state: web::Data<AppState>) -> Result<HttpResponse, BridgeError> {
    let calls = state.registry().snapshots();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": calls.len(),
        "calls": calls
    })))
}

/// `GET /calls/{call_id}`: snapshot plus transcript so far.
pub async fn get_call(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, BridgeError> {
    let session = state.registry().get(&path)?;

    Ok(HttpResponse::Ok().json(json!({
        "call": session.snapshot(),
        "metadata": session.metadata(),
        "transcript": session.transcript()
    })))
}

/// `POST /calls/{call_id}/takeover`
pub async fn takeover_call(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, BridgeError> {
    let session = state.registry().get(&path)?;
    session.begin_takeover()?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "call": session.snapshot()
    })))
}

/// `POST /calls/{call_id}/resume`
pub async fn resume_call(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, BridgeError> {
    let session = state.registry().get(&path)?;
    session.resume_ai()?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "call": session.snapshot()
    })))
}

/// `POST /calls/{call_id}/end`
pub async fn end_call(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, BridgeError> {
    let session = state.registry().get(&path)?;

    if !session.request_end(EndReason::OperatorEnded) {
        return Err(BridgeError::InvalidStateTransition {
            call_id: session.call_id().to_string(),
            from: session.state(),
            operation: "end",
        });
    }

    // An INITIATED call stays INITIATED until its bridge task notices the abort.
    let accepted_state = match session.state() {
        CallState::Initiated => "ending",
        other => other.as_str(),
    };

    Ok(HttpResponse::Accepted().json(json!({
        "status": "accepted",
        "call_id": session.call_id(),
        "state": accepted_state
    })))
}
