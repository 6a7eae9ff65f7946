//! Dashboard feed for one live call.
//!
//! Each connection owns a subscription on the call's observer hub. Events are
//! rendered on a separate delivery task (so resampling never runs on the
//! relay path) and arrive here as ready-to-send JSON.

use crate::call::CallSession;
use crate::error::BridgeError;
use crate::observer::{deliver, ObserverMessage, Subscription};
use crate::state::AppState;
use crate::websocket::{CLIENT_TIMEOUT, HEARTBEAT_INTERVAL};
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct DashboardQuery {
    pub call_id: String,
    pub rate: Option<u32>,
    pub token: Option<String>,
}

pub struct DashboardSocket {
    call_id: String,
    session: Option<Arc<CallSession>>,
    subscription: Option<Subscription>,
    subscriber_id: Option<Uuid>,
    last_heartbeat: Instant,
}

impl DashboardSocket {
    fn new(call_id: String, attached: Option<(Arc<CallSession>, Subscription)>) -> Self {
        let (session, subscription) = match attached {
            Some((session, subscription)) => (Some(session), Some(subscription)),
            None => (None, None),
        };
        Self {
            call_id,
            session,
            subscriber_id: subscription.as_ref().map(|s| s.id),
            subscription,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, message: &ObserverMessage, ctx: &mut ws::WebsocketContext<Self>) {
        if let Ok(json) = serde_json::to_string(message) {
            ctx.text(json);
        }
    }
}

impl Actor for DashboardSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let Some(subscription) = self.subscription.take() else {
            info!(call_id = %self.call_id, "Dashboard asked for a call that is not live");
            let error = ObserverMessage::Error {
                message: format!("Call '{}' is not active", self.call_id),
            };
            self.send(&error, ctx);
            ctx.close(Some(ws::CloseCode::Policy.into()));
            ctx.stop();
            return;
        };

        info!(call_id = %self.call_id, subscriber = %subscription.id, "Dashboard subscribed");
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(deliver(self.call_id.clone(), subscription, tx));
        ctx.add_stream(UnboundedReceiverStream::new(rx));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(call_id = %act.call_id, "Dashboard heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            let ping = ObserverMessage::Ping {
                timestamp: Utc::now().timestamp_millis(),
            };
            act.send(&ping, ctx);
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let (Some(session), Some(id)) = (&self.session, &self.subscriber_id) {
            session.unsubscribe_observer(id);
            debug!(call_id = %self.call_id, subscriber = %id, "Dashboard disconnected");
        }
    }
}

/// Dashboards only listen; anything they send besides control frames is ignored.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for DashboardSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) | Ok(ws::Message::Text(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => {}
            Err(err) => {
                warn!(call_id = %self.call_id, "Dashboard protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Rendered events from the delivery task.
impl StreamHandler<String> for DashboardSocket {
    fn handle(&mut self, json: String, ctx: &mut Self::Context) {
        ctx.text(json);
    }

    /// The hub closed the subscription, normally because the call ended.
    fn finished(&mut self, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// `GET /dashboard-stream?call_id=<id>&rate=<hz>&token=<t>`
pub async fn dashboard_stream(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<DashboardQuery>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let config = app_state.get_config();

    if let Some(expected) = &config.observer.token {
        if query.token.as_deref() != Some(expected.as_str()) {
            warn!(call_id = %query.call_id, "Rejecting dashboard with a bad token");
            return Ok(HttpResponse::Unauthorized().json(serde_json::json!({
                "error": {
                    "type": "unauthorized",
                    "message": "Invalid or missing observer token",
                    "timestamp": Utc::now().to_rfc3339(),
                }
            })));
        }
    }

    let rate = query.rate.unwrap_or(config.observer.sample_rate);
    if rate == 0 || rate > 48_000 {
        return Err(BridgeError::BadRequest(format!("Unsupported sample rate {}", rate)).into());
    }

    let attached = app_state
        .registry()
        .lookup(&query.call_id)
        .and_then(|session| session.subscribe_observer(rate).map(|sub| (session, sub)));

    ws::start(DashboardSocket::new(query.call_id.clone(), attached), &req, stream)
}
