//! # Telephony Media Stream
//!
//! The provider connects here once per call. The actor is a pump between the
//! socket and a `Link`: text frames go to the call bridge, and whatever the
//! bridge sends back is written to the socket. Call logic lives entirely in
//! `call::run_call`, which runs as its own task.
//!
//! ## Connection lifecycle:
//! 1. Upgrade → bridge task spawned with settings captured from the current config
//! 2. Provider frames (`connected`, `start`, `media`, `stop`) forwarded verbatim
//! 3. Bridge drops its sender → outbound stream ends → socket closed
//! 4. Provider disconnects → actor stops → inbound sender dropped → bridge sees it

use crate::call::run_call;
use crate::state::AppState;
use crate::transport::Link;
use crate::websocket::{CLIENT_TIMEOUT, HEARTBEAT_INTERVAL};
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, trace, warn};

pub struct MediaStreamSocket {
    /// Frames from the provider, consumed by the telephony adapter
    inbound: mpsc::UnboundedSender<String>,

    /// Frames for the provider; taken when the actor starts
    outbound: Option<mpsc::UnboundedReceiver<String>>,

    last_heartbeat: Instant,
}

impl MediaStreamSocket {
    pub fn new(link: Link) -> Self {
        let (inbound, outbound) = link.split();
        Self {
            inbound,
            outbound: Some(outbound),
            last_heartbeat: Instant::now(),
        }
    }
}

impl Actor for MediaStreamSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        debug!("Media stream connected");

        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(outbound));
        }

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Media stream heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        debug!("Media stream closed");
    }
}

/// Frames from the provider.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MediaStreamSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                if self.inbound.send(text.to_string()).is_err() {
                    // Bridge already finished; nothing left to feed.
                    trace!("Dropping media frame after call ended");
                }
            }
            Ok(ws::Message::Binary(_)) => {
                warn!("Ignoring binary frame on media stream");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Media stream closed by provider: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!("Media stream protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Frames from the bridge.
impl StreamHandler<String> for MediaStreamSocket {
    fn handle(&mut self, text: String, ctx: &mut Self::Context) {
        ctx.text(text);
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!("Bridge closed its side of the media stream");
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// `GET /media-stream`
///
/// Upgrades the connection and starts one bridge task for it. The bridge
/// settings are read now, so config changes only affect later calls.
pub async fn media_stream(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("Media stream connection from {:?}", req.connection_info().peer_addr());

    let settings = app_state.bridge_settings()?;
    let (socket_side, bridge_side) = Link::pair();

    let response = ws::start(MediaStreamSocket::new(socket_side), &req, stream)?;

    let ctx = app_state.bridge.clone();
    tokio::spawn(async move {
        run_call(ctx, settings, bridge_side).await;
    });

    Ok(response)
}
