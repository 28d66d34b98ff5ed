//! # Snap Lens WebSocket Handler
//!
//! One actor per lens client at `/snap-lens`. The actor registers with the
//! hub, forwards each text frame to it, writes the sender-targeted replies and
//! lets the hub broadcast the rest.

use crate::lens::hub::{LensHub, LensOutbound};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct LensSocket {
    id: Uuid,
    hub: Arc<LensHub>,
    last_heartbeat: Instant,
    keepalive_interval: Duration,
    client_timeout: Duration,
}

impl LensSocket {
    pub fn new(hub: Arc<LensHub>, keepalive_interval: Duration, client_timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            hub,
            last_heartbeat: Instant::now(),
            keepalive_interval,
            client_timeout,
        }
    }
}

impl Actor for LensSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.hub.connect(self.id, ctx.address().recipient());

        ctx.text(
            json!({
                "type": "info",
                "message": "Connected to Snap Lens Communication Server"
            })
            .to_string(),
        );

        ctx.run_interval(self.keepalive_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(client_id = %act.id, "Lens client heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.hub.disconnect(self.id);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for LensSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                debug!(client_id = %self.id, bytes = text.len(), "Lens message received");

                let deliveries = self.hub.handle_text(&text);
                for reply in self.hub.dispatch(self.id, deliveries) {
                    ctx.text(reply.to_string());
                }
            }
            Ok(ws::Message::Binary(_)) => {
                ctx.text(
                    json!({
                        "type": "error",
                        "message": "Binary messages are not supported"
                    })
                    .to_string(),
                );
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(client_id = %self.id, "Lens client closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(client_id = %self.id, "Lens WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<LensOutbound> for LensSocket {
    type Result = ();

    fn handle(&mut self, msg: LensOutbound, ctx: &mut Self::Context) {
        match msg {
            LensOutbound::Text(text) => ctx.text(text),
            LensOutbound::Close => {
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            }
        }
    }
}

/// WebSocket endpoint handler for `/snap-lens`.
pub async fn lens_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(peer = ?req.connection_info().peer_addr(), "New Snap Lens connection request");
    let relay = state.get_config().relay;
    let socket = LensSocket::new(state.lens.clone(), relay.keepalive_interval(), relay.client_timeout());
    ws::start(socket, &req, stream)
}
