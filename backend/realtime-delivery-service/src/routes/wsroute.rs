use crate::middleware::guards::User;
use crate::state::AppState;
use crate::websocket::message_types::{WsInboundEvent, WsOutboundEvent};
use crate::websocket::{ConnectionHandle, ConnectionId, ConnectionRegistry, Frame};
use actix::{Actor, ActorContext, AsyncContext, StreamHandler};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::Receiver;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

// WebSocket Actor
//
// One actor per connection. Outbound frames arrive through the registry's
// bounded channel; when the registry drops the connection the channel closes
// and the session stops.
struct WsSession {
    user_id: Uuid,
    connection_id: ConnectionId,
    registry: ConnectionRegistry,
    hb: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    outbound: Option<Receiver<Frame>>,
}

impl WsSession {
    fn new(
        user_id: Uuid,
        connection_id: ConnectionId,
        registry: ConnectionRegistry,
        outbound: Receiver<Frame>,
        heartbeat_interval: Duration,
        client_timeout: Duration,
    ) -> Self {
        Self {
            user_id,
            connection_id,
            registry,
            hb: Instant::now(),
            heartbeat_interval,
            client_timeout,
            outbound: Some(outbound),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.hb) > act.client_timeout {
                tracing::warn!(
                    user_id = %act.user_id,
                    connection_id = %act.connection_id,
                    "WebSocket heartbeat failed, disconnecting"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn send_event(&self, event: &WsOutboundEvent, ctx: &mut ws::WebsocketContext<Self>) {
        match event.to_json() {
            Ok(json) => ctx.text(json),
            Err(e) => tracing::error!(error = %e, "failed to encode outbound event"),
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(
            user_id = %self.user_id,
            connection_id = %self.connection_id,
            "WebSocket session started"
        );

        self.hb(ctx);

        if let Some(rx) = self.outbound.take() {
            ctx.add_stream(ReceiverStream::new(rx));
        }

        self.send_event(
            &WsOutboundEvent::Connected {
                connection_id: self.connection_id.as_uuid(),
                user_id: self.user_id,
            },
            ctx,
        );
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(
            user_id = %self.user_id,
            connection_id = %self.connection_id,
            "WebSocket session stopped"
        );

        // Covers every exit path: close frame, protocol error, heartbeat
        // timeout and registry-initiated drops (a no-op then)
        let registry = self.registry.clone();
        let user_id = self.user_id;
        let connection_id = self.connection_id;
        actix::spawn(async move {
            registry.unregister(user_id, connection_id).await;
        });
    }
}

// Frames pushed by the registry
impl StreamHandler<Frame> for WsSession {
    fn handle(&mut self, frame: Frame, ctx: &mut Self::Context) {
        ctx.text(frame.as_str());
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        tracing::debug!(
            user_id = %self.user_id,
            connection_id = %self.connection_id,
            "outbound channel closed"
        );
        ctx.stop();
    }
}

// Handle WebSocket protocol messages
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.hb = Instant::now();
                match serde_json::from_str::<WsInboundEvent>(&text) {
                    Ok(WsInboundEvent::Ping) => self.send_event(&WsOutboundEvent::Pong, ctx),
                    Err(e) => {
                        tracing::debug!(user_id = %self.user_id, error = %e, "ignoring unknown client event");
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                tracing::debug!(user_id = %self.user_id, "ignoring binary frame");
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(e) => {
                tracing::warn!(user_id = %self.user_id, error = %e, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// GET /ws
/// Upgrade to a WebSocket that receives `message.new` frames for every
/// conversation the user belongs to
#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    user: User,
) -> Result<HttpResponse, Error> {
    let (handle, rx) = ConnectionHandle::channel(user.id, state.config.ws_send_buffer);
    let connection_id = handle.id();

    // Registered before the upgrade so nothing published meanwhile is missed
    state.registry.register(handle).await;

    let session = WsSession::new(
        user.id,
        connection_id,
        state.registry.clone(),
        rx,
        state.config.heartbeat_interval(),
        state.config.client_timeout(),
    );

    match ws::start(session, &req, stream) {
        Ok(resp) => Ok(resp),
        Err(e) => {
            state.registry.unregister(user.id, connection_id).await;
            Err(e)
        }
    }
}
