//! # WebSocket Noise Detection Endpoint
//!
//! Clients connect to `/ws/audio` (or `/ws`) and stream JSON envelopes; every
//! `audio_frame` is answered with a `noise_detection` message.
//!
//! ## Connection model:
//! 1. **Connection**: one WebSocket connection is one session, identified by a
//!    fresh UUID. The session is registered before any frame is processed.
//! 2. **Frames**: text messages are queued on a bounded per-connection channel
//!    and handled by a single worker task, so replies keep the order of the
//!    frames. A frame arriving while the queue is full is answered with an
//!    `error` and dropped; the connection stays open.
//! 3. **Replies**: the worker posts replies back to the actor's mailbox. Once the
//!    actor is gone the pipeline sees `DeliveryGone` and purges the session.
//! 4. **Close**: the worker closes the session when the connection stops.
//!
//! ## Heartbeat:
//! Protocol-level pings every 30s; no ping or pong from the client for 60s
//! closes the connection. The JSON `ping` message is answered by the pipeline.

use crate::error::PipelineError;
use crate::pipeline::{DeliveryChannel, OutboundMessage, SessionPipeline};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);
/// Frames waiting for the worker, per connection.
const FRAME_QUEUE_CAPACITY: usize = 64;

/// Reply text for the client.
#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

/// The registry refused the session; tell the client and close.
#[derive(Message)]
#[rtype(result = "()")]
struct RejectSession(String);

/// Delivers pipeline replies to the connection actor.
pub struct WsDelivery {
    addr: Addr<NoiseWebSocket>,
}

impl WsDelivery {
    fn is_gone(&self) -> bool {
        !self.addr.connected()
    }
}

impl DeliveryChannel for WsDelivery {
    fn send(&self, session_id: &str, message: &OutboundMessage) -> Result<(), PipelineError> {
        if self.is_gone() {
            return Err(PipelineError::DeliveryGone(session_id.to_string()));
        }
        self.addr.do_send(SendText(message.to_json()));
        Ok(())
    }
}

pub struct NoiseWebSocket {
    session_id: String,
    state: web::Data<AppState>,
    last_heartbeat: Instant,
    /// Sender side of the ordered frame queue; dropped on stop.
    frames: Option<mpsc::Sender<String>>,
}

/// Queue a text frame for the worker. Returns the reply owed to the client when it cannot be queued.
fn enqueue(frames: Option<&mpsc::Sender<String>>, text: String) -> Option<OutboundMessage> {
    let Some(frames) = frames else {
        return Some(OutboundMessage::error("Session is closed"));
    };
    match frames.try_send(text) {
        Ok(()) => None,
        Err(TrySendError::Full(_)) => Some(OutboundMessage::error("Too many frames in flight; frame dropped")),
        Err(TrySendError::Closed(_)) => Some(OutboundMessage::error("Session is closed")),
    }
}

impl NoiseWebSocket {
    pub fn new(session_id: String, state: web::Data<AppState>) -> Self {
        Self {
            session_id,
            state,
            last_heartbeat: Instant::now(),
            frames: None,
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &OutboundMessage) {
        ctx.text(message.to_json());
    }

    /// Register the session, then feed queued frames through the pipeline one at a time.
    fn spawn_worker(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let (tx, mut rx) = mpsc::channel::<String>(FRAME_QUEUE_CAPACITY);
        self.frames = Some(tx);

        let pipeline: Arc<SessionPipeline> = self.state.pipeline.clone();
        let session_id = self.session_id.clone();
        let delivery = WsDelivery { addr: ctx.address() };

        tokio::spawn(async move {
            if let Err(reason) = pipeline.open_session(&session_id).await {
                warn!(session_id = %session_id, "Session rejected: {}", reason);
                delivery.addr.do_send(RejectSession(reason));
                return;
            }

            while let Some(text) = rx.recv().await {
                if delivery.is_gone() {
                    break;
                }
                match pipeline.dispatch(&session_id, &text, &delivery).await {
                    Ok(()) => {}
                    Err(PipelineError::DeliveryGone(_)) => return,
                    Err(e) => error!(session_id = %session_id, "Failed to deliver reply: {}", e),
                }
            }

            pipeline.close_session(&session_id).await;
        });
    }
}

impl Actor for NoiseWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection started");
        self.state.connection_opened();
        self.spawn_worker(ctx);

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection stopped");
        self.state.connection_closed();
        // Ends the worker loop, which then closes the session.
        self.frames = None;
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for NoiseWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                if let Some(reply) = enqueue(self.frames.as_ref(), text.to_string()) {
                    warn!(session_id = %self.session_id, "Frame not queued");
                    self.send(ctx, &reply);
                }
            }
            Ok(ws::Message::Binary(data)) => {
                debug!(session_id = %self.session_id, bytes = data.len(), "Rejected binary frame");
                self.send(
                    ctx,
                    &OutboundMessage::error("Binary frames are not supported; send audio_frame JSON messages"),
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
                info!(session_id = %self.session_id, "WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendText> for NoiseWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<RejectSession> for NoiseWebSocket {
    type Result = ();

    fn handle(&mut self, msg: RejectSession, ctx: &mut Self::Context) {
        self.send(ctx, &OutboundMessage::error(msg.0.clone()));
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Again,
            description: Some(msg.0),
        }));
        ctx.stop();
    }
}

/// WebSocket endpoint handler.
///
/// Upgrades the HTTP request and starts a [`NoiseWebSocket`] actor with a new session id.
pub async fn audio_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let session_id = Uuid::new_v4().to_string();
    info!(
        session_id = %session_id,
        "New WebSocket connection request from: {:?}",
        req.connection_info().peer_addr()
    );

    ws::start(NoiseWebSocket::new(session_id, app_state), &req, stream)
}
