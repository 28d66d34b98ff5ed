//! # Relay WebSocket Handler
//!
//! Client-facing end of a connection pair. Clients connect to
//! `/chat/ws/{session_id}` after starting a session and exchange audio with the
//! upstream voice service through this actor.
//!
//! ## Lifecycle:
//! 1. **Attach**: the actor binds itself to the session in the registry
//! 2. **Connect**: a background task opens the upstream socket and runs the pumps
//! 3. **Relay**: client frames go to the pair's channel, upstream frames come
//!    back through the actor's mailbox
//! 4. **Teardown**: whichever side closes first ends the pair; the session
//!    mapping is released when the actor stops
//!
//! ## Actor Model:
//! The actor owns the client socket. The pump task owns the upstream socket.
//! They only talk through the actor mailbox and a bounded channel, so no
//! lock is held while a frame is in flight. The channel only holds frames
//! whose upstream write has not completed yet; when it is full the upstream
//! has stalled and the pair is torn down with `connection_lost`.

use crate::audio::{decode_f32_le, encode_pcm16_le, validate_pcm16, CapturePreprocessor};
use crate::error::AppError;
use crate::relay::messages::{parse_client_text, ClientEvent, ClientInbound, ParsedClientText, UpstreamFrame};
use crate::relay::pump::{run_pair, PairOutcome};
use crate::session::{connect_upstream, PairHandle, UPSTREAM_QUEUE_CAPACITY};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Upstream handshake finished.
#[derive(Message)]
#[rtype(result = "()")]
struct UpstreamReady;

/// A mapped upstream frame to write to the client.
#[derive(Message)]
#[rtype(result = "()")]
struct ForwardToClient(ClientEvent);

/// The upstream leg is gone (closed, failed, or never connected).
#[derive(Message)]
#[rtype(result = "()")]
struct UpstreamEnded {
    reason: String,
    error: Option<AppError>,
}

/// WebSocket actor for one client of a connection pair.
pub struct RelaySocket {
    session_id: String,
    state: web::Data<AppState>,

    /// Our registration, present once attached
    pair: Option<PairHandle>,
    /// Sender half of the pair channel; dropping it closes the upstream writer
    to_upstream: Option<mpsc::Sender<UpstreamFrame>>,
    /// Whether the upstream handshake completed
    upstream_ready: bool,
    /// Fired when the actor stops, starting the pump's close deadline
    closing: Option<oneshot::Sender<()>>,

    /// Built on the first `capture_block` and rebuilt when the rate changes
    capture: Option<CapturePreprocessor>,

    last_heartbeat: Instant,
    keepalive_interval: Duration,
    client_timeout: Duration,
    connect_timeout: Duration,
}

impl RelaySocket {
    pub fn new(session_id: String, state: web::Data<AppState>) -> Self {
        let config = state.get_config();
        Self {
            session_id,
            state,
            pair: None,
            to_upstream: None,
            upstream_ready: false,
            closing: None,
            capture: None,
            last_heartbeat: Instant::now(),
            keepalive_interval: config.relay.keepalive_interval(),
            client_timeout: config.relay.client_timeout(),
            connect_timeout: config.upstream.connect_timeout(),
        }
    }

    fn send_event(&self, ctx: &mut ws::WebsocketContext<Self>, event: &ClientEvent) {
        ctx.text(event.to_json());
    }

    /// Send an error message to the client.
    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        self.send_event(ctx, &ClientEvent::error(code, message));
        warn!(session_id = %self.session_id, code = code, "Relay error: {}", message);
    }

    /// Close the client with an error and stop the actor.
    fn reject(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        self.send_error(ctx, code, message);
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Policy,
            description: Some(message.to_string()),
        }));
        ctx.stop();
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.keepalive_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(session_id = %act.session_id, "Client heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    /// Open the upstream and run the pair in a background task.
    ///
    /// The task is never aborted. If the client leaves mid-connect, the writer
    /// finds the channel closed as soon as the handshake finishes and closes
    /// the upstream with a Close frame. Once the client is gone the pair gets
    /// one connect timeout to finish closing before the upstream is dropped.
    fn spawn_pump(
        &mut self,
        upstream_endpoint: String,
        rx: mpsc::Receiver<UpstreamFrame>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let addr = ctx.address();
        let timeout = self.connect_timeout;
        let session_id = self.session_id.clone();
        let (closing, mut client_gone) = oneshot::channel::<()>();
        self.closing = Some(closing);

        tokio::spawn(async move {
            let (sink, stream) = match connect_upstream(&upstream_endpoint, timeout).await {
                Ok(halves) => halves,
                Err(err) => {
                    error!(session_id = %session_id, error = %err, "Upstream connect failed");
                    addr.do_send(UpstreamEnded {
                        reason: err.to_string(),
                        error: Some(err),
                    });
                    return;
                }
            };

            addr.do_send(UpstreamReady);

            let deliver_addr = addr.clone();
            let pair = run_pair(rx, sink, stream, move |event| {
                if !deliver_addr.connected() {
                    return false;
                }
                deliver_addr.do_send(ForwardToClient(event));
                true
            });
            tokio::pin!(pair);

            let outcome = tokio::select! {
                outcome = &mut pair => Some(outcome),
                _ = &mut client_gone => tokio::time::timeout(timeout, &mut pair).await.ok(),
            };

            match outcome {
                Some(PairOutcome::ClientClosed { frames_to_upstream }) => {
                    info!(session_id = %session_id, frames = frames_to_upstream, "Client closed, upstream released");
                }
                Some(PairOutcome::UpstreamEnded(end)) => {
                    info!(session_id = %session_id, reason = %end.reason(), "Upstream ended");
                    addr.do_send(UpstreamEnded {
                        reason: end.reason(),
                        error: None,
                    });
                }
                None => {
                    warn!(session_id = %session_id, "Upstream did not close in time, dropping it");
                }
            }
        });
    }

    /// Queue PCM16 bytes for the upstream writer.
    fn forward_audio(&mut self, audio: Vec<u8>, ctx: &mut ws::WebsocketContext<Self>) {
        if !self.upstream_ready {
            self.send_error(ctx, "not_connected", "Upstream connection is not established yet");
            return;
        }
        self.forward(UpstreamFrame::Audio(audio), ctx);
    }

    fn forward(&mut self, frame: UpstreamFrame, ctx: &mut ws::WebsocketContext<Self>) {
        let bytes = frame.payload_len();
        let Some(tx) = self.to_upstream.as_ref() else {
            self.send_error(ctx, "not_connected", "Upstream connection is closed");
            return;
        };

        match tx.try_send(frame) {
            Ok(()) => self.state.record_frame_to_upstream(bytes),
            Err(TrySendError::Full(_)) => {
                let err = AppError::ConnectionLost(format!(
                    "upstream stalled with {} frames queued",
                    UPSTREAM_QUEUE_CAPACITY
                ));
                self.end_pair(err.to_string(), Some(err), ctx);
            }
            Err(TrySendError::Closed(_)) => {
                self.send_error(ctx, "not_connected", "Upstream connection is closed");
            }
        }
    }

    /// Report why the pair ended, then close the client.
    fn end_pair(&mut self, reason: String, error: Option<AppError>, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(err) = &error {
            self.send_error(ctx, err.kind(), err.message());
        }
        self.send_event(ctx, &ClientEvent::UpstreamClosed { reason: reason.clone() });
        self.upstream_ready = false;
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Away,
            description: Some(reason),
        }));
        ctx.stop();
    }

    fn decode_pcm16(data: &str) -> Result<Vec<u8>, AppError> {
        let audio = STANDARD.decode(data)?;
        validate_pcm16(&audio)?;
        Ok(audio)
    }

    /// Resample a float capture block to PCM16 at the target rate.
    fn preprocess_capture(&mut self, sample_rate: u32, data: &str) -> Result<Vec<u8>, AppError> {
        let samples = decode_f32_le(&STANDARD.decode(data)?)?;

        let rebuild = self
            .capture
            .as_ref()
            .map(|p| p.native_rate() != sample_rate)
            .unwrap_or(true);
        if rebuild {
            self.capture = Some(CapturePreprocessor::new(sample_rate)?);
        }

        let pcm = match self.capture.as_mut() {
            Some(pre) => pre.process(&samples),
            None => Vec::new(),
        };
        Ok(encode_pcm16_le(&pcm))
    }

    fn handle_client_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match parse_client_text(text) {
            ParsedClientText::Message(ClientInbound::AudioData { data }) => match Self::decode_pcm16(&data) {
                Ok(audio) => self.forward_audio(audio, ctx),
                Err(err) => self.send_error(ctx, "invalid_audio", err.message()),
            },
            ParsedClientText::Message(ClientInbound::CaptureBlock { sample_rate, data }) => {
                match self.preprocess_capture(sample_rate, &data) {
                    Ok(pcm) if pcm.is_empty() => debug!(session_id = %self.session_id, "Capture block too short, nothing to forward"),
                    Ok(pcm) => self.forward_audio(pcm, ctx),
                    Err(err) => self.send_error(ctx, "invalid_audio", err.message()),
                }
            }
            ParsedClientText::Message(ClientInbound::Control { payload }) => {
                self.forward(UpstreamFrame::Control(payload.to_string()), ctx);
            }
            ParsedClientText::Message(ClientInbound::TextMessage { text }) => {
                self.send_event(
                    ctx,
                    &ClientEvent::TextResponse {
                        message: format!("Received: {}", text),
                    },
                );
            }
            ParsedClientText::Message(ClientInbound::Ping { timestamp }) => {
                self.last_heartbeat = Instant::now();
                self.send_event(ctx, &ClientEvent::Pong { timestamp });
            }
            ParsedClientText::Message(ClientInbound::Pong { .. }) => {
                self.last_heartbeat = Instant::now();
            }
            ParsedClientText::Unknown(original) => {
                self.send_event(ctx, &ClientEvent::Echo { original });
            }
            ParsedClientText::Malformed(err) => {
                self.send_error(ctx, "invalid_message", &err);
            }
            ParsedClientText::InvalidJson(err) => {
                debug!(session_id = %self.session_id, error = %err, "Client sent invalid JSON");
                self.send_error(ctx, "invalid_json", "Invalid JSON format");
            }
        }
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    /// Called when the WebSocket connection starts.
    fn started(&mut self, ctx: &mut Self::Context) {
        let (tx, rx) = mpsc::channel(UPSTREAM_QUEUE_CAPACITY);
        let handle = PairHandle::new(tx.clone());

        let session = match self.state.registry.attach(&self.session_id, handle.clone()) {
            Ok(session) => session,
            Err(AppError::NotFound(msg)) => {
                self.reject(ctx, "session_not_found", &msg);
                return;
            }
            Err(err) => {
                self.reject(ctx, "session_busy", err.message());
                return;
            }
        };

        info!(session_id = %self.session_id, pair_id = %handle.pair_id, "Relay connection started");
        self.pair = Some(handle);
        self.to_upstream = Some(tx);
        self.state.pair_opened();

        self.send_event(
            ctx,
            &ClientEvent::Connected {
                session_id: self.session_id.clone(),
            },
        );

        self.heartbeat(ctx);
        self.spawn_pump(session.upstream_endpoint, rx, ctx);
    }

    /// Called when the WebSocket connection stops.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the last senders lets the writer send Close upstream.
        self.to_upstream = None;
        if let Some(closing) = self.closing.take() {
            let _ = closing.send(());
        }

        if let Some(pair) = self.pair.take() {
            self.state.registry.release(&self.session_id, pair.pair_id);
            self.state.pair_closed();
        }

        info!(session_id = %self.session_id, "Relay connection stopped");
    }
}

/// Handle incoming WebSocket messages.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.handle_client_text(&text, ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.forward_audio(data.to_vec(), ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, "Client closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<UpstreamReady> for RelaySocket {
    type Result = ();

    fn handle(&mut self, _msg: UpstreamReady, ctx: &mut Self::Context) {
        self.upstream_ready = true;
        self.send_event(
            ctx,
            &ClientEvent::UpstreamConnected {
                session_id: self.session_id.clone(),
            },
        );
    }
}

impl Handler<ForwardToClient> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: ForwardToClient, ctx: &mut Self::Context) {
        let json = msg.0.to_json();
        self.state.record_frame_to_client(json.len());
        ctx.text(json);
    }
}

impl Handler<UpstreamEnded> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: UpstreamEnded, ctx: &mut Self::Context) {
        self.end_pair(msg.reason, msg.error, ctx);
    }
}

/// WebSocket endpoint handler for `/chat/ws/{session_id}`.
///
/// ## HTTP to WebSocket Upgrade:
/// The upgrade always succeeds; an unknown or busy session is reported over
/// the socket and then closed.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let session_id = path.into_inner();
    info!(
        session_id = %session_id,
        peer = ?req.connection_info().peer_addr(),
        "New relay WebSocket connection request"
    );

    ws::start(RelaySocket::new(session_id, state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::session::registry::Session;
    use actix_web::{App, HttpServer};
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn socket() -> RelaySocket {
        let state = web::Data::new(AppState::new(AppConfig::default()).unwrap());
        RelaySocket::new("sess-1".to_string(), state)
    }

    fn relay_state() -> web::Data<AppState> {
        web::Data::new(AppState::new(AppConfig::default()).unwrap())
    }

    fn register(state: &web::Data<AppState>, session_id: &str, upstream_url: &str) {
        state
            .registry
            .reserve()
            .unwrap()
            .register(Session::new(session_id.to_string(), upstream_url.to_string(), None))
            .unwrap();
    }

    async fn start_relay(state: web::Data<AppState>) -> SocketAddr {
        let server = HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .route("/chat/ws/{session_id}", web::get().to(relay_websocket))
        })
        .workers(1)
        .disable_signals()
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());
        addr
    }

    /// A voice-service socket that records what it receives and hangs up on command.
    struct FakeUpstream {
        url: String,
        received: mpsc::UnboundedReceiver<WsMessage>,
        hang_up: mpsc::UnboundedSender<()>,
    }

    async fn fake_upstream() -> FakeUpstream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (seen, received) = mpsc::unbounded_channel();
        let (hang_up, mut hang_up_rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut socket = accept_async(tcp).await.unwrap();
            loop {
                tokio::select! {
                    msg = socket.next() => match msg {
                        Some(Ok(msg)) => {
                            let closing = msg.is_close();
                            let _ = seen.send(msg);
                            if closing {
                                break;
                            }
                        }
                        _ => break,
                    },
                    Some(()) = hang_up_rx.recv() => {
                        let close = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "call ended".into(),
                        };
                        let _ = socket.send(WsMessage::Close(Some(close))).await;
                    }
                }
            }
        });

        FakeUpstream { url, received, hang_up }
    }

    async fn connect_client(addr: SocketAddr, session_id: &str) -> Client {
        let (client, _) = connect_async(format!("ws://{}/chat/ws/{}", addr, session_id))
            .await
            .unwrap();
        client
    }

    /// Next frame from the relay, skipping keepalives.
    async fn next_frame(client: &mut Client) -> WsMessage {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("relay went quiet")
                .expect("relay socket ended")
                .unwrap();
            if !matches!(msg, WsMessage::Ping(_) | WsMessage::Pong(_)) {
                return msg;
            }
        }
    }

    async fn next_event(client: &mut Client) -> serde_json::Value {
        match next_frame(client).await {
            WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a JSON event, got {:?}", other),
        }
    }

    async fn wait_for_release(state: &web::Data<AppState>, session_id: &str) -> bool {
        for _ in 0..100 {
            if state.registry.get(session_id).is_none() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_decode_pcm16_checks_alignment() {
        let even = STANDARD.encode([1u8, 0, 2, 0]);
        assert_eq!(RelaySocket::decode_pcm16(&even).unwrap(), vec![1, 0, 2, 0]);

        let odd = STANDARD.encode([1u8, 0, 2]);
        assert!(RelaySocket::decode_pcm16(&odd).is_err());
        assert!(RelaySocket::decode_pcm16("not base64!").is_err());
    }

    #[test]
    fn test_capture_block_is_downsampled_and_preprocessor_rebuilt() {
        let mut socket = socket();
        let block: Vec<u8> = std::iter::repeat(0.5f32)
            .take(48)
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let encoded = STANDARD.encode(&block);

        let pcm = socket.preprocess_capture(48000, &encoded).unwrap();
        assert_eq!(pcm.len(), 16 * 2);
        assert_eq!(socket.capture.as_ref().map(|p| p.native_rate()), Some(48000));

        let pcm = socket.preprocess_capture(32000, &encoded).unwrap();
        assert_eq!(pcm.len(), 24 * 2);
        assert_eq!(socket.capture.as_ref().map(|p| p.native_rate()), Some(32000));
    }

    #[test]
    fn test_capture_block_rejects_upsampling() {
        let mut socket = socket();
        let encoded = STANDARD.encode(0.1f32.to_le_bytes());
        assert!(socket.preprocess_capture(8000, &encoded).is_err());
    }

    #[actix_web::test]
    async fn test_pair_relays_audio_and_closes_upstream_with_client() {
        let state = relay_state();
        let mut upstream = fake_upstream().await;
        register(&state, "sess-e2e", &upstream.url);
        let addr = start_relay(state.clone()).await;

        let mut client = connect_client(addr, "sess-e2e").await;
        let event = next_event(&mut client).await;
        assert_eq!(event["type"], "connected");
        assert_eq!(event["session_id"], "sess-e2e");
        assert_eq!(next_event(&mut client).await["type"], "upstream_connected");

        let mut second = connect_client(addr, "sess-e2e").await;
        assert_eq!(next_event(&mut second).await["code"], "session_busy");
        assert!(matches!(next_frame(&mut second).await, WsMessage::Close(_)));

        client.send(WsMessage::Binary(vec![1, 0, 2, 0])).await.unwrap();
        let audio = tokio::time::timeout(Duration::from_secs(5), upstream.received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(audio, WsMessage::Binary(vec![1, 0, 2, 0]));

        client.close(None).await.unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(1), async {
            while let Some(msg) = upstream.received.recv().await {
                if msg.is_close() {
                    return true;
                }
            }
            false
        })
        .await;
        assert_eq!(closed, Ok(true));
        assert!(state.registry.get("sess-e2e").is_none());
        assert_eq!(state.registry.active_pair_count(), 0);
    }

    #[actix_web::test]
    async fn test_unknown_session_is_reported_then_closed() {
        let addr = start_relay(relay_state()).await;

        let mut client = connect_client(addr, "no-such-session").await;
        let event = next_event(&mut client).await;
        assert_eq!(event["type"], "error");
        assert_eq!(event["code"], "session_not_found");
        assert!(matches!(next_frame(&mut client).await, WsMessage::Close(_)));
    }

    #[actix_web::test]
    async fn test_audio_before_upstream_handshake_is_not_forwarded() {
        let state = relay_state();
        // Accepts TCP through the backlog but never answers the handshake
        let stalled = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", stalled.local_addr().unwrap());
        register(&state, "sess-pending", &url);
        let addr = start_relay(state.clone()).await;

        let mut client = connect_client(addr, "sess-pending").await;
        assert_eq!(next_event(&mut client).await["type"], "connected");

        client.send(WsMessage::Binary(vec![1, 0])).await.unwrap();
        let event = next_event(&mut client).await;
        assert_eq!(event["type"], "error");
        assert_eq!(event["code"], "not_connected");
        assert_eq!(state.registry.active_pair_count(), 1);
    }

    #[actix_web::test]
    async fn test_upstream_hang_up_closes_client() {
        let state = relay_state();
        let upstream = fake_upstream().await;
        register(&state, "sess-hangup", &upstream.url);
        let addr = start_relay(state.clone()).await;

        let mut client = connect_client(addr, "sess-hangup").await;
        assert_eq!(next_event(&mut client).await["type"], "connected");
        assert_eq!(next_event(&mut client).await["type"], "upstream_connected");

        upstream.hang_up.send(()).unwrap();
        let event = next_event(&mut client).await;
        assert_eq!(event["type"], "upstream_closed");
        assert_eq!(event["reason"], "call ended");
        assert!(matches!(next_frame(&mut client).await, WsMessage::Close(_)));
        assert!(wait_for_release(&state, "sess-hangup").await);
    }
}
