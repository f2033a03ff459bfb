//! Connection handlers for Parley server.
//!
//! A connection starts with a `Connect` handshake carrying the caller's
//! session, then multiplexes operation requests and event subscriptions over
//! the same socket. Each subscription gets a forwarding task that turns bus
//! events into `Event` frames.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parley_core::{
    BusConfig, CloseReason, Engine, EngineError, Event, EventBus, MemoryStore, SendMessage,
    Session, Subscription, SubscriptionError, SubscriptionRequest, SubscriptionSession, User,
};
use parley_protocol::{codec, codes, is_compatible, Frame, Operation, Topic, PROTOCOL_VERSION};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

/// Shared server state.
pub struct AppState {
    /// The conversation engine.
    pub engine: Engine,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let bus = EventBus::with_config(BusConfig {
            subscriber_capacity: config.bus.subscriber_capacity,
        });

        Self {
            engine: Engine::new(Arc::new(MemoryStore::new()), bus),
            config,
        }
    }
}

/// Run the HTTP/WebSocket server until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(
    config: Config,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = router(state.clone());

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let bus = state.engine.bus().clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutting down, closing event bus");
            bus.close();
        })
        .await?;

    Ok(())
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();

    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.engine.bus().stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "subscribers": stats.total_subscribers,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = format!("conn_{}", Uuid::new_v4().simple());
    debug!(connection = %connection_id, "WebSocket connected");

    let (sender, mut receiver) = socket.split();

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    let Some((mut connection, events_rx)) =
        Connection::handshake(connection_id, state, sender, &mut receiver, &mut read_buffer).await
    else {
        return;
    };

    connection.run(receiver, read_buffer, events_rx).await;
    connection.finish();
}

/// Failure of a client request.
#[derive(Debug, Error)]
enum RequestError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Failed to encode reply: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RequestError {
    fn code(&self) -> u16 {
        match self {
            RequestError::Engine(e) => e.kind().code(),
            RequestError::Encode(_) => codes::INTERNAL_ERROR,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            RequestError::Engine(e) => e.kind().as_str(),
            RequestError::Encode(_) => "encode",
        }
    }
}

/// One handshaken client connection.
struct Connection {
    id: String,
    state: Arc<AppState>,
    sender: WsSender,
    session: Session,
    subscriptions: SubscriptionSession,
    forwarders: HashMap<u64, JoinHandle<()>>,
    events_tx: mpsc::Sender<Frame>,
}

impl Connection {
    /// Wait for the client's `Connect` frame and answer it.
    async fn handshake(
        id: String,
        state: Arc<AppState>,
        mut sender: WsSender,
        receiver: &mut WsReceiver,
        read_buffer: &mut BytesMut,
    ) -> Option<(Self, mpsc::Receiver<Frame>)> {
        let timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);

        let first = match tokio::time::timeout(timeout, next_frame(receiver, read_buffer)).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                debug!(connection = %id, "Closed before handshake");
                return None;
            }
            Ok(Err(e)) => {
                warn!(connection = %id, error = %e, "Invalid handshake");
                metrics::record_error("handshake");
                let _ = send_frame(
                    &mut sender,
                    &Frame::error(0, codes::INVALID_FRAME, e.to_string()),
                )
                .await;
                return None;
            }
            Err(_) => {
                warn!(connection = %id, "Handshake timed out");
                return None;
            }
        };

        let (version, session) = match first {
            Frame::Connect { version, session } => (version, session),
            other => {
                warn!(connection = %id, frame_type = ?other.frame_type(), "Expected Connect frame");
                let _ = send_frame(
                    &mut sender,
                    &Frame::error(0, codes::NOT_CONNECTED, "Expected connect frame"),
                )
                .await;
                return None;
            }
        };

        if !is_compatible(version) {
            warn!(connection = %id, version, "Unsupported protocol version");
            let _ = send_frame(
                &mut sender,
                &Frame::error(
                    0,
                    codes::UNSUPPORTED_VERSION,
                    format!("Unsupported protocol version {version}, expected {PROTOCOL_VERSION}"),
                ),
            )
            .await;
            return None;
        }

        let session = match session {
            Some(user_id) => match state.engine.register_user(User::new(user_id)).await {
                Ok(_) => Session::authenticated(user_id),
                Err(e) => {
                    error!(connection = %id, error = %e, "Failed to provision session user");
                    let _ =
                        send_frame(&mut sender, &Frame::error(0, e.kind().code(), e.to_string()))
                            .await;
                    return None;
                }
            },
            None => Session::anonymous(),
        };

        let heartbeat = u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
        let connected = Frame::connected(id.as_str(), PROTOCOL_VERSION, heartbeat);
        if send_frame(&mut sender, &connected).await.is_err() {
            error!(connection = %id, "Failed to send Connected frame");
            return None;
        }

        info!(connection = %id, user = ?session.user_id(), "Client connected");

        let (events_tx, events_rx) = mpsc::channel(state.config.bus.subscriber_capacity);
        let subscriptions = SubscriptionSession::new(state.engine.bus().clone(), id.clone(), session);

        Some((
            Self {
                id,
                state,
                sender,
                session,
                subscriptions,
                forwarders: HashMap::new(),
                events_tx,
            },
            events_rx,
        ))
    }

    /// Message processing loop.
    async fn run(
        &mut self,
        mut receiver: WsReceiver,
        mut read_buffer: BytesMut,
        mut events_rx: mpsc::Receiver<Frame>,
    ) {
        let idle_timeout = Duration::from_millis(self.state.config.heartbeat.timeout_ms);
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        // Frames that arrived together with the handshake.
        if self.drain(&mut read_buffer).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                biased;

                // Frames produced by subscription forwarders
                Some(frame) = events_rx.recv() => {
                    if let Err(e) = self.send(&frame).await {
                        debug!(connection = %self.id, error = %e, "Failed to deliver event");
                        break;
                    }
                }

                // Receive from WebSocket
                msg = receiver.next() => {
                    idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);

                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            metrics::record_frame(data.len(), "inbound");
                            read_buffer.extend_from_slice(&data);
                            if self.drain(&mut read_buffer).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            // Treat text as binary
                            metrics::record_frame(text.len(), "inbound");
                            read_buffer.extend_from_slice(text.as_bytes());
                            if self.drain(&mut read_buffer).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if self.sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) => {
                            debug!(connection = %self.id, "Received close frame");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(connection = %self.id, error = %e, "WebSocket error");
                            metrics::record_error("websocket");
                            break;
                        }
                        None => {
                            debug!(connection = %self.id, "WebSocket stream ended");
                            break;
                        }
                    }
                }

                () = &mut idle => {
                    warn!(connection = %self.id, "Connection idle, closing");
                    break;
                }
            }
        }
    }

    /// Handle every complete frame in the buffer.
    async fn drain(&mut self, read_buffer: &mut BytesMut) -> Result<()> {
        loop {
            match codec::decode_from(read_buffer) {
                Ok(Some(frame)) => self.handle_frame(frame).await?,
                Ok(None) => return Ok(()),
                Err(e) => {
                    // Frame boundaries are lost; the stream cannot be resynchronised.
                    warn!(connection = %self.id, error = %e, "Undecodable frame, closing");
                    metrics::record_error("decode");
                    let _ = self
                        .send(&Frame::error(0, codes::INVALID_FRAME, e.to_string()))
                        .await;
                    return Err(e.into());
                }
            }
        }
    }

    /// Handle a decoded frame.
    async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Subscribe {
                id,
                topic,
                conversation_id,
            } => {
                debug!(connection = %self.id, topic = %topic, "Subscribe request");
                let response = self.subscribe(id, topic, conversation_id).await;
                self.send(&response).await?;
            }

            Frame::Unsubscribe { id, subscription } => {
                debug!(connection = %self.id, subscription, "Unsubscribe request");
                let response = self.unsubscribe(id, subscription);
                self.send(&response).await?;
            }

            Frame::Request { id, op } => {
                let response = self.request(id, op).await;
                self.send(&response).await?;
            }

            Frame::Ping { timestamp } => {
                self.send(&Frame::pong(timestamp)).await?;
            }

            Frame::Pong { .. } => {}

            Frame::Connect { version, .. } => {
                debug!(connection = %self.id, version, "Connect frame (already connected)");
            }

            other => {
                warn!(connection = %self.id, frame_type = ?other.frame_type(), "Unexpected frame type");
            }
        }

        Ok(())
    }

    async fn subscribe(&mut self, id: u64, topic: Topic, conversation_id: Option<Uuid>) -> Frame {
        // Forwarders end on overflow or shutdown; they no longer count.
        self.forwarders.retain(|_, handle| !handle.is_finished());

        if self.forwarders.contains_key(&id) {
            return Frame::error(id, codes::SUBSCRIBE_FAILED, "Subscription id already in use");
        }

        let limit = self.state.config.limits.max_subscriptions_per_connection;
        if self.forwarders.len() >= limit {
            return Frame::error(
                id,
                codes::SUBSCRIBE_FAILED,
                format!("Subscription limit of {limit} reached"),
            );
        }

        let Some(request) = SubscriptionRequest::from_topic(topic, conversation_id) else {
            return Frame::error(
                id,
                codes::INVALID_FRAME,
                "MESSAGE_SENT subscriptions require a conversation id",
            );
        };

        match self.state.engine.subscribe(&self.subscriptions, request).await {
            Ok(subscription) => {
                let handle = tokio::spawn(forward(id, subscription, self.events_tx.clone()));
                self.forwarders.insert(id, handle);

                metrics::record_subscription(topic.as_str());
                metrics::set_active_subscribers(self.state.engine.bus().stats().total_subscribers);
                Frame::ack(id)
            }
            Err(e) => {
                warn!(connection = %self.id, topic = %topic, error = %e, "Subscribe failed");
                Frame::error(id, e.kind().code(), e.to_string())
            }
        }
    }

    fn unsubscribe(&mut self, id: u64, subscription: u64) -> Frame {
        match self.forwarders.remove(&subscription) {
            Some(handle) => {
                // Dropping the forwarder's subscription unregisters it from the bus.
                handle.abort();
                Frame::ack(id)
            }
            None => Frame::error(
                id,
                codes::SUBSCRIBE_FAILED,
                format!("Unknown subscription {subscription}"),
            ),
        }
    }

    async fn request(&self, id: u64, op: Operation) -> Frame {
        let operation = op.name();
        let start = Instant::now();

        let result = dispatch(&self.state.engine, &self.session, op).await;
        let elapsed = start.elapsed().as_secs_f64();

        match result {
            Ok(data) => {
                metrics::record_operation(operation, "ok", elapsed);
                Frame::reply(id, data)
            }
            Err(e) => {
                metrics::record_operation(operation, e.label(), elapsed);
                debug!(connection = %self.id, operation, error = %e, "Request failed");
                Frame::error(id, e.code(), e.to_string())
            }
        }
    }

    async fn send(&mut self, frame: &Frame) -> Result<()> {
        send_frame(&mut self.sender, frame).await
    }

    /// Release everything the connection holds.
    fn finish(self) {
        for (_, handle) in self.forwarders {
            handle.abort();
        }

        let bus = self.state.engine.bus().clone();
        // Dropping the session releases every subscription tagged with this connection.
        drop(self.subscriptions);
        metrics::set_active_subscribers(bus.stats().total_subscribers);

        debug!(connection = %self.id, "WebSocket disconnected");
    }
}

/// Read until one complete frame is buffered.
async fn next_frame(receiver: &mut WsReceiver, read_buffer: &mut BytesMut) -> Result<Option<Frame>> {
    loop {
        if let Some(frame) = codec::decode_from(read_buffer)? {
            return Ok(Some(frame));
        }

        match receiver.next().await {
            Some(Ok(Message::Binary(data))) => read_buffer.extend_from_slice(&data),
            Some(Ok(Message::Text(text))) => read_buffer.extend_from_slice(text.as_bytes()),
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Forward one subscription's events to the connection until it ends.
async fn forward(id: u64, mut subscription: Subscription, tx: mpsc::Sender<Frame>) {
    let topic = subscription.topic();

    while let Some(item) = subscription.next().await {
        let frame = match item {
            Ok(event) => match event_payload(&event) {
                Ok(payload) => Frame::event(id, topic, payload),
                Err(e) => {
                    error!(subscription = id, error = %e, "Failed to encode event");
                    metrics::record_error("encode");
                    continue;
                }
            },
            Err(e @ SubscriptionError::Overflow { .. }) => {
                metrics::record_overflow(topic.as_str());
                Frame::closed(id, codes::SUBSCRIPTION_OVERFLOW, e.to_string())
            }
        };

        let delivered = matches!(frame, Frame::Event { .. });
        if tx.send(frame).await.is_err() {
            return;
        }
        if delivered {
            metrics::record_event_delivered(topic.as_str());
        }
    }

    if subscription.close_reason() == Some(CloseReason::Shutdown) {
        let _ = tx
            .send(Frame::closed(id, codes::SHUTTING_DOWN, "Server shutting down"))
            .await;
    }
}

/// The event body carried in an `Event` frame; the topic travels alongside.
fn event_payload(event: &Event) -> serde_json::Result<Value> {
    match event {
        Event::ConversationCreated(c)
        | Event::ConversationUpdated(c)
        | Event::ConversationDeleted(c) => serde_json::to_value(c),
        Event::MessageSent(m) => serde_json::to_value(m),
    }
}

/// Run one operation against the engine and encode its result.
async fn dispatch(engine: &Engine, session: &Session, op: Operation) -> Result<Value, RequestError> {
    let data = match op {
        Operation::CreateConversation { participant_ids } => {
            serde_json::to_value(engine.create_conversation(session, participant_ids).await?)?
        }
        Operation::SendMessage {
            conversation_id,
            sender_id,
            body,
        } => {
            let args = SendMessage {
                conversation_id,
                sender_id,
                body,
            };
            serde_json::to_value(engine.send_message(session, args).await?)?
        }
        Operation::MarkConversationAsRead {
            user_id,
            conversation_id,
        } => Value::Bool(
            engine
                .mark_conversation_as_read(session, user_id, conversation_id)
                .await?,
        ),
        Operation::DeleteConversation { conversation_id } => {
            serde_json::to_value(engine.delete_conversation(session, conversation_id).await?)?
        }
        Operation::Conversations => serde_json::to_value(engine.conversations(session).await?)?,
        Operation::Messages { conversation_id } => {
            serde_json::to_value(engine.messages(session, conversation_id).await?)?
        }
        Operation::SearchUsers { username } => {
            serde_json::to_value(engine.search_users(session, &username).await?)?
        }
        Operation::CreateUsername { username } => {
            engine.create_username(session, &username).await?;
            serde_json::json!({ "success": true })
        }
    };

    Ok(data)
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSender, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_frame(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}
