//! Connection handlers for the Tether server.
//!
//! This module wires the HTTP router and runs the per-connection WebSocket
//! loop: client events in, room and presence events out, plus heartbeats.

use crate::api;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::state::AppState;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::time::Instant;
use tether_core::{ConnectionId, ConnectionSession, SessionError};
use tether_protocol::{
    codec, decode_text, encode_text, error_codes, ClientEvent, ServerEvent, WireFormat,
    PROTOCOL_VERSION,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, trace, warn};

/// Build the HTTP router.
pub fn build_router(state: AppState) -> Router {
    // Room for the multipart framing around the largest accepted file.
    let body_limit = state.config.limits.max_attachment_size + 64 * 1024;

    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .merge(api::routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let state = AppState::new(config.clone())?;

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = build_router(state);
    let listener = TcpListener::bind(addr).await?;

    info!("Tether server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.hub.router.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connection_count,
        "onlineUsers": state.hub.presence.online_count(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let limit = socket_frame_limit(state.config.limits.max_message_size);
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Transport-level cap on a single WebSocket message.
///
/// Kept above the configured event limit so oversized events reach
/// `handle_text`/`handle_binary` and get a `TOO_LARGE` error event instead
/// of a protocol error that closes the socket.
fn socket_frame_limit(max_message_size: usize) -> usize {
    codec::MAX_FRAME_SIZE.max(max_message_size)
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: AppState) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let connection_id = ConnectionId::generate();

    let (mut session, mut inbox) = match ConnectionSession::open(&state.hub, connection_id.clone()) {
        Ok(opened) => opened,
        Err(e) => {
            warn!(connection = %connection_id, error = %e, "Rejecting connection");
            metrics::record_error("register");
            return;
        }
    };

    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Replies use the format of the client's most recent frame.
    let mut format = WireFormat::Text;

    let connected = ServerEvent::Connected {
        connection_id: connection_id.to_string(),
        version: PROTOCOL_VERSION,
    };
    if send_event(&mut sender, &connected, format).await.is_err() {
        error!(connection = %connection_id, "Failed to send connected event");
        session.disconnect(&state.hub, state.store.as_ref()).await;
        return;
    }

    let max_message_size = state.config.limits.max_message_size;
    let timeout = state.config.heartbeat_timeout();
    let interval = state.config.heartbeat_interval();
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    let mut last_seen = Instant::now();

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            Some(envelope) = inbox.recv() => {
                trace!(
                    connection = %connection_id,
                    envelope = envelope.id,
                    source = ?envelope.source,
                    room = ?envelope.room,
                    event = envelope.name(),
                    "Delivering event"
                );
                if send_event(&mut sender, &envelope.event, format).await.is_err() {
                    break;
                }
                metrics::record_delivery(&envelope);
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > timeout {
                    debug!(connection = %connection_id, "Heartbeat timeout");
                    metrics::record_error("heartbeat_timeout");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                last_seen = Instant::now();
                let replies = match msg {
                    Some(Ok(Message::Text(text))) => {
                        format = WireFormat::Text;
                        metrics::record_frame(text.len(), "inbound");
                        vec![handle_text(&mut session, &state, &text, max_message_size)]
                    }
                    Some(Ok(Message::Binary(data))) => {
                        format = WireFormat::Binary;
                        metrics::record_frame(data.len(), "inbound");
                        handle_binary(&mut session, &state, &mut read_buffer, &data, max_message_size)
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                };

                let mut closed = false;
                for reply in replies.into_iter().flatten() {
                    if send_event(&mut sender, &reply, format).await.is_err() {
                        closed = true;
                        break;
                    }
                }
                if closed {
                    break;
                }
            }
        }
    }

    session.disconnect(&state.hub, state.store.as_ref()).await;
    metrics::record_hub(&state.hub);

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Decode and handle one JSON text frame.
fn handle_text(
    session: &mut ConnectionSession,
    state: &AppState,
    text: &str,
    max_message_size: usize,
) -> Option<ServerEvent> {
    if text.len() > max_message_size {
        metrics::record_error("too_large");
        return Some(ServerEvent::error(
            error_codes::TOO_LARGE,
            format!("Frame exceeds {} bytes", max_message_size),
        ));
    }

    match decode_text::<ClientEvent>(text) {
        Ok(event) => handle_event(session, state, event),
        Err(e) => {
            debug!(connection = %session.id(), error = %e, "Malformed text frame");
            metrics::record_error("malformed");
            Some(ServerEvent::error(error_codes::MALFORMED, e.to_string()))
        }
    }
}

/// Buffer a binary chunk and handle every complete frame in it.
fn handle_binary(
    session: &mut ConnectionSession,
    state: &AppState,
    read_buffer: &mut BytesMut,
    data: &[u8],
    max_message_size: usize,
) -> Vec<Option<ServerEvent>> {
    if read_buffer.len() + data.len() > max_message_size {
        read_buffer.clear();
        metrics::record_error("too_large");
        return vec![Some(ServerEvent::error(
            error_codes::TOO_LARGE,
            format!("Frame exceeds {} bytes", max_message_size),
        ))];
    }
    read_buffer.extend_from_slice(data);

    let mut replies = Vec::new();
    loop {
        match codec::decode_from::<ClientEvent>(read_buffer) {
            Ok(Some(event)) => replies.push(handle_event(session, state, event)),
            Ok(None) => break,
            Err(e) => {
                debug!(connection = %session.id(), error = %e, "Malformed binary frame");
                metrics::record_error("malformed");
                read_buffer.clear();
                replies.push(Some(ServerEvent::error(error_codes::MALFORMED, e.to_string())));
                break;
            }
        }
    }
    replies
}

/// Apply a client event to the session. Returns the direct reply, if any.
fn handle_event(
    session: &mut ConnectionSession,
    state: &AppState,
    event: ClientEvent,
) -> Option<ServerEvent> {
    let start = Instant::now();
    metrics::record_event(event.name());

    let result = match event {
        ClientEvent::JoinChat {
            first_name,
            user_id,
            target_user_id,
        } => session
            .join(
                &state.hub,
                &first_name,
                user_id.into(),
                target_user_id.into(),
            )
            .map(|_| None),

        ClientEvent::Typing {
            user_id,
            target_user_id,
            is_typing,
        } => session
            .typing(
                &state.hub,
                &user_id.into(),
                &target_user_id.into(),
                is_typing,
            )
            .map(|_| None),

        ClientEvent::Ping { timestamp } => Ok(Some(ServerEvent::Pong { timestamp })),
    };

    metrics::record_latency(start.elapsed().as_secs_f64());
    metrics::record_hub(&state.hub);

    match result {
        Ok(reply) => reply,
        Err(e) => {
            warn!(connection = %session.id(), error = %e, "Event handling error");
            metrics::record_error("session");
            Some(session_error_event(&e))
        }
    }
}

fn session_error_event(e: &SessionError) -> ServerEvent {
    let code = match e {
        SessionError::Closed => error_codes::INVALID_STATE,
        SessionError::InvalidEvent(_) => error_codes::INVALID_EVENT,
        SessionError::Router(_) => error_codes::INTERNAL,
    };
    ServerEvent::error(code, e.to_string())
}

/// Send an event to the WebSocket.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
    format: WireFormat,
) -> Result<()> {
    let message = match format {
        WireFormat::Text => Message::Text(encode_text(event)?),
        WireFormat::Binary => Message::Binary(codec::encode(event)?.to_vec()),
    };
    let len = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };
    metrics::record_frame(len, "outbound");
    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tether_core::{Inbox, LogNotifier, MemoryStore, RouterError};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    fn state() -> AppState {
        let mut config = Config::default();
        config.auth.jwt_secret = "test".into();
        AppState::with_parts(config, Arc::new(MemoryStore::new()), Arc::new(LogNotifier))
    }

    fn open(state: &AppState, id: &str) -> (ConnectionSession, Inbox) {
        ConnectionSession::open(&state.hub, ConnectionId::from(id)).unwrap()
    }

    fn drain(inbox: &mut Inbox) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(envelope) = inbox.try_recv() {
            events.push(envelope.event.clone());
        }
        events
    }

    #[test]
    fn test_join_and_typing_over_text_frames() {
        let state = state();
        let (mut alice, _alice_inbox) = open(&state, "conn-a");
        let (mut bob, mut bob_inbox) = open(&state, "conn-b");

        let join = r#"{"event":"joinChat","data":{"firstName":"Alice","userId":"alice","targetUserId":"bob"}}"#;
        assert!(handle_text(&mut alice, &state, join, 1024).is_none());
        let join = r#"{"event":"joinChat","data":{"firstName":"Bob","userId":"bob","targetUserId":"alice"}}"#;
        assert!(handle_text(&mut bob, &state, join, 1024).is_none());
        drain(&mut bob_inbox);

        let typing = r#"{"event":"typing","data":{"userId":"alice","targetUserId":"bob","isTyping":true}}"#;
        assert!(handle_text(&mut alice, &state, typing, 1024).is_none());

        assert_eq!(
            drain(&mut bob_inbox),
            vec![ServerEvent::UserTyping {
                user_id: "alice".into(),
                is_typing: true
            }]
        );
    }

    #[test]
    fn test_ping_gets_pong() {
        let state = state();
        let (mut session, _inbox) = open(&state, "conn-a");
        let reply = handle_text(&mut session, &state, r#"{"event":"ping","data":{"timestamp":7}}"#, 1024);
        assert_eq!(reply, Some(ServerEvent::Pong { timestamp: Some(7) }));
    }

    #[test]
    fn test_bad_frames_get_error_events() {
        let state = state();
        let (mut session, _inbox) = open(&state, "conn-a");

        match handle_text(&mut session, &state, "not json", 1024) {
            Some(ServerEvent::Error { code, .. }) => assert_eq!(code, error_codes::MALFORMED),
            other => panic!("Expected error, got {:?}", other),
        }

        let oversized = "x".repeat(2048);
        match handle_text(&mut session, &state, &oversized, 1024) {
            Some(ServerEvent::Error { code, .. }) => assert_eq!(code, error_codes::TOO_LARGE),
            other => panic!("Expected error, got {:?}", other),
        }

        let empty_ids = r#"{"event":"joinChat","data":{"userId":"","targetUserId":"bob"}}"#;
        match handle_text(&mut session, &state, empty_ids, 1024) {
            Some(ServerEvent::Error { code, .. }) => assert_eq!(code, error_codes::INVALID_EVENT),
            other => panic!("Expected error, got {:?}", other),
        }

        // The session survives every error.
        assert!(!session.is_closed());
    }

    #[test]
    fn test_binary_frames_split_across_chunks() {
        let state = state();
        let (mut session, _inbox) = open(&state, "conn-a");
        let mut buffer = BytesMut::new();

        let frame = codec::encode(&ClientEvent::Ping { timestamp: Some(1) }).unwrap();
        let (head, tail) = frame.split_at(3);

        assert!(handle_binary(&mut session, &state, &mut buffer, head, 1024).is_empty());
        let replies = handle_binary(&mut session, &state, &mut buffer, tail, 1024);
        assert_eq!(replies, vec![Some(ServerEvent::Pong { timestamp: Some(1) })]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_session_error_codes() {
        assert_eq!(
            session_error_event(&SessionError::Closed),
            ServerEvent::error(error_codes::INVALID_STATE, SessionError::Closed.to_string())
        );
        let router = SessionError::Router(RouterError::MaxConnectionsReached);
        match session_error_event(&router) {
            ServerEvent::Error { code, .. } => assert_eq!(code, error_codes::INTERNAL),
            other => panic!("Expected error, got {:?}", other),
        }
    }

    async fn next_server_event<S>(socket: &mut S) -> ServerEvent
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match socket.next().await {
                Some(Ok(WsMessage::Text(text))) => return decode_text(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("Socket closed: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_oversized_text_frame_keeps_socket_open() {
        let mut config = Config::default();
        config.auth.jwt_secret = "test".into();
        config.limits.max_message_size = 1024;
        let path = config.transport.websocket_path.clone();
        let state = AppState::with_parts(config, Arc::new(MemoryStore::new()), Arc::new(LogNotifier));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}{}", addr, path))
            .await
            .unwrap();
        assert!(matches!(
            next_server_event(&mut socket).await,
            ServerEvent::Connected { .. }
        ));

        socket.send(WsMessage::Text("x".repeat(4096))).await.unwrap();
        match next_server_event(&mut socket).await {
            ServerEvent::Error { code, .. } => assert_eq!(code, error_codes::TOO_LARGE),
            other => panic!("Expected error, got {:?}", other),
        }

        let ping = r#"{"event":"ping","data":{"timestamp":7}}"#;
        socket.send(WsMessage::Text(ping.into())).await.unwrap();
        assert_eq!(
            next_server_event(&mut socket).await,
            ServerEvent::Pong { timestamp: Some(7) }
        );
    }

    #[test]
    fn test_socket_limit_never_below_event_limit() {
        assert_eq!(socket_frame_limit(1024), codec::MAX_FRAME_SIZE);
        assert_eq!(socket_frame_limit(usize::MAX), usize::MAX);
    }
}
