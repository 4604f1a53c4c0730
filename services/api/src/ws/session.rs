//! Manages the WebSocket connection lifecycle for a client.
//!
//! The transport adapter is deliberately thin: it parses wire messages,
//! hands them to the session manager in receipt order, and forwards the
//! manager's broadcast events back down the socket. Disconnecting a client
//! never touches the agent; a later connection re-attaches through the
//! same event hub.

use super::protocol::{ClientMessage, ServerMessage};
use crate::manager::SessionError;
use crate::state::AppState;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

#[instrument(name = "ws_connection", skip_all, fields(conn_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let conn_id: u32 = rand::random();
    tracing::Span::current().record("conn_id", conn_id);
    info!("client connected");

    let (mut sink, mut stream) = socket.split();
    let mut events = state.manager.subscribe();

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => dispatch(&state, &text).await,
                    Some(Ok(Message::Close(_))) | None => {
                        info!("client disconnected");
                        break;
                    }
                    Some(Ok(_)) => {} // binary / ping / pong
                    Some(Err(e)) => {
                        warn!(error = ?e, "websocket receive error");
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(msg) => {
                        if send_msg(&mut sink, &msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event hub lagged; client should request state");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Translates one wire message into a session-manager call. Failures end in
/// a client-visible error event, never in a dropped connection.
async fn dispatch(state: &Arc<AppState>, text: &str) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "malformed client message");
            state
                .manager
                .notify_error(format!("malformed message: {e}"));
            return;
        }
    };

    let manager = &state.manager;
    let result = match msg {
        ClientMessage::GetState => manager.send_state().await,
        ClientMessage::NewSession { topic, immersion } => manager
            .start_session(&topic, immersion)
            .await
            .map(|_| ()),
        ClientMessage::Chat { text, immersion } => manager.chat(&text, immersion).await,
        ClientMessage::EndSession { discard } => manager.end_session(discard).await,
        ClientMessage::ResumeSession { session_id } => {
            manager.resume_or_reconnect(Some(session_id), None).await
        }
        ClientMessage::Reconnect { immersion } => {
            manager.resume_or_reconnect(None, immersion).await
        }
        ClientMessage::ToolAnswer {
            tool_call_id,
            answer,
        } => {
            manager.resolve_tool(&tool_call_id, answer).await;
            Ok(())
        }
    };

    match result {
        Ok(()) => {}
        Err(SessionError::NoActiveSession) => {
            manager.notify_error("no active session");
        }
        Err(e) => {
            error!(error = %e, "session operation failed");
            manager.notify_error(e.to_string());
        }
    }
}

async fn send_msg(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> anyhow::Result<()> {
    let serialized = serde_json::to_string(msg)?;
    sink.send(Message::Text(serialized.into())).await?;
    Ok(())
}
