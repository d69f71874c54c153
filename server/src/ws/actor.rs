use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::auth::middleware::Claims;
use crate::auth::Role;
use crate::proto::ServerMessage;
use crate::state::AppState;
use crate::ws::broadcast::{close_connection, send_message};
use crate::ws::protocol::{self, ConnectionContext, Flow};

/// Ping interval: server sends WebSocket ping every 30 seconds.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pong timeout: if pong not received within 10 seconds after ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the writer gets to flush queued frames (a close frame included)
/// after the reader loop ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Run the actor-per-connection pattern for an authenticated WebSocket.
///
/// The writer task owns the sink and forwards frames from an mpsc channel; the
/// reader loop handles inbound frames. Anything holding the connection's sender
/// (the registry, accept tasks) can push to this client.
pub async fn run_connection(socket: WebSocket, state: AppState, claims: Claims) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    let connection_id = state
        .connections
        .register(&claims.sub, claims.role, tx.clone());
    let user_id = claims.sub.clone();
    let role = claims.role;

    // Handshake ack goes first so it precedes any room traffic
    send_message(
        &tx,
        &ServerMessage::Connected {
            connection_id: connection_id.to_string(),
            user_id: user_id.clone(),
            role,
        },
    );

    state.presence.connection_opened(role);
    state.presence.resync_and_broadcast();

    if role == Role::Driver && state.connections.user_connection_count(&user_id) == 1 {
        state
            .dispatcher
            .driver_availability(&user_id, claims.display_name(), true);
    }

    tracing::info!(
        user_id = %user_id,
        role = %role,
        connection_id = %connection_id,
        "WebSocket actor started"
    );

    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    let ping_tx = tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                break;
            }

            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {}
                _ => {
                    tracing::warn!("Pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    let ctx = ConnectionContext {
        id: connection_id,
        claims,
        tx: tx.clone(),
    };

    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    if let Flow::Close(code, reason) =
                        protocol::handle_text_message(text.as_str(), &ctx, &state).await
                    {
                        close_connection(&tx, code, reason);
                        break;
                    }
                }
                Message::Binary(_) => {
                    tracing::debug!(user_id = %user_id, "Ignoring binary frame");
                }
                Message::Pong(_) => {
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(
                        user_id = %user_id,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                tracing::info!(user_id = %user_id, "WebSocket stream ended");
                break;
            }
        }
    }

    // Leave every room before anything else so no further pushes target this socket
    state.connections.unregister(connection_id);
    ping_handle.abort();

    state.presence.connection_closed(role);
    state.presence.broadcast();

    if role == Role::Driver && state.connections.user_connection_count(&user_id) == 0 {
        state
            .dispatcher
            .driver_availability(&user_id, ctx.claims.display_name(), false);
    }

    // The writer exits once every sender is gone; give it a moment to flush
    drop(ctx);
    drop(tx);
    let abort = writer_handle.abort_handle();
    if timeout(WRITER_DRAIN_TIMEOUT, writer_handle).await.is_err() {
        abort.abort();
    }

    tracing::info!(
        user_id = %user_id,
        connection_id = %connection_id,
        "WebSocket actor stopped"
    );
}

/// Writer task: receives messages from mpsc channel and forwards them to the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if ws_sender.send(msg).await.is_err() || closing {
            break;
        }
    }
}
