//! Frame helpers for a single connection's outbound channel.

use axum::extract::ws::{CloseFrame, Message};

use super::ConnectionSender;
use crate::proto::ServerMessage;

/// Encode and queue a server message. Returns false if the connection is gone.
pub fn send_message(tx: &ConnectionSender, msg: &ServerMessage) -> bool {
    match msg.to_json() {
        Some(json) => tx.send(Message::Text(json.into())).is_ok(),
        None => false,
    }
}

pub fn send_error(tx: &ConnectionSender, code: u16, message: &str) {
    send_message(
        tx,
        &ServerMessage::Error {
            code,
            message: message.to_string(),
        },
    );
}

/// Queue a close frame; the writer sends it and the client ends the session.
pub fn close_connection(tx: &ConnectionSender, code: u16, reason: &str) {
    let _ = tx.send(Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    })));
}
