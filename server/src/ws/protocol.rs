use crate::auth::middleware::Claims;
use crate::auth::Role;
use crate::proto::{ClientMessage, RideAcceptAck, RideAcceptRequest, ServerMessage};
use crate::rides::arbiter::{ack_message, is_participant};
use crate::rides::RideError;
use crate::state::AppState;
use crate::ws::broadcast::{send_error, send_message};
use crate::ws::handler::CLOSE_TOKEN_INVALID;
use crate::ws::{ConnectionId, ConnectionSender, Room};

/// Identity and outbound channel of the connection a frame arrived on.
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub claims: Claims,
    pub tx: ConnectionSender,
}

/// What the reader loop does after a frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Close the socket with this code and reason.
    Close(u16, &'static str),
}

/// Handle an incoming text frame.
pub async fn handle_text_message(text: &str, ctx: &ConnectionContext, state: &AppState) -> Flow {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(
                user_id = %ctx.claims.sub,
                error = %e,
                "Failed to decode client message"
            );
            send_error(&ctx.tx, 400, "Invalid message");
            return Flow::Continue;
        }
    };

    match msg {
        ClientMessage::UserConnected { user_id, role } => {
            if user_id != ctx.claims.sub || role != ctx.claims.role {
                tracing::warn!(
                    user_id = %ctx.claims.sub,
                    claimed_user = %user_id,
                    claimed_role = %role,
                    "Identity mismatch on user_connected"
                );
                return Flow::Close(CLOSE_TOKEN_INVALID, "Identity mismatch");
            }
            tracing::debug!(user_id = %user_id, "Identity confirmed");
        }
        ClientMessage::JoinRoom { room } => handle_join_room(&room, ctx, state).await,
        ClientMessage::LeaveRoom { room } => handle_leave_room(&room, ctx, state),
        ClientMessage::ViewRide { ride_id } => handle_view_ride(&ride_id, ctx, state).await,
        ClientMessage::RideAccepted(request) => handle_ride_accepted(request, ctx, state),
        ClientMessage::DriverAvailability { available } => {
            if ctx.claims.role != Role::Driver {
                send_error(&ctx.tx, 403, "Only drivers report availability");
            } else {
                state.dispatcher.driver_availability(
                    &ctx.claims.sub,
                    ctx.claims.display_name(),
                    available,
                );
            }
        }
        ClientMessage::PresenceResync => {
            let before = state.presence.snapshot();
            let count = state.presence.resync();
            send_message(&ctx.tx, &ServerMessage::ActiveUsersUpdate(count));
            if before != count {
                state.presence.broadcast();
            }
        }
    }
    Flow::Continue
}

/// Clients may only join ride rooms they take part in.
async fn handle_join_room(raw: &str, ctx: &ConnectionContext, state: &AppState) {
    let room: Room = match raw.parse() {
        Ok(room) => room,
        Err(_) => {
            send_error(&ctx.tx, 400, "Invalid room");
            return;
        }
    };
    let Room::Ride(ride_id) = &room else {
        send_error(&ctx.tx, 403, "Only ride rooms can be joined");
        return;
    };

    match state.arbiter.claim(ride_id).await {
        Ok(claim) if is_participant(&claim, &ctx.claims.sub, ctx.claims.role) => {
            state.connections.join(ctx.id, &room);
            send_message(
                &ctx.tx,
                &ServerMessage::RoomJoined {
                    room: room.to_string(),
                },
            );
        }
        Ok(_) => send_error(&ctx.tx, 403, "Not a participant of this ride"),
        Err(RideError::NotFound) => send_error(&ctx.tx, 404, "Ride not found"),
        Err(e) => {
            tracing::error!(ride_id = %ride_id, error = %e, "Failed to load ride for join");
            send_error(&ctx.tx, 500, "Internal error");
        }
    }
}

fn handle_leave_room(raw: &str, ctx: &ConnectionContext, state: &AppState) {
    let Ok(room) = raw.parse::<Room>() else {
        send_error(&ctx.tx, 400, "Invalid room");
        return;
    };
    if state.connections.leave(ctx.id, &room) {
        send_message(
            &ctx.tx,
            &ServerMessage::RoomLeft {
                room: room.to_string(),
            },
        );
    } else {
        send_error(&ctx.tx, 400, "Cannot leave this room");
    }
}

async fn handle_view_ride(ride_id: &str, ctx: &ConnectionContext, state: &AppState) {
    if ctx.claims.role != Role::Driver {
        return;
    }
    match state.arbiter.view(ride_id, &ctx.claims.sub).await {
        Ok(_) => {}
        Err(RideError::NotFound) => send_error(&ctx.tx, 404, "Ride not found"),
        Err(e) => tracing::error!(ride_id = %ride_id, error = %e, "Failed to record ride view"),
    }
}

/// Resolve the attempt in its own task so it completes even if this
/// connection drops before the ack is written.
fn handle_ride_accepted(request: RideAcceptRequest, ctx: &ConnectionContext, state: &AppState) {
    if ctx.claims.role != Role::Driver || request.driver_id != ctx.claims.sub {
        send_message(
            &ctx.tx,
            &ServerMessage::RideAcceptedAck(RideAcceptAck {
                request_id: request.request_id,
                ride_id: request.ride_id,
                success: false,
                message: "Only the authenticated driver can accept this ride".to_string(),
            }),
        );
        return;
    }

    let arbiter = state.arbiter.clone();
    let connections = state.connections.clone();
    let connection_id = ctx.id;
    tokio::spawn(async move {
        let result = arbiter.accept(&request).await;
        if let Err(e) = &result {
            if !matches!(e, RideError::NotFound) {
                tracing::error!(ride_id = %request.ride_id, error = %e, "Ride accept failed");
            }
        }
        let (success, message) = ack_message(&result);
        let delivered = connections.send_to_connection(
            connection_id,
            &ServerMessage::RideAcceptedAck(RideAcceptAck {
                request_id: request.request_id.clone(),
                ride_id: request.ride_id.clone(),
                success,
                message,
            }),
        );
        if !delivered {
            tracing::info!(
                ride_id = %request.ride_id,
                driver_id = %request.driver_id,
                success,
                "Accept resolved after the driver disconnected"
            );
        }
    });
}
