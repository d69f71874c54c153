//! Socket wire protocol shared by the server actor and the client connection manager.
//!
//! Every frame is a JSON text frame: `{"event": "<snake_case>", "data": {...}}`.
//! Field names inside `data` are camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::Role;
use crate::notifications::model::Notification;
use crate::presence::PresenceCount;

/// Trip progress reported through `ride_status_changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Accepted,
    Arrived,
    InProgress,
    Completed,
    Canceled,
    Expired,
}

impl TripStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Arrived => "arrived",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRideRequest {
    pub ride_id: String,
    pub pickup_location_name: String,
    pub dropoff_location_name: String,
    pub timestamp: DateTime<Utc>,
}

/// A driver's attempt to claim a ride.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideAcceptRequest {
    /// Correlates the ack with this attempt
    pub request_id: String,
    pub ride_id: String,
    pub driver_id: String,
    pub driver_name: String,
    pub driver_phone: String,
    pub passenger_id: String,
    #[serde(default)]
    pub estimated_arrival: Option<String>,
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideAcceptAck {
    pub request_id: String,
    pub ride_id: String,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideStatusChanged {
    pub ride_id: String,
    pub status: TripStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverAvailabilityUpdate {
    pub driver_id: String,
    pub driver_name: String,
    pub available: bool,
    pub timestamp: DateTime<Utc>,
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Explicit identity ack; must match the verified token.
    UserConnected { user_id: String, role: Role },
    JoinRoom { room: String },
    LeaveRoom { room: String },
    ViewRide { ride_id: String },
    RideAccepted(RideAcceptRequest),
    DriverAvailability { available: bool },
    PresenceResync,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Handshake ack, always the first frame on a connection.
    Connected {
        connection_id: String,
        user_id: String,
        role: Role,
    },
    RoomJoined { room: String },
    RoomLeft { room: String },
    NewRideRequest(NewRideRequest),
    RideAcceptedAck(RideAcceptAck),
    RideStatusChanged(RideStatusChanged),
    DriverAvailabilityUpdate(DriverAvailabilityUpdate),
    ActiveUsersUpdate(PresenceCount),
    #[serde(alias = "new_notification")]
    Notification(Notification),
    Error { code: u16, message: String },
}

impl ServerMessage {
    /// Encode as the JSON text carried in a socket frame.
    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode server message");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_shape() {
        let msg = ClientMessage::ViewRide {
            ride_id: "R1".to_string(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"event": "view_ride", "data": {"rideId": "R1"}}));

        let parsed: ClientMessage =
            serde_json::from_str(r#"{"event":"presence_resync"}"#).unwrap();
        assert_eq!(parsed, ClientMessage::PresenceResync);
    }

    #[test]
    fn test_user_connected_parses_role() {
        let parsed: ClientMessage = serde_json::from_value(json!({
            "event": "user_connected",
            "data": {"userId": "d1", "role": "driver"}
        }))
        .unwrap();
        assert_eq!(
            parsed,
            ClientMessage::UserConnected {
                user_id: "d1".to_string(),
                role: Role::Driver
            }
        );
    }

    #[test]
    fn test_active_users_update_shape() {
        let msg = ServerMessage::ActiveUsersUpdate(PresenceCount {
            total: 2,
            driver: 2,
            user: 0,
            admin: 0,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["event"], "active_users_update");
        assert_eq!(value["data"]["total"], 2);
        assert_eq!(value["data"]["driver"], 2);
    }
}
