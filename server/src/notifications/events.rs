//! Domain events entering the dispatcher, and how each one turns into a
//! notification plus its audience.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::auth::Role;
use crate::notifications::model::{
    notification_id, KycVerdict, Notification, NotificationPayload, PaymentOutcome, TargetRole,
};
use crate::proto::{self, ServerMessage, TripStatus};
use crate::ws::Room;

#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    RideRequested {
        ride_id: String,
        passenger_id: String,
        pickup_location_name: String,
        dropoff_location_name: String,
        requested_at: DateTime<Utc>,
    },
    RideAccepted {
        ride_id: String,
        passenger_id: String,
        driver_id: String,
        driver_name: String,
        driver_phone: String,
        estimated_arrival: Option<String>,
        accepted_at: DateTime<Utc>,
    },
    /// Tell drivers who saw a ride that it can no longer be taken.
    RideUnavailable {
        ride_id: String,
        driver_ids: Vec<String>,
        cause: TripStatus,
    },
    RideStatusChanged {
        ride_id: String,
        passenger_id: String,
        status: TripStatus,
        message: String,
        timestamp: DateTime<Utc>,
    },
    KycReviewed {
        user_id: String,
        document_id: String,
        verdict: KycVerdict,
        reason: Option<String>,
    },
    PaymentProcessed {
        payment_id: String,
        user_id: String,
        ride_id: Option<String>,
        amount: f64,
        currency: String,
        outcome: PaymentOutcome,
    },
    Announcement(Announcement),
}

/// Free-form notification posted by an admin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub target_role: Option<TargetRole>,
    #[serde(default)]
    pub target_user_ids: Vec<String>,
    #[serde(default)]
    pub link: Option<String>,
    /// Caller-chosen key; repeating it repeats the same notification id.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// What the dispatcher persists and where it pushes.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub notification: Notification,
    /// Socket event sent alongside the notification, with its rooms.
    pub companion: Option<(ServerMessage, Vec<Room>)>,
}

impl DispatchPlan {
    /// Rooms that receive the `notification` push.
    pub fn notification_rooms(&self) -> Vec<Room> {
        let n = &self.notification;
        let mut rooms: Vec<Room> = n
            .target_role
            .map(|t| t.roles().into_iter().map(Room::Role).collect())
            .unwrap_or_default();
        rooms.extend(n.target_user_ids.iter().map(|id| Room::user(id)));
        rooms
    }
}

/// Reason shown to drivers who lost a ride.
pub fn unavailable_reason(cause: TripStatus) -> &'static str {
    match cause {
        TripStatus::Canceled => "Ride was canceled",
        TripStatus::Expired => "Ride request expired",
        _ => "Ride already accepted",
    }
}

fn status_title(status: TripStatus) -> &'static str {
    match status {
        TripStatus::Accepted => "Ride accepted",
        TripStatus::Arrived => "Driver has arrived",
        TripStatus::InProgress => "Trip started",
        TripStatus::Completed => "Trip completed",
        TripStatus::Canceled => "Ride canceled",
        TripStatus::Expired => "Ride request expired",
    }
}

struct Draft {
    entity_id: String,
    occurrence: String,
    payload: NotificationPayload,
    title: String,
    message: String,
    target_role: Option<TargetRole>,
    target_user_ids: Vec<String>,
    companion: Option<(ServerMessage, Vec<Room>)>,
}

impl DomainEvent {
    /// Build the notification and push targets for this event.
    pub fn plan(self, now: DateTime<Utc>) -> DispatchPlan {
        let draft = match self {
            DomainEvent::RideRequested {
                ride_id,
                passenger_id: _,
                pickup_location_name,
                dropoff_location_name,
                requested_at,
            } => Draft {
                entity_id: ride_id.clone(),
                occurrence: "requested".to_string(),
                title: "New ride request".to_string(),
                message: format!("{} to {}", pickup_location_name, dropoff_location_name),
                target_role: Some(TargetRole::Driver),
                target_user_ids: Vec::new(),
                companion: Some((
                    ServerMessage::NewRideRequest(proto::NewRideRequest {
                        ride_id: ride_id.clone(),
                        pickup_location_name: pickup_location_name.clone(),
                        dropoff_location_name: dropoff_location_name.clone(),
                        timestamp: requested_at,
                    }),
                    vec![Room::Role(Role::Driver)],
                )),
                payload: NotificationPayload::RideRequest {
                    ride_id,
                    pickup_location_name,
                    dropoff_location_name,
                },
            },
            DomainEvent::RideAccepted {
                ride_id,
                passenger_id,
                driver_id,
                driver_name,
                driver_phone,
                estimated_arrival,
                accepted_at,
            } => {
                let message = match &estimated_arrival {
                    Some(eta) => format!("{} is on the way, arriving in {}", driver_name, eta),
                    None => format!("{} is on the way", driver_name),
                };
                Draft {
                    entity_id: ride_id.clone(),
                    occurrence: "accepted".to_string(),
                    title: status_title(TripStatus::Accepted).to_string(),
                    target_role: Some(TargetRole::Admin),
                    target_user_ids: vec![passenger_id.clone()],
                    companion: Some(status_changed(
                        &ride_id,
                        &passenger_id,
                        TripStatus::Accepted,
                        &message,
                        accepted_at,
                    )),
                    message,
                    payload: NotificationPayload::RideAccepted {
                        ride_id,
                        driver_id,
                        driver_name,
                        driver_phone,
                        estimated_arrival,
                        accepted_at,
                    },
                }
            }
            DomainEvent::RideUnavailable {
                ride_id,
                driver_ids,
                cause,
            } => {
                let reason = unavailable_reason(cause).to_string();
                Draft {
                    entity_id: ride_id.clone(),
                    occurrence: cause.as_str().to_string(),
                    title: "Ride no longer available".to_string(),
                    message: reason.clone(),
                    target_role: None,
                    target_user_ids: driver_ids,
                    companion: None,
                    payload: NotificationPayload::RideUnavailable { ride_id, reason },
                }
            }
            DomainEvent::RideStatusChanged {
                ride_id,
                passenger_id,
                status,
                message,
                timestamp,
            } => Draft {
                entity_id: ride_id.clone(),
                occurrence: status.as_str().to_string(),
                title: status_title(status).to_string(),
                target_role: Some(TargetRole::Admin),
                target_user_ids: vec![passenger_id.clone()],
                companion: Some(status_changed(
                    &ride_id,
                    &passenger_id,
                    status,
                    &message,
                    timestamp,
                )),
                message,
                payload: NotificationPayload::RideStatus { ride_id, status },
            },
            DomainEvent::KycReviewed {
                user_id,
                document_id,
                verdict,
                reason,
            } => {
                let (title, message) = match verdict {
                    KycVerdict::Approved => (
                        "Verification approved",
                        "Your documents have been verified".to_string(),
                    ),
                    KycVerdict::Rejected => (
                        "Verification rejected",
                        reason
                            .clone()
                            .unwrap_or_else(|| "Your documents could not be verified".to_string()),
                    ),
                };
                Draft {
                    entity_id: document_id.clone(),
                    occurrence: format!("{:?}", verdict).to_lowercase(),
                    title: title.to_string(),
                    message,
                    target_role: None,
                    target_user_ids: vec![user_id],
                    companion: None,
                    payload: NotificationPayload::Kyc {
                        document_id,
                        verdict,
                        reason,
                    },
                }
            }
            DomainEvent::PaymentProcessed {
                payment_id,
                user_id,
                ride_id,
                amount,
                currency,
                outcome,
            } => {
                let (title, verb) = match outcome {
                    PaymentOutcome::Succeeded => ("Payment received", "was received"),
                    PaymentOutcome::Failed => ("Payment failed", "failed"),
                    PaymentOutcome::Refunded => ("Payment refunded", "was refunded"),
                };
                Draft {
                    entity_id: payment_id.clone(),
                    occurrence: format!("{:?}", outcome).to_lowercase(),
                    title: title.to_string(),
                    message: format!("Payment of {:.2} {} {}", amount, currency, verb),
                    target_role: Some(TargetRole::Admin),
                    target_user_ids: vec![user_id],
                    companion: None,
                    payload: NotificationPayload::Payment {
                        payment_id,
                        ride_id,
                        amount,
                        currency,
                        outcome,
                    },
                }
            }
            DomainEvent::Announcement(a) => Draft {
                entity_id: "announcement".to_string(),
                occurrence: a
                    .idempotency_key
                    .unwrap_or_else(|| uuid::Uuid::now_v7().to_string()),
                title: a.title,
                message: a.message,
                target_role: a.target_role,
                target_user_ids: a.target_user_ids,
                companion: None,
                payload: NotificationPayload::General { link: a.link },
            },
        };

        let id = notification_id(draft.payload.kind(), &draft.entity_id, &draft.occurrence);
        let mut target_user_ids = draft.target_user_ids;
        target_user_ids.sort();
        target_user_ids.dedup();

        DispatchPlan {
            notification: Notification {
                id,
                payload: draft.payload,
                title: draft.title,
                message: draft.message,
                created_at: now,
                target_role: draft.target_role,
                target_user_ids,
                read_by: BTreeSet::new(),
                is_read: false,
            },
            companion: draft.companion,
        }
    }
}

fn status_changed(
    ride_id: &str,
    passenger_id: &str,
    status: TripStatus,
    message: &str,
    timestamp: DateTime<Utc>,
) -> (ServerMessage, Vec<Room>) {
    (
        ServerMessage::RideStatusChanged(proto::RideStatusChanged {
            ride_id: ride_id.to_string(),
            status,
            message: message.to_string(),
            timestamp,
        }),
        vec![
            Room::ride(ride_id),
            Room::user(passenger_id),
            Room::Role(Role::Admin),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted() -> DomainEvent {
        DomainEvent::RideAccepted {
            ride_id: "R1".to_string(),
            passenger_id: "p1".to_string(),
            driver_id: "d1".to_string(),
            driver_name: "Dana".to_string(),
            driver_phone: "555".to_string(),
            estimated_arrival: Some("4 min".to_string()),
            accepted_at: Utc::now(),
        }
    }

    #[test]
    fn test_same_event_same_id() {
        let a = accepted().plan(Utc::now());
        let b = accepted().plan(Utc::now());
        assert_eq!(a.notification.id, b.notification.id);
    }

    #[test]
    fn test_ride_accepted_audience() {
        let plan = accepted().plan(Utc::now());
        let rooms = plan.notification_rooms();
        assert!(rooms.contains(&Room::Role(Role::Admin)));
        assert!(rooms.contains(&Room::user("p1")));
        assert!(!rooms.contains(&Room::Role(Role::Driver)));

        let (msg, companion_rooms) = plan.companion.unwrap();
        assert!(matches!(msg, ServerMessage::RideStatusChanged(ref s) if s.status == TripStatus::Accepted));
        assert!(companion_rooms.contains(&Room::ride("R1")));
    }

    #[test]
    fn test_ride_requested_goes_to_drivers() {
        let plan = DomainEvent::RideRequested {
            ride_id: "R2".to_string(),
            passenger_id: "p1".to_string(),
            pickup_location_name: "Airport".to_string(),
            dropoff_location_name: "Downtown".to_string(),
            requested_at: Utc::now(),
        }
        .plan(Utc::now());
        assert_eq!(plan.notification.target_role, Some(TargetRole::Driver));
        assert_eq!(plan.notification_rooms(), vec![Room::Role(Role::Driver)]);
    }

    #[test]
    fn test_announcement_key_controls_id() {
        let announce = |key: Option<&str>| {
            DomainEvent::Announcement(Announcement {
                title: "Maintenance".to_string(),
                message: "Tonight".to_string(),
                target_role: Some(TargetRole::All),
                target_user_ids: vec![],
                link: None,
                idempotency_key: key.map(str::to_string),
            })
            .plan(Utc::now())
            .notification
            .id
        };
        assert_eq!(announce(Some("k1")), announce(Some("k1")));
        assert_ne!(announce(None), announce(None));
    }
}
