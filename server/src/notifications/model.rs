//! Notification records and their per-type payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

use crate::auth::Role;
use crate::proto::TripStatus;

/// Audience role of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetRole {
    Driver,
    User,
    Admin,
    All,
}

impl TargetRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Driver => "driver",
            Self::User => "user",
            Self::Admin => "admin",
            Self::All => "all",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "driver" => Some(Self::Driver),
            "user" => Some(Self::User),
            "admin" => Some(Self::Admin),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    /// Roles whose rooms receive a push for this target.
    pub fn roles(&self) -> Vec<Role> {
        match self {
            Self::Driver => vec![Role::Driver],
            Self::User => vec![Role::User],
            Self::Admin => vec![Role::Admin],
            Self::All => Role::ALL.to_vec(),
        }
    }
}

impl From<Role> for TargetRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Driver => Self::Driver,
            Role::User => Self::User,
            Role::Admin => Self::Admin,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    RideRequest,
    RideAccepted,
    RideUnavailable,
    RideStatus,
    Kyc,
    Payment,
    General,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RideRequest => "ride_request",
            Self::RideAccepted => "ride_accepted",
            Self::RideUnavailable => "ride_unavailable",
            Self::RideStatus => "ride_status",
            Self::Kyc => "kyc",
            Self::Payment => "payment",
            Self::General => "general",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KycVerdict {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentOutcome {
    Succeeded,
    Failed,
    Refunded,
}

/// Type-specific notification data. Serialized as `"type"` + `"data"` next to the
/// common fields of [`Notification`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum NotificationPayload {
    RideRequest {
        ride_id: String,
        pickup_location_name: String,
        dropoff_location_name: String,
    },
    RideAccepted {
        ride_id: String,
        driver_id: String,
        driver_name: String,
        driver_phone: String,
        #[serde(default)]
        estimated_arrival: Option<String>,
        accepted_at: DateTime<Utc>,
    },
    RideUnavailable {
        ride_id: String,
        reason: String,
    },
    RideStatus {
        ride_id: String,
        status: TripStatus,
    },
    Kyc {
        document_id: String,
        verdict: KycVerdict,
        #[serde(default)]
        reason: Option<String>,
    },
    Payment {
        payment_id: String,
        #[serde(default)]
        ride_id: Option<String>,
        amount: f64,
        currency: String,
        outcome: PaymentOutcome,
    },
    General {
        #[serde(default)]
        link: Option<String>,
    },
}

impl NotificationPayload {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Self::RideRequest { .. } => NotificationKind::RideRequest,
            Self::RideAccepted { .. } => NotificationKind::RideAccepted,
            Self::RideUnavailable { .. } => NotificationKind::RideUnavailable,
            Self::RideStatus { .. } => NotificationKind::RideStatus,
            Self::Kyc { .. } => NotificationKind::Kyc,
            Self::Payment { .. } => NotificationKind::Payment,
            Self::General { .. } => NotificationKind::General,
        }
    }
}

/// One delivered event, as persisted and as pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(flatten)]
    pub payload: NotificationPayload,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub target_role: Option<TargetRole>,
    #[serde(default)]
    pub target_user_ids: Vec<String>,
    #[serde(default)]
    pub read_by: BTreeSet<String>,
    #[serde(default)]
    pub is_read: bool,
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        self.payload.kind()
    }

    /// Whether the viewer has read this notification.
    pub fn is_read_by(&self, viewer_id: &str) -> bool {
        self.is_read || self.read_by.contains(viewer_id)
    }

    /// Mark as read for the viewer, keeping `is_read` and `read_by` in step.
    pub fn mark_read_by(&mut self, viewer_id: &str) {
        self.read_by.insert(viewer_id.to_string());
        self.is_read = true;
    }

    /// Copy of this record as seen by `viewer_id`.
    pub fn for_viewer(mut self, viewer_id: &str) -> Self {
        self.is_read = self.read_by.contains(viewer_id);
        self
    }
}

/// Deterministic notification id for `{type, entityId, occurrence}`.
///
/// Retried dispatches of the same logical event land on the same id.
pub fn notification_id(kind: NotificationKind, entity_id: &str, occurrence: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(entity_id.as_bytes());
    hasher.update(b":");
    hasher.update(occurrence.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}
