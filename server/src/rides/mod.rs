//! Ride acceptance: at most one driver wins each ride.

pub mod arbiter;
pub mod routes;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::notifications::dispatcher::DispatchError;

pub use arbiter::{AcceptOutcome, RideArbiter};

/// Lifecycle of a ride claim. Moves only out of `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Pending,
    Accepted,
    Expired,
    Canceled,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Expired => "expired",
            Self::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "expired" => Some(Self::Expired),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

/// The authoritative record a ride's acceptance is decided against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideClaim {
    pub ride_id: String,
    pub passenger_id: String,
    pub pickup_location_name: String,
    pub dropoff_location_name: String,
    pub status: ClaimStatus,
    pub winning_driver_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// A ride to open for acceptance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRide {
    pub ride_id: String,
    pub pickup_location_name: String,
    pub dropoff_location_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RideError {
    #[error("Ride not found")]
    NotFound,
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("ride storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl From<rusqlite::Error> for RideError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<tokio::task::JoinError> for RideError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Storage(format!("task join error: {}", e))
    }
}
