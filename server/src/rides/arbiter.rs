use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::Connection;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::middleware::Claims;
use crate::auth::Role;
use crate::db::DbPool;
use crate::notifications::dispatcher::Dispatcher;
use crate::notifications::events::DomainEvent;
use crate::proto::{RideAcceptRequest, TripStatus};
use crate::rides::store::{self, Transition};
use crate::rides::{ClaimStatus, NewRide, RideClaim, RideError};
use crate::ws::{ConnectionRegistry, Room};

/// How an acceptance attempt resolved. Losing is an expected outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum AcceptOutcome {
    Won(RideClaim),
    /// The claim had already left `Pending`; carries where it went.
    Lost(ClaimStatus),
}

/// Decides ride ownership against the stored claim and fans out the result.
#[derive(Clone)]
pub struct RideArbiter {
    db: DbPool,
    dispatcher: Dispatcher,
    connections: ConnectionRegistry,
    expiry: Duration,
    /// Drivers who were shown each open ride, by ride id
    viewers: Arc<DashMap<String, HashSet<String>>>,
}

impl RideArbiter {
    pub fn new(
        db: DbPool,
        dispatcher: Dispatcher,
        connections: ConnectionRegistry,
        expiry: Duration,
    ) -> Self {
        Self {
            db,
            dispatcher,
            connections,
            expiry,
            viewers: Arc::new(DashMap::new()),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, RideError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, RideError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| RideError::Storage("database lock poisoned".to_string()))?;
            f(&conn)
        })
        .await?
    }

    /// Open a ride for acceptance and announce it to drivers.
    pub async fn open(&self, passenger_id: &str, ride: NewRide) -> Result<RideClaim, RideError> {
        if ride.ride_id.trim().is_empty() {
            return Err(RideError::InvalidState("rideId is required".to_string()));
        }
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.expiry)
            .map_err(|_| RideError::InvalidState("ride expiry out of range".to_string()))?;
        let claim = RideClaim {
            ride_id: ride.ride_id,
            passenger_id: passenger_id.to_string(),
            pickup_location_name: ride.pickup_location_name,
            dropoff_location_name: ride.dropoff_location_name,
            status: ClaimStatus::Pending,
            winning_driver_id: None,
            created_at: now,
            expires_at: now + ttl,
            decided_at: None,
        };

        let to_insert = claim.clone();
        self.blocking(move |conn| store::insert_claim(conn, &to_insert))
            .await?;

        let online_drivers = self.connections.users_in_room(&Room::Role(Role::Driver));
        self.viewers.insert(claim.ride_id.clone(), online_drivers);

        let announced = self
            .dispatcher
            .dispatch(DomainEvent::RideRequested {
                ride_id: claim.ride_id.clone(),
                passenger_id: claim.passenger_id.clone(),
                pickup_location_name: claim.pickup_location_name.clone(),
                dropoff_location_name: claim.dropoff_location_name.clone(),
                requested_at: claim.created_at,
            })
            .await;
        if let Err(e) = announced {
            // Unannounced rides are withdrawn so the passenger can retry the same id
            tracing::error!(ride_id = %claim.ride_id, error = %e, "Failed to announce ride");
            self.viewers.remove(&claim.ride_id);
            let id = claim.ride_id.clone();
            let withdrawn = self
                .blocking(move |conn| store::delete_pending_claim(conn, &id))
                .await?;
            if withdrawn {
                return Err(e.into());
            }
            return self.claim(&claim.ride_id).await;
        }

        self.arm_expiry(claim.ride_id.clone(), claim.expires_at);
        tracing::info!(
            ride_id = %claim.ride_id,
            passenger_id = %passenger_id,
            expires_at = %claim.expires_at,
            "Ride opened"
        );
        Ok(claim)
    }

    /// Attempt to claim a ride for the requesting driver.
    pub async fn accept(&self, request: &RideAcceptRequest) -> Result<AcceptOutcome, RideError> {
        let ride_id = request.ride_id.clone();
        let driver_id = request.driver_id.clone();
        let transition = self
            .blocking(move |conn| {
                store::try_transition(
                    conn,
                    &ride_id,
                    ClaimStatus::Accepted,
                    Some(driver_id.as_str()),
                    Utc::now(),
                    true,
                )
            })
            .await?;

        let claim = match transition {
            Transition::Applied(claim) => claim,
            Transition::Rejected(ClaimStatus::Pending) => {
                // Still pending but past its deadline
                self.expire(&request.ride_id).await?;
                return Ok(AcceptOutcome::Lost(ClaimStatus::Expired));
            }
            Transition::Rejected(status) => {
                tracing::debug!(
                    ride_id = %request.ride_id,
                    driver_id = %request.driver_id,
                    status = status.as_str(),
                    "Accept attempt lost"
                );
                return Ok(AcceptOutcome::Lost(status));
            }
        };

        tracing::info!(
            ride_id = %claim.ride_id,
            driver_id = %request.driver_id,
            "Ride accepted"
        );

        let ride_room = Room::ride(&claim.ride_id);
        self.connections.join_user(&request.driver_id, &ride_room);
        self.connections.join_user(&claim.passenger_id, &ride_room);

        let losers = self.take_viewers(&claim.ride_id, Some(request.driver_id.as_str()));
        let accepted_at = request
            .accepted_at
            .or(claim.decided_at)
            .unwrap_or_else(Utc::now);

        // The claim is decided; fan-out failures are logged, not returned.
        if let Err(e) = self
            .dispatcher
            .dispatch(DomainEvent::RideAccepted {
                ride_id: claim.ride_id.clone(),
                passenger_id: claim.passenger_id.clone(),
                driver_id: request.driver_id.clone(),
                driver_name: request.driver_name.clone(),
                driver_phone: request.driver_phone.clone(),
                estimated_arrival: request.estimated_arrival.clone(),
                accepted_at,
            })
            .await
        {
            tracing::error!(ride_id = %claim.ride_id, error = %e, "Failed to notify ride acceptance");
        }
        self.notify_unavailable(&claim.ride_id, losers, TripStatus::Accepted)
            .await;

        Ok(AcceptOutcome::Won(claim))
    }

    /// Expire a ride that is still pending. Returns None if it was already resolved.
    pub async fn expire(&self, ride_id: &str) -> Result<Option<RideClaim>, RideError> {
        let id = ride_id.to_string();
        let transition = self
            .blocking(move |conn| {
                store::try_transition(conn, &id, ClaimStatus::Expired, None, Utc::now(), false)
            })
            .await?;

        let Transition::Applied(claim) = transition else {
            return Ok(None);
        };
        tracing::info!(ride_id = %ride_id, "Ride request expired");

        let viewers = self.take_viewers(ride_id, None);
        self.notify_unavailable(ride_id, viewers, TripStatus::Expired)
            .await;
        self.notify_passenger(
            &claim,
            TripStatus::Expired,
            "No driver accepted your ride in time",
        )
        .await;
        Ok(Some(claim))
    }

    /// Withdraw a pending ride. Only its passenger or an admin may cancel.
    pub async fn cancel(&self, ride_id: &str, actor: &Claims) -> Result<RideClaim, RideError> {
        let existing = self.claim(ride_id).await?;
        if existing.passenger_id != actor.sub && !actor.is_admin() {
            return Err(RideError::Forbidden(
                "Only the passenger or an admin can cancel this ride".to_string(),
            ));
        }

        let id = ride_id.to_string();
        let transition = self
            .blocking(move |conn| {
                store::try_transition(conn, &id, ClaimStatus::Canceled, None, Utc::now(), false)
            })
            .await?;
        let claim = match transition {
            Transition::Applied(claim) => claim,
            Transition::Rejected(status) => {
                return Err(RideError::InvalidState(format!(
                    "Ride is already {}",
                    status.as_str()
                )))
            }
        };
        tracing::info!(ride_id = %ride_id, actor = %actor.sub, "Ride canceled");

        let viewers = self.take_viewers(ride_id, None);
        self.notify_unavailable(ride_id, viewers, TripStatus::Canceled)
            .await;
        self.notify_passenger(&claim, TripStatus::Canceled, "The ride request was canceled")
            .await;
        Ok(claim)
    }

    /// Publish trip progress after acceptance. Winning driver or admin only.
    pub async fn update_status(
        &self,
        ride_id: &str,
        actor: &Claims,
        status: TripStatus,
        message: Option<String>,
    ) -> Result<RideClaim, RideError> {
        if matches!(status, TripStatus::Accepted | TripStatus::Expired) {
            return Err(RideError::InvalidState(format!(
                "Status {} is set by the ride arbiter",
                status.as_str()
            )));
        }
        let claim = self.claim(ride_id).await?;
        if claim.status != ClaimStatus::Accepted {
            return Err(RideError::InvalidState(
                "Ride has not been accepted".to_string(),
            ));
        }
        let is_winner = claim.winning_driver_id.as_deref() == Some(actor.sub.as_str());
        if !is_winner && !actor.is_admin() {
            return Err(RideError::Forbidden(
                "Only the assigned driver can update this ride".to_string(),
            ));
        }

        let message = message.unwrap_or_else(|| default_status_message(status).to_string());
        self.dispatcher
            .dispatch(DomainEvent::RideStatusChanged {
                ride_id: claim.ride_id.clone(),
                passenger_id: claim.passenger_id.clone(),
                status,
                message,
                timestamp: Utc::now(),
            })
            .await?;
        Ok(claim)
    }

    pub async fn claim(&self, ride_id: &str) -> Result<RideClaim, RideError> {
        let id = ride_id.to_string();
        self.blocking(move |conn| store::claim_by_id(conn, &id))
            .await?
            .ok_or(RideError::NotFound)
    }

    /// Record that a driver saw a ride. Returns false if the ride is not open.
    pub async fn view(&self, ride_id: &str, driver_id: &str) -> Result<bool, RideError> {
        let claim = self.claim(ride_id).await?;
        if claim.status != ClaimStatus::Pending {
            return Ok(false);
        }
        self.viewers
            .entry(ride_id.to_string())
            .or_default()
            .insert(driver_id.to_string());

        // The ride may have been decided while the view was recorded
        let claim = self.claim(ride_id).await?;
        if claim.status != ClaimStatus::Pending {
            if let Some(driver_ids) = self.viewers.remove(ride_id).map(|(_, set)| set) {
                let cause = match claim.status {
                    ClaimStatus::Expired => TripStatus::Expired,
                    ClaimStatus::Canceled => TripStatus::Canceled,
                    _ => TripStatus::Accepted,
                };
                let driver_ids = driver_ids
                    .into_iter()
                    .filter(|d| claim.winning_driver_id.as_deref() != Some(d.as_str()))
                    .collect();
                self.notify_unavailable(ride_id, driver_ids, cause).await;
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// Re-arm timers for pending claims after a restart and expire overdue ones.
    pub async fn restore(&self) -> Result<usize, RideError> {
        let pending = self.blocking(store::pending_claims).await?;
        let now = Utc::now();
        let mut armed = 0;
        for claim in pending {
            if claim.expires_at <= now {
                if let Err(e) = self.expire(&claim.ride_id).await {
                    tracing::error!(ride_id = %claim.ride_id, error = %e, "Failed to expire overdue ride");
                }
            } else {
                self.viewers.entry(claim.ride_id.clone()).or_default();
                self.arm_expiry(claim.ride_id, claim.expires_at);
                armed += 1;
            }
        }
        if armed > 0 {
            tracing::info!(armed, "Restored pending ride timers");
        }
        Ok(armed)
    }

    fn arm_expiry(&self, ride_id: String, deadline: DateTime<Utc>) {
        let arbiter = self.clone();
        let wait = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Err(e) = arbiter.expire(&ride_id).await {
                tracing::error!(ride_id = %ride_id, error = %e, "Failed to expire ride");
            }
        });
    }

    fn take_viewers(&self, ride_id: &str, except: Option<&str>) -> Vec<String> {
        let mut viewers: Vec<String> = self
            .viewers
            .remove(ride_id)
            .map(|(_, set)| set.into_iter().collect())
            .unwrap_or_default();
        if let Some(skip) = except {
            viewers.retain(|v| v != skip);
        }
        viewers
    }

    /// Tell the passenger how a decided ride ended. Failures are logged, the claim stands.
    async fn notify_passenger(&self, claim: &RideClaim, status: TripStatus, message: &str) {
        if let Err(e) = self
            .dispatcher
            .dispatch(DomainEvent::RideStatusChanged {
                ride_id: claim.ride_id.clone(),
                passenger_id: claim.passenger_id.clone(),
                status,
                message: message.to_string(),
                timestamp: claim.decided_at.unwrap_or_else(Utc::now),
            })
            .await
        {
            tracing::error!(
                ride_id = %claim.ride_id,
                status = status.as_str(),
                error = %e,
                "Failed to notify passenger"
            );
        }
    }

    async fn notify_unavailable(&self, ride_id: &str, driver_ids: Vec<String>, cause: TripStatus) {
        if driver_ids.is_empty() {
            return;
        }
        if let Err(e) = self
            .dispatcher
            .dispatch(DomainEvent::RideUnavailable {
                ride_id: ride_id.to_string(),
                driver_ids,
                cause,
            })
            .await
        {
            tracing::error!(ride_id = %ride_id, error = %e, "Failed to notify drivers");
        }
    }
}

/// Whether the caller may see a ride and join its room.
pub fn is_participant(claim: &RideClaim, user_id: &str, role: Role) -> bool {
    role == Role::Admin
        || claim.passenger_id == user_id
        || claim.winning_driver_id.as_deref() == Some(user_id)
}

/// Ack text for an acceptance attempt.
pub fn ack_message(result: &Result<AcceptOutcome, RideError>) -> (bool, String) {
    match result {
        Ok(AcceptOutcome::Won(_)) => (true, "Ride accepted".to_string()),
        Ok(AcceptOutcome::Lost(ClaimStatus::Expired)) => (false, "Ride request expired".to_string()),
        Ok(AcceptOutcome::Lost(ClaimStatus::Canceled)) => (false, "Ride was canceled".to_string()),
        Ok(AcceptOutcome::Lost(_)) => (false, "Ride already accepted".to_string()),
        Err(RideError::NotFound) => (false, "Ride not found".to_string()),
        Err(e) => (false, e.to_string()),
    }
}

fn default_status_message(status: TripStatus) -> &'static str {
    match status {
        TripStatus::Arrived => "Your driver has arrived",
        TripStatus::InProgress => "Your trip is underway",
        TripStatus::Completed => "You have arrived at your destination",
        TripStatus::Canceled => "The trip was canceled",
        TripStatus::Accepted => "Your ride was accepted",
        TripStatus::Expired => "Your ride request expired",
    }
}
