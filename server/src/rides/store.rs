//! Ride claim rows and the single conditional update that decides them.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use crate::db::{format_ts, parse_ts};
use crate::rides::{ClaimStatus, RideClaim, RideError};

/// Result of a compare-and-set on a claim's status.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// This call moved the claim out of `Pending`.
    Applied(RideClaim),
    /// The claim was not eligible; carries the status it had.
    Rejected(ClaimStatus),
}

const CLAIM_COLUMNS: &str = "ride_id, passenger_id, pickup_location_name, dropoff_location_name,
    status, winning_driver_id, created_at, expires_at, decided_at";

pub fn insert_claim(conn: &Connection, claim: &RideClaim) -> Result<(), RideError> {
    let result = conn.execute(
        "INSERT INTO ride_claims
            (ride_id, passenger_id, pickup_location_name, dropoff_location_name,
             status, winning_driver_id, created_at, expires_at, decided_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            claim.ride_id,
            claim.passenger_id,
            claim.pickup_location_name,
            claim.dropoff_location_name,
            claim.status.as_str(),
            claim.winning_driver_id,
            format_ts(&claim.created_at),
            format_ts(&claim.expires_at),
            claim.decided_at.as_ref().map(format_ts),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::ConstraintViolation => {
            Err(RideError::Conflict(format!("Ride {} already exists", claim.ride_id)))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn claim_by_id(conn: &Connection, ride_id: &str) -> Result<Option<RideClaim>, RideError> {
    let sql = format!("SELECT {} FROM ride_claims WHERE ride_id = ?1", CLAIM_COLUMNS);
    conn.query_row(&sql, params![ride_id], read_claim)
        .optional()?
        .transpose()
}

/// Move a pending claim to `to`.
///
/// The status check and the write are one UPDATE, so among concurrent callers
/// exactly one sees a changed row. With `before_deadline` the claim must also be
/// unexpired at `now`. `winner` is recorded as the winning driver when given.
pub fn try_transition(
    conn: &Connection,
    ride_id: &str,
    to: ClaimStatus,
    winner: Option<&str>,
    now: DateTime<Utc>,
    before_deadline: bool,
) -> Result<Transition, RideError> {
    let now_ts = format_ts(&now);
    let changed = conn.execute(
        "UPDATE ride_claims
         SET status = ?1, winning_driver_id = COALESCE(?2, winning_driver_id), decided_at = ?3
         WHERE ride_id = ?4 AND status = 'pending' AND (?5 = 0 OR expires_at > ?3)",
        params![to.as_str(), winner, now_ts, ride_id, before_deadline],
    )?;

    let claim = claim_by_id(conn, ride_id)?.ok_or(RideError::NotFound)?;
    if changed == 1 {
        Ok(Transition::Applied(claim))
    } else {
        Ok(Transition::Rejected(claim.status))
    }
}

/// Remove a claim that no driver has decided yet. Returns false if it had already left `Pending`.
pub fn delete_pending_claim(conn: &Connection, ride_id: &str) -> Result<bool, RideError> {
    let deleted = conn.execute(
        "DELETE FROM ride_claims WHERE ride_id = ?1 AND status = 'pending'",
        params![ride_id],
    )?;
    Ok(deleted == 1)
}

/// Claims still waiting for a driver, oldest first.
pub fn pending_claims(conn: &Connection) -> Result<Vec<RideClaim>, RideError> {
    let sql = format!(
        "SELECT {} FROM ride_claims WHERE status = 'pending' ORDER BY created_at",
        CLAIM_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], read_claim)?;
    let mut claims = Vec::new();
    for row in rows {
        claims.push(row??);
    }
    Ok(claims)
}

fn read_claim(row: &Row<'_>) -> rusqlite::Result<Result<RideClaim, RideError>> {
    let ride_id: String = row.get(0)?;
    let status: String = row.get(4)?;
    let created_at: String = row.get(6)?;
    let expires_at: String = row.get(7)?;
    let decided_at: Option<String> = row.get(8)?;

    let corrupt = |what: &str| RideError::Storage(format!("ride {} has invalid {}", ride_id, what));
    let parsed = (|| -> Result<RideClaim, RideError> {
        Ok(RideClaim {
            ride_id: ride_id.clone(),
            passenger_id: row.get(1)?,
            pickup_location_name: row.get(2)?,
            dropoff_location_name: row.get(3)?,
            status: ClaimStatus::from_str(&status).ok_or_else(|| corrupt("status"))?,
            winning_driver_id: row.get(5)?,
            created_at: parse_ts(&created_at).map_err(|_| corrupt("created_at"))?,
            expires_at: parse_ts(&expires_at).map_err(|_| corrupt("expires_at"))?,
            decided_at: decided_at
                .as_deref()
                .map(parse_ts)
                .transpose()
                .map_err(|_| corrupt("decided_at"))?,
        })
    })();
    Ok(parsed)
}
