//! Per-role count of live connections.
//!
//! Counters move on connect and disconnect and are replaced wholesale by `resync`,
//! which recomputes them from the connection registry. Every change is pushed to
//! `role:admin` as `active_users_update`. Counts are advisory only.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::middleware::Claims;
use crate::auth::Role;
use crate::proto::ServerMessage;
use crate::state::AppState;
use crate::ws::{ConnectionRegistry, Room};

/// Snapshot of live connections by role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceCount {
    pub total: usize,
    pub driver: usize,
    pub user: usize,
    pub admin: usize,
}

impl PresenceCount {
    /// Build a count whose total is the sum of the roles.
    pub fn from_roles(driver: usize, user: usize, admin: usize) -> Self {
        Self {
            total: driver + user + admin,
            driver,
            user,
            admin,
        }
    }
}

#[derive(Default)]
struct RoleCounters {
    driver: AtomicUsize,
    user: AtomicUsize,
    admin: AtomicUsize,
}

impl RoleCounters {
    fn for_role(&self, role: Role) -> &AtomicUsize {
        match role {
            Role::Driver => &self.driver,
            Role::User => &self.user,
            Role::Admin => &self.admin,
        }
    }
}

#[derive(Clone)]
pub struct PresenceRegistry {
    counters: Arc<RoleCounters>,
    connections: ConnectionRegistry,
}

impl PresenceRegistry {
    pub fn new(connections: ConnectionRegistry) -> Self {
        Self {
            counters: Arc::new(RoleCounters::default()),
            connections,
        }
    }

    pub fn connection_opened(&self, role: Role) {
        self.counters.for_role(role).fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement, never going below zero.
    pub fn connection_closed(&self, role: Role) {
        let _ = self.counters.for_role(role).fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| Some(n.saturating_sub(1)),
        );
    }

    pub fn snapshot(&self) -> PresenceCount {
        PresenceCount::from_roles(
            self.counters.driver.load(Ordering::SeqCst),
            self.counters.user.load(Ordering::SeqCst),
            self.counters.admin.load(Ordering::SeqCst),
        )
    }

    /// Replace every counter with the count recomputed from live connections.
    pub fn resync(&self) -> PresenceCount {
        let live = self.connections.role_counts();
        self.counters.driver.store(live.driver, Ordering::SeqCst);
        self.counters.user.store(live.user, Ordering::SeqCst);
        self.counters.admin.store(live.admin, Ordering::SeqCst);
        live
    }

    /// Push the current snapshot to admins.
    pub fn broadcast(&self) {
        let count = self.snapshot();
        self.connections.send_to_rooms(
            &[Room::Role(Role::Admin)],
            &ServerMessage::ActiveUsersUpdate(count),
        );
    }

    pub fn resync_and_broadcast(&self) -> PresenceCount {
        let count = self.resync();
        self.broadcast();
        count
    }

    /// Periodic resync so the counters converge even if an update was missed.
    pub fn spawn_resync_task(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let presence = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(every);
            // First tick fires immediately
            timer.tick().await;
            loop {
                timer.tick().await;
                let before = presence.snapshot();
                let after = presence.resync();
                if before != after {
                    tracing::info!(
                        ?before,
                        ?after,
                        "Presence counters drifted, resynced"
                    );
                    presence.broadcast();
                }
            }
        })
    }
}

/// GET /api/presence
/// Current per-role connection counts. Admin only.
pub async fn get_presence(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<PresenceCount>, StatusCode> {
    if !claims.is_admin() {
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(Json(state.presence.snapshot()))
}
