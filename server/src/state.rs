use std::time::Duration;

use crate::db::DbPool;
use crate::notifications::dispatcher::Dispatcher;
use crate::presence::PresenceRegistry;
use crate::rides::RideArbiter;
use crate::ws::ConnectionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// HS256 secret shared with the external auth service
    pub jwt_secret: Vec<u8>,
    /// Live sockets and their rooms
    pub connections: ConnectionRegistry,
    pub presence: PresenceRegistry,
    pub dispatcher: Dispatcher,
    pub arbiter: RideArbiter,
}

impl AppState {
    /// Wire the components around one connection registry.
    pub fn new(db: DbPool, jwt_secret: Vec<u8>, ride_expiry: Duration) -> Self {
        let connections = ConnectionRegistry::new();
        let presence = PresenceRegistry::new(connections.clone());
        let dispatcher = Dispatcher::new(db.clone(), connections.clone());
        let arbiter = RideArbiter::new(
            db.clone(),
            dispatcher.clone(),
            connections.clone(),
            ride_expiry,
        );
        Self {
            db,
            jwt_secret,
            connections,
            presence,
            dispatcher,
            arbiter,
        }
    }
}
