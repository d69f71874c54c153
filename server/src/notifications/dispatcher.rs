use chrono::{SubsecRound, Utc};

use crate::auth::Role;
use crate::db::DbPool;
use crate::notifications::events::DomainEvent;
use crate::notifications::model::Notification;
use crate::notifications::store::{self, NotificationError};
use crate::proto::{DriverAvailabilityUpdate, ServerMessage};
use crate::ws::{ConnectionRegistry, Room};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to persist notification: {0}")]
    Persist(#[from] NotificationError),
}

/// Turns domain events into stored notifications and live pushes.
///
/// Persist happens before push: a notification that reached a socket is always
/// in the next REST snapshot.
#[derive(Clone)]
pub struct Dispatcher {
    db: DbPool,
    connections: ConnectionRegistry,
}

impl Dispatcher {
    pub fn new(db: DbPool, connections: ConnectionRegistry) -> Self {
        Self { db, connections }
    }

    pub async fn dispatch(&self, event: DomainEvent) -> Result<Notification, DispatchError> {
        // Stored timestamps keep milliseconds; push the same value that is stored
        let plan = event.plan(Utc::now().trunc_subsecs(3));
        let rooms = plan.notification_rooms();

        let db = self.db.clone();
        let fresh = plan.notification.clone();
        let (stored, inserted) = tokio::task::spawn_blocking(move || -> Result<(Notification, bool), NotificationError> {
            let mut conn = db.lock().map_err(|_| NotificationError::LockPoisoned)?;
            if store::insert_notification(&mut conn, &fresh)? {
                return Ok((fresh, true));
            }
            // Retried dispatch: reuse the row already stored under this id
            let existing = store::get_notification(&conn, &fresh.id)?.unwrap_or(fresh);
            Ok((existing, false))
        })
        .await
        .map_err(NotificationError::from)??;

        // Read receipts are per viewer; clients keep their own read state on merge
        let mut pushed = stored.clone();
        pushed.read_by.clear();
        pushed.is_read = false;
        let reached = self
            .connections
            .send_to_rooms(&rooms, &ServerMessage::Notification(pushed));

        if let Some((msg, companion_rooms)) = &plan.companion {
            self.connections.send_to_rooms(companion_rooms, msg);
        }

        tracing::info!(
            notification_id = %stored.id,
            kind = %stored.kind(),
            inserted,
            reached,
            "Notification dispatched"
        );
        Ok(stored)
    }

    /// Push a message that is not persisted.
    pub fn broadcast(&self, rooms: &[Room], msg: &ServerMessage) -> usize {
        self.connections.send_to_rooms(rooms, msg)
    }

    /// Tell admins a driver went on or off line.
    pub fn driver_availability(&self, driver_id: &str, driver_name: &str, available: bool) {
        let msg = ServerMessage::DriverAvailabilityUpdate(DriverAvailabilityUpdate {
            driver_id: driver_id.to_string(),
            driver_name: driver_name.to_string(),
            available,
            timestamp: Utc::now(),
        });
        self.broadcast(&[Room::Role(Role::Admin)], &msg);
        tracing::debug!(driver_id = %driver_id, available, "Driver availability broadcast");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::notifications::events::Announcement;
    use crate::notifications::model::TargetRole;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc;

    fn announcement(key: &str) -> DomainEvent {
        DomainEvent::Announcement(Announcement {
            title: "Heads up".to_string(),
            message: "Surge pricing downtown".to_string(),
            target_role: Some(TargetRole::Driver),
            target_user_ids: vec![],
            link: None,
            idempotency_key: Some(key.to_string()),
        })
    }

    #[tokio::test]
    async fn test_retried_dispatch_reuses_row_and_pushes_again() {
        let connections = ConnectionRegistry::new();
        let dispatcher = Dispatcher::new(open_in_memory().unwrap(), connections.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        connections.register("d1", Role::Driver, tx);

        let first = dispatcher.dispatch(announcement("k")).await.unwrap();
        let second = dispatcher.dispatch(announcement("k")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);

        let mut ids = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            let msg: ServerMessage = serde_json::from_str(text.as_str()).unwrap();
            if let ServerMessage::Notification(n) = msg {
                ids.push(n.id);
            }
        }
        assert_eq!(ids, vec![first.id.clone(), first.id]);
    }

    #[tokio::test]
    async fn test_offline_recipient_still_persisted() {
        let db = open_in_memory().unwrap();
        let dispatcher = Dispatcher::new(db.clone(), ConnectionRegistry::new());
        let n = dispatcher.dispatch(announcement("offline")).await.unwrap();

        let conn = db.lock().unwrap();
        let list = store::list_for_viewer(&conn, "d9", Role::Driver, 50).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, n.id);
    }
}
