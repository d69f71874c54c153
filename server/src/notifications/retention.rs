//! Background purge of old notifications.

use chrono::{Duration, Utc};

use crate::db::DbPool;
use crate::notifications::store::{self, NotificationError};

/// Spawn a task that deletes notifications older than `retention_days`,
/// once every `interval_secs`.
pub fn spawn_retention_cleanup(db: DbPool, retention_days: u32, interval_secs: u64) {
    let interval = std::time::Duration::from_secs(interval_secs);

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            let db_clone = db.clone();
            let cutoff = Utc::now() - Duration::days(i64::from(retention_days));

            match tokio::task::spawn_blocking(move || {
                let conn = db_clone.lock().map_err(|_| NotificationError::LockPoisoned)?;
                store::purge_older_than(&conn, cutoff)
            })
            .await
            {
                Ok(Ok(0)) => {
                    tracing::debug!("Notification retention: nothing to purge");
                }
                Ok(Ok(count)) => {
                    tracing::info!(count, "Notification retention: purged old notifications");
                }
                Ok(Err(e)) => {
                    tracing::error!("Notification retention error: {}", e);
                }
                Err(e) => {
                    tracing::error!("Notification retention task join error: {}", e);
                }
            }
        }
    });
}
