//! SQLite persistence for notifications, read receipts and dismissals.
//!
//! All functions are synchronous and take a locked connection; async callers
//! go through `tokio::task::spawn_blocking`.

use chrono::{DateTime, Utc};
use rusqlite::{named_params, params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;

use crate::auth::Role;
use crate::db::{format_ts, parse_ts};
use crate::notifications::model::{Notification, NotificationPayload, TargetRole};

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("notification not found")]
    NotFound,
    #[error("database error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("stored payload is invalid: {0}")]
    Corrupt(String),
    #[error("database lock poisoned")]
    LockPoisoned,
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Notifications the viewer may see: role-wide for their role or `all`, or
/// addressed to them, and not dismissed by them.
const VISIBLE_TO_VIEWER: &str = "(n.target_role = 'all'
        OR n.target_role = :role
        OR EXISTS (SELECT 1 FROM notification_targets t
                   WHERE t.notification_id = n.id AND t.user_id = :uid))
    AND NOT EXISTS (SELECT 1 FROM notification_dismissals d
                    WHERE d.notification_id = n.id AND d.user_id = :uid)";

/// Separator for group_concat lists. User ids never contain it.
const LIST_SEP: char = '\u{1f}';

const SELECT_COLUMNS: &str = "n.id, n.title, n.message, n.payload, n.target_role, n.created_at,
    (SELECT group_concat(t.user_id, char(31)) FROM notification_targets t
     WHERE t.notification_id = n.id),
    (SELECT group_concat(r.user_id, char(31)) FROM notification_reads r
     WHERE r.notification_id = n.id)";

/// Insert a notification unless one with the same id exists.
/// Returns true if this call created the row.
pub fn insert_notification(
    conn: &mut Connection,
    notification: &Notification,
) -> Result<bool, NotificationError> {
    let payload = serde_json::to_string(&notification.payload)
        .map_err(|e| NotificationError::Corrupt(e.to_string()))?;

    let tx = conn.transaction()?;
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO notifications
            (id, kind, title, message, payload, target_role, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            notification.id,
            notification.kind().as_str(),
            notification.title,
            notification.message,
            payload,
            notification.target_role.map(|t| t.as_str()),
            format_ts(&notification.created_at),
        ],
    )? == 1;

    if inserted {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO notification_targets (notification_id, user_id) VALUES (?1, ?2)",
        )?;
        for user_id in &notification.target_user_ids {
            stmt.execute(params![notification.id, user_id])?;
        }
    }
    tx.commit()?;
    Ok(inserted)
}

/// Load a notification with its full read set.
pub fn get_notification(
    conn: &Connection,
    id: &str,
) -> Result<Option<Notification>, NotificationError> {
    let sql = format!("SELECT {} FROM notifications n WHERE n.id = ?1", SELECT_COLUMNS);
    let raw = conn.query_row(&sql, params![id], RawRow::from_row).optional()?;
    raw.map(RawRow::into_notification).transpose()
}

/// The viewer's notifications, newest first, with `isRead` computed for them.
///
/// Non-admin viewers only see their own entry in `readBy`.
pub fn list_for_viewer(
    conn: &Connection,
    user_id: &str,
    role: Role,
    limit: u32,
) -> Result<Vec<Notification>, NotificationError> {
    let sql = format!(
        "SELECT {} FROM notifications n WHERE {}
         ORDER BY n.created_at DESC, n.id DESC LIMIT :limit",
        SELECT_COLUMNS, VISIBLE_TO_VIEWER
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        named_params! { ":uid": user_id, ":role": role.as_str(), ":limit": limit },
        RawRow::from_row,
    )?;

    let mut out = Vec::new();
    for row in rows {
        let mut n = row?.into_notification()?;
        if role != Role::Admin {
            n.read_by.retain(|reader| reader == user_id);
        }
        out.push(n.for_viewer(user_id));
    }
    Ok(out)
}

pub fn unread_count(conn: &Connection, user_id: &str, role: Role) -> Result<u64, NotificationError> {
    let sql = format!(
        "SELECT COUNT(*) FROM notifications n WHERE {}
         AND NOT EXISTS (SELECT 1 FROM notification_reads r
                         WHERE r.notification_id = n.id AND r.user_id = :uid)",
        VISIBLE_TO_VIEWER
    );
    let count: i64 = conn.query_row(
        &sql,
        named_params! { ":uid": user_id, ":role": role.as_str() },
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

fn is_visible(conn: &Connection, id: &str, user_id: &str, role: Role) -> Result<bool, NotificationError> {
    let sql = format!(
        "SELECT EXISTS (SELECT 1 FROM notifications n WHERE n.id = :id AND {})",
        VISIBLE_TO_VIEWER
    );
    let visible: bool = conn.query_row(
        &sql,
        named_params! { ":id": id, ":uid": user_id, ":role": role.as_str() },
        |row| row.get(0),
    )?;
    Ok(visible)
}

/// Record a read receipt. Marking an already-read notification is a no-op.
pub fn mark_read(
    conn: &Connection,
    id: &str,
    user_id: &str,
    role: Role,
    now: DateTime<Utc>,
) -> Result<(), NotificationError> {
    if !is_visible(conn, id, user_id, role)? {
        return Err(NotificationError::NotFound);
    }
    conn.execute(
        "INSERT OR IGNORE INTO notification_reads (notification_id, user_id, read_at)
         VALUES (?1, ?2, ?3)",
        params![id, user_id, format_ts(&now)],
    )?;
    Ok(())
}

/// Mark every visible notification read. Returns how many were newly marked.
pub fn mark_all_read(
    conn: &Connection,
    user_id: &str,
    role: Role,
    now: DateTime<Utc>,
) -> Result<usize, NotificationError> {
    let sql = format!(
        "INSERT OR IGNORE INTO notification_reads (notification_id, user_id, read_at)
         SELECT n.id, :uid, :now FROM notifications n WHERE {}",
        VISIBLE_TO_VIEWER
    );
    let changed = conn.execute(
        &sql,
        named_params! { ":uid": user_id, ":role": role.as_str(), ":now": format_ts(&now) },
    )?;
    Ok(changed)
}

/// Hide a notification for this viewer only.
pub fn dismiss(
    conn: &Connection,
    id: &str,
    user_id: &str,
    role: Role,
    now: DateTime<Utc>,
) -> Result<(), NotificationError> {
    if !is_visible(conn, id, user_id, role)? {
        return Err(NotificationError::NotFound);
    }
    conn.execute(
        "INSERT OR IGNORE INTO notification_dismissals (notification_id, user_id, dismissed_at)
         VALUES (?1, ?2, ?3)",
        params![id, user_id, format_ts(&now)],
    )?;
    Ok(())
}

/// Delete notifications created before `cutoff`. Receipts, targets and
/// dismissals go with them.
pub fn purge_older_than(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize, NotificationError> {
    let deleted = conn.execute(
        "DELETE FROM notifications WHERE created_at < ?1",
        params![format_ts(&cutoff)],
    )?;
    Ok(deleted)
}

struct RawRow {
    id: String,
    title: String,
    message: String,
    payload: String,
    target_role: Option<String>,
    created_at: String,
    targets: Option<String>,
    readers: Option<String>,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            message: row.get(2)?,
            payload: row.get(3)?,
            target_role: row.get(4)?,
            created_at: row.get(5)?,
            targets: row.get(6)?,
            readers: row.get(7)?,
        })
    }

    fn into_notification(self) -> Result<Notification, NotificationError> {
        let payload: NotificationPayload = serde_json::from_str(&self.payload)
            .map_err(|e| NotificationError::Corrupt(format!("{}: {}", self.id, e)))?;
        let created_at = parse_ts(&self.created_at)
            .map_err(|e| NotificationError::Corrupt(format!("{}: {}", self.id, e)))?;
        let split = |list: Option<String>| -> Vec<String> {
            list.map(|s| s.split(LIST_SEP).map(str::to_string).collect())
                .unwrap_or_default()
        };

        let mut target_user_ids = split(self.targets);
        target_user_ids.sort();

        Ok(Notification {
            id: self.id,
            payload,
            title: self.title,
            message: self.message,
            created_at,
            target_role: self.target_role.as_deref().and_then(TargetRole::from_str),
            target_user_ids,
            read_by: split(self.readers).into_iter().collect::<BTreeSet<_>>(),
            is_read: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::notifications::events::{Announcement, DomainEvent};
    use chrono::Duration;

    fn announcement(key: &str, role: Option<TargetRole>, users: &[&str], at: DateTime<Utc>) -> Notification {
        DomainEvent::Announcement(Announcement {
            title: format!("title {}", key),
            message: "body".to_string(),
            target_role: role,
            target_user_ids: users.iter().map(|u| u.to_string()).collect(),
            link: None,
            idempotency_key: Some(key.to_string()),
        })
        .plan(at)
        .notification
    }

    #[test]
    fn test_insert_is_idempotent() {
        let db = open_in_memory().unwrap();
        let mut conn = db.lock().unwrap();
        let n = announcement("a", Some(TargetRole::All), &[], Utc::now());
        assert!(insert_notification(&mut conn, &n).unwrap());
        assert!(!insert_notification(&mut conn, &n).unwrap());
        assert_eq!(list_for_viewer(&conn, "u1", Role::User, 50).unwrap().len(), 1);
    }

    #[test]
    fn test_visibility_by_role_and_target() {
        let db = open_in_memory().unwrap();
        let mut conn = db.lock().unwrap();
        let now = Utc::now();
        insert_notification(&mut conn, &announcement("drivers", Some(TargetRole::Driver), &[], now)).unwrap();
        insert_notification(&mut conn, &announcement("p1-only", None, &["p1"], now)).unwrap();

        assert_eq!(list_for_viewer(&conn, "d1", Role::Driver, 50).unwrap().len(), 1);
        assert_eq!(list_for_viewer(&conn, "p1", Role::User, 50).unwrap().len(), 1);
        assert_eq!(list_for_viewer(&conn, "p2", Role::User, 50).unwrap().len(), 0);
    }

    #[test]
    fn test_list_is_newest_first() {
        let db = open_in_memory().unwrap();
        let mut conn = db.lock().unwrap();
        let now = Utc::now();
        insert_notification(&mut conn, &announcement("old", Some(TargetRole::All), &[], now - Duration::minutes(5))).unwrap();
        insert_notification(&mut conn, &announcement("new", Some(TargetRole::All), &[], now)).unwrap();

        let list = list_for_viewer(&conn, "u1", Role::User, 50).unwrap();
        assert_eq!(list[0].title, "title new");
        assert_eq!(list[1].title, "title old");
    }

    #[test]
    fn test_mark_all_read_then_unread_is_zero() {
        let db = open_in_memory().unwrap();
        let mut conn = db.lock().unwrap();
        let now = Utc::now();
        for key in ["a", "b", "c"] {
            insert_notification(&mut conn, &announcement(key, None, &["p1"], now)).unwrap();
        }
        mark_read(&conn, &announcement("a", None, &["p1"], now).id, "p1", Role::User, now).unwrap();
        assert_eq!(unread_count(&conn, "p1", Role::User).unwrap(), 2);

        assert_eq!(mark_all_read(&conn, "p1", Role::User, now).unwrap(), 2);
        assert_eq!(unread_count(&conn, "p1", Role::User).unwrap(), 0);
        assert!(list_for_viewer(&conn, "p1", Role::User, 50)
            .unwrap()
            .iter()
            .all(|n| n.is_read && n.read_by.contains("p1")));
    }

    #[test]
    fn test_mark_read_invisible_is_not_found() {
        let db = open_in_memory().unwrap();
        let mut conn = db.lock().unwrap();
        let n = announcement("x", None, &["p1"], Utc::now());
        insert_notification(&mut conn, &n).unwrap();
        assert!(matches!(
            mark_read(&conn, &n.id, "p2", Role::User, Utc::now()),
            Err(NotificationError::NotFound)
        ));
    }

    #[test]
    fn test_dismiss_is_per_viewer() {
        let db = open_in_memory().unwrap();
        let mut conn = db.lock().unwrap();
        let n = announcement("all", Some(TargetRole::Driver), &[], Utc::now());
        insert_notification(&mut conn, &n).unwrap();

        dismiss(&conn, &n.id, "d1", Role::Driver, Utc::now()).unwrap();
        assert!(list_for_viewer(&conn, "d1", Role::Driver, 50).unwrap().is_empty());
        assert_eq!(list_for_viewer(&conn, "d2", Role::Driver, 50).unwrap().len(), 1);
    }

    #[test]
    fn test_purge_cascades() {
        let db = open_in_memory().unwrap();
        let mut conn = db.lock().unwrap();
        let now = Utc::now();
        let old = announcement("old", None, &["p1"], now - Duration::days(40));
        insert_notification(&mut conn, &old).unwrap();
        mark_read(&conn, &old.id, "p1", Role::User, now).unwrap();

        assert_eq!(purge_older_than(&conn, now - Duration::days(30)).unwrap(), 1);
        let receipts: i64 = conn
            .query_row("SELECT COUNT(*) FROM notification_reads", [], |r| r.get(0))
            .unwrap();
        assert_eq!(receipts, 0);
    }
}
