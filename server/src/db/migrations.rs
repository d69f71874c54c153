use rusqlite_migration::{Migrations, M};

/// Schema migrations, tracked through SQLite's user_version pragma.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "-- Migration 1: notifications

CREATE TABLE notifications (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    title TEXT NOT NULL,
    message TEXT NOT NULL,
    payload TEXT NOT NULL,
    target_role TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX idx_notifications_created ON notifications(created_at);
CREATE INDEX idx_notifications_role ON notifications(target_role);

CREATE TABLE notification_targets (
    notification_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    PRIMARY KEY (notification_id, user_id),
    FOREIGN KEY (notification_id) REFERENCES notifications(id) ON DELETE CASCADE
);

CREATE INDEX idx_notification_targets_user ON notification_targets(user_id);

CREATE TABLE notification_reads (
    notification_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    read_at TEXT NOT NULL,
    PRIMARY KEY (notification_id, user_id),
    FOREIGN KEY (notification_id) REFERENCES notifications(id) ON DELETE CASCADE
);

CREATE TABLE notification_dismissals (
    notification_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    dismissed_at TEXT NOT NULL,
    PRIMARY KEY (notification_id, user_id),
    FOREIGN KEY (notification_id) REFERENCES notifications(id) ON DELETE CASCADE
);",
        ),
        M::up(
            "-- Migration 2: ride claims

CREATE TABLE ride_claims (
    ride_id TEXT PRIMARY KEY,
    passenger_id TEXT NOT NULL,
    pickup_location_name TEXT NOT NULL,
    dropoff_location_name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    winning_driver_id TEXT,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    decided_at TEXT
);

CREATE INDEX idx_ride_claims_status ON ride_claims(status);",
        ),
    ])
}
