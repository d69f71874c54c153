//! Client-side notification list reconciled from REST snapshots and live pushes.
//!
//! Entries are unique by id and ordered newest first. The unread count is always
//! derived from the entries, never stored. Mutations apply locally first and are
//! rolled back to the exact prior state if the server refuses them.

use serde_json::Value;
use std::collections::HashSet;

use crate::client::api::{ApiError, NotificationApi};
use crate::notifications::events::Announcement;
use crate::notifications::model::Notification;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The change was reverted locally; retrying may succeed.
    #[error("failed to persist change: {0}")]
    Persistence(#[source] ApiError),
    #[error("failed to load notifications: {0}")]
    Load(#[source] ApiError),
    #[error("notification {0} is not in the store")]
    UnknownId(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Persistence(e) | Self::Load(e) => e.is_retryable(),
            Self::UnknownId(_) => false,
        }
    }
}

pub struct NotificationStore<A> {
    api: A,
    viewer_id: String,
    items: Vec<Notification>,
}

impl<A: NotificationApi> NotificationStore<A> {
    /// Empty store; call [`refresh`](Self::refresh) to load.
    pub fn new(api: A, viewer_id: &str) -> Self {
        Self {
            api,
            viewer_id: viewer_id.to_string(),
            items: Vec::new(),
        }
    }

    /// Fetch the list and the unread count together and seed the store.
    pub async fn open(api: A, viewer_id: &str) -> Result<Self, StoreError> {
        let (list, count) = tokio::join!(api.list(), api.unread_count());
        let mut store = Self::new(api, viewer_id);
        for n in list.map_err(StoreError::Load)? {
            store.merge(n);
        }

        match count {
            Ok(server_count) if server_count as usize != store.unread_count() => {
                tracing::debug!(
                    server_count,
                    derived = store.unread_count(),
                    "Unread count differs from the fetched list"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to fetch unread count"),
        }
        Ok(store)
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    /// Entries, newest first.
    pub fn notifications(&self) -> &[Notification] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&Notification> {
        self.items.iter().find(|n| n.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn unread_count(&self) -> usize {
        self.items
            .iter()
            .filter(|n| !n.is_read_by(&self.viewer_id))
            .count()
    }

    /// Insert or replace by id. Read state never goes backwards on merge.
    pub fn merge(&mut self, mut incoming: Notification) {
        match self.items.iter_mut().find(|n| n.id == incoming.id) {
            Some(existing) => {
                let was_read = existing.is_read_by(&self.viewer_id);
                incoming.read_by.extend(existing.read_by.iter().cloned());
                if was_read {
                    incoming.mark_read_by(&self.viewer_id);
                }
                *existing = incoming;
            }
            None => self.items.push(incoming),
        }
        self.sort();
    }

    /// Merge a pushed payload. Payloads without an id, or that do not parse,
    /// are dropped. Returns whether anything was merged.
    pub fn merge_raw(&mut self, value: Value) -> bool {
        let has_id = value
            .get("id")
            .and_then(Value::as_str)
            .map(|id| !id.trim().is_empty())
            .unwrap_or(false);
        if !has_id {
            tracing::debug!("Dropping pushed notification without an id");
            return false;
        }
        match serde_json::from_value::<Notification>(value) {
            Ok(n) => {
                self.merge(n);
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "Dropping malformed pushed notification");
                false
            }
        }
    }

    pub async fn mark_as_read(&mut self, id: &str) -> Result<(), StoreError> {
        let prior = self.items.clone();
        let viewer = self.viewer_id.clone();
        let entry = self
            .items
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| StoreError::UnknownId(id.to_string()))?;
        if entry.is_read_by(&viewer) {
            return Ok(());
        }
        entry.mark_read_by(&viewer);

        let result = self.api.mark_read(id).await;
        self.settle(prior, result)
    }

    pub async fn mark_all_as_read(&mut self) -> Result<(), StoreError> {
        if self.unread_count() == 0 {
            return Ok(());
        }
        let prior = self.items.clone();
        let viewer = self.viewer_id.clone();
        for n in &mut self.items {
            n.mark_read_by(&viewer);
        }
        let result = self.api.mark_all_read().await.map(|_| ());
        self.settle(prior, result)
    }

    /// Remove locally, then on the server.
    pub async fn delete(&mut self, id: &str) -> Result<(), StoreError> {
        let pos = self
            .items
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| StoreError::UnknownId(id.to_string()))?;
        let prior = self.items.clone();
        self.items.remove(pos);

        let result = self.api.delete(id).await;
        self.settle(prior, result)
    }

    /// Replace the entries with a fresh snapshot, e.g. after a reconnect.
    /// Entries the server no longer returns are dropped; read state carries over.
    pub async fn refresh(&mut self) -> Result<(), StoreError> {
        let list = self.api.list().await.map_err(StoreError::Load)?;
        let live: HashSet<String> = list.iter().map(|n| n.id.clone()).collect();
        let before = self.items.len();
        self.items.retain(|n| live.contains(&n.id));
        let pruned = before - self.items.len();
        if pruned > 0 {
            tracing::debug!(pruned, "Dropped notifications missing from the snapshot");
        }
        for n in list {
            self.merge(n);
        }
        Ok(())
    }

    /// Create through the server and merge the record it returns.
    pub async fn create(&mut self, announcement: &Announcement) -> Result<Notification, StoreError> {
        let created = self
            .api
            .create(announcement)
            .await
            .map_err(StoreError::Persistence)?;
        self.merge(created.clone());
        Ok(created)
    }

    /// Keep the optimistic state on success, restore `prior` otherwise.
    fn settle(&mut self, prior: Vec<Notification>, result: Result<(), ApiError>) -> Result<(), StoreError> {
        result.map_err(|e| {
            tracing::warn!(error = %e, "Reverting optimistic notification change");
            self.items = prior;
            StoreError::Persistence(e)
        })
    }

    fn sort(&mut self) {
        self.items.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
    }
}
