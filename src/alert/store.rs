//! Alert subscription storage
//!
//! The pipeline only reads subscriptions; writes come from the user-facing
//! side (or a JSON file at startup).

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::Path;
use tracing::info;

use crate::alert::types::AlertSubscription;
use crate::error::{Error, Result};

/// Read access to alert subscriptions
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// All subscriptions currently switched on
    async fn active_subscriptions(&self) -> Result<Vec<AlertSubscription>>;

    /// Everything owned by one user, active or not
    async fn subscriptions_for_user(&self, user_id: &str) -> Result<Vec<AlertSubscription>>;
}

/// Subscriptions held in process
#[derive(Default)]
pub struct MemorySubscriptionStore {
    subscriptions: DashMap<String, AlertSubscription>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of subscriptions
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Io(format!("{}: {}", path.display(), e)))?;
        let subscriptions: Vec<AlertSubscription> = serde_json::from_str(&raw)
            .map_err(|e| Error::Deserialization(format!("{}: {}", path.display(), e)))?;

        let store = Self::new();
        for subscription in subscriptions {
            store.upsert(subscription);
        }
        info!(count = store.len(), path = %path.display(), "Loaded alert subscriptions");
        Ok(store)
    }

    /// Insert or replace by id
    pub fn upsert(&self, subscription: AlertSubscription) {
        self.subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub fn get(&self, id: &str) -> Option<AlertSubscription> {
        self.subscriptions.get(id).map(|s| s.clone())
    }

    pub fn delete(&self, id: &str) -> Result<AlertSubscription> {
        self.subscriptions
            .remove(id)
            .map(|(_, s)| s)
            .ok_or_else(|| Error::SubscriptionNotFound(id.to_string()))
    }

    /// Remove everything a user owns, returns how many were removed
    pub fn delete_user(&self, user_id: &str) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|_, s| s.user_id != user_id);
        before.saturating_sub(self.subscriptions.len())
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn active_subscriptions(&self) -> Result<Vec<AlertSubscription>> {
        let mut active: Vec<AlertSubscription> = self
            .subscriptions
            .iter()
            .filter(|s| s.active)
            .map(|s| s.value().clone())
            .collect();
        // DashMap iteration order is arbitrary
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(active)
    }

    async fn subscriptions_for_user(&self, user_id: &str) -> Result<Vec<AlertSubscription>> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.value().clone())
            .collect())
    }
}
