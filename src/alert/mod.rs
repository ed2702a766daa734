//! Alert module - Cluster detection, subscription matching and delivery

pub mod cluster;
pub mod dispatch;
pub mod matcher;
pub mod store;
pub mod types;

pub use cluster::{ClusterDetector, ClusterStats, ClusterThreshold};
pub use dispatch::{ChannelNotifier, LogNotifier, Notifier, WebhookNotifier};
pub use matcher::AlertMatcher;
pub use store::{MemorySubscriptionStore, SubscriptionStore};
pub use types::{
    AlertConfig, AlertMatch, AlertPayload, AlertSubscription, AlertType, ClusterResult,
    KolDirectory, KolProfile, Signal,
};
