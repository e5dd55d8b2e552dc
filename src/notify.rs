use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::limits::MAX_RETAINED_NOTIFICATIONS;
use crate::model::{Ms, Notification, NotificationKind, Severity};
use crate::observability;

const CHANNEL_CAPACITY: usize = 256;

/// Where allocation decisions report operator-facing alerts.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn create(
        &self,
        kind: NotificationKind,
        severity: Severity,
        message: String,
        flight_id: Option<&str>,
    ) -> Notification;
}

/// In-memory notification store with broadcast fan-out to live subscribers.
pub struct NotifyHub {
    notifications: DashMap<Ulid, Notification>,
    sender: broadcast::Sender<Notification>,
    clock: Arc<dyn Clock>,
    retention: usize,
}

impl NotifyHub {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_retention(clock, MAX_RETAINED_NOTIFICATIONS)
    }

    pub fn with_retention(clock: Arc<dyn Clock>, retention: usize) -> Self {
        Self {
            notifications: DashMap::new(),
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
            clock,
            retention,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// Newest first.
    pub fn list(&self, unread_only: bool) -> Vec<Notification> {
        let mut out: Vec<Notification> = self
            .notifications
            .iter()
            .filter(|e| !unread_only || !e.value().read)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| b.id.cmp(&a.id));
        out
    }

    pub fn count_by_kind(&self, kind: NotificationKind) -> usize {
        self.notifications
            .iter()
            .filter(|e| e.value().kind == kind)
            .count()
    }

    pub fn mark_read(&self, id: Ulid) -> bool {
        match self.notifications.get_mut(&id) {
            Some(mut n) => {
                n.read = true;
                true
            }
            None => false,
        }
    }

    /// Drop the oldest read notifications while over the retention limit.
    fn evict_read(&self) {
        let excess = self.notifications.len().saturating_sub(self.retention);
        if excess == 0 {
            return;
        }
        let mut read: Vec<(Ms, Ulid)> = self
            .notifications
            .iter()
            .filter(|e| e.value().read)
            .map(|e| (e.value().created_at, e.value().id))
            .collect();
        read.sort();
        for (_, id) in read.into_iter().take(excess) {
            self.notifications.remove(&id);
        }
        metrics::gauge!(observability::NOTIFICATIONS_RETAINED).set(self.notifications.len() as f64);
    }

    /// Acknowledging also marks read. The first acknowledgement time sticks.
    pub fn acknowledge(&self, id: Ulid) -> Option<Notification> {
        let mut n = self.notifications.get_mut(&id)?;
        n.read = true;
        if n.acknowledged_at.is_none() {
            n.acknowledged_at = Some(self.clock.now_ms());
        }
        Some(n.clone())
    }
}

#[async_trait]
impl NotificationSink for NotifyHub {
    async fn create(
        &self,
        kind: NotificationKind,
        severity: Severity,
        message: String,
        flight_id: Option<&str>,
    ) -> Notification {
        let notification = Notification {
            id: Ulid::new(),
            kind,
            severity,
            message,
            flight_id: flight_id.map(str::to_string),
            read: false,
            created_at: self.clock.now_ms(),
            acknowledged_at: None,
        };
        match severity {
            Severity::Critical => warn!(kind = kind.as_str(), flight_id, "{}", notification.message),
            _ => info!(kind = kind.as_str(), flight_id, "{}", notification.message),
        }
        metrics::counter!(observability::NOTIFICATIONS_TOTAL, "kind" => kind.as_str()).increment(1);
        self.notifications.insert(notification.id, notification.clone());
        self.evict_read();
        // No subscribers is fine.
        let _ = self.sender.send(notification.clone());
        notification
    }
}
