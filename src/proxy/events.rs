// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Membership event publication

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::stats::StatisticsSnapshot;
use crate::membership::{GroupMembershipKey, LeaveReason};

/// Event pushed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProxyEvent {
    /// A key became a member
    Joined {
        key: GroupMembershipKey,
        /// Member keys of the group on the device after the join
        active_members: usize,
        timestamp: DateTime<Utc>,
    },
    /// A key left
    Left {
        key: GroupMembershipKey,
        reason: LeaveReason,
        active_members: usize,
        timestamp: DateTime<Utc>,
    },
    /// Periodic counters
    Statistics {
        stats: StatisticsSnapshot,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast channel for [`ProxyEvent`]s.
///
/// Sending without subscribers is not an error.
#[derive(Clone)]
pub struct EventSubscriptionManager {
    event_tx: broadcast::Sender<ProxyEvent>,
}

impl EventSubscriptionManager {
    pub fn new(buffer_size: usize) -> Self {
        let (event_tx, _) = broadcast::channel(buffer_size);
        Self { event_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.event_tx.subscribe()
    }

    /// Returns the number of receivers that got the event
    pub fn send(&self, event: ProxyEvent) -> usize {
        self.event_tx.send(event).unwrap_or_default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }
}

impl Default for EventSubscriptionManager {
    fn default() -> Self {
        Self::new(256)
    }
}
