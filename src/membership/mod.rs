// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Group membership tracking
//!
//! - [`state_machine`]: one [`StateMachine`] per [`GroupMembershipKey`]
//! - [`table`]: the process-wide [`MembershipTable`] and the aggregation
//!   ledger that decides when upstream Join/Leave and forwarding intents
//!   are due

pub mod state_machine;
pub mod table;

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::{DeviceId, PortNumber, VlanId};

pub use state_machine::{
    LeaveReason, MemberAction, MemberState, MembershipTimers, PendingQuery, Skipped, StateMachine,
    Step, TimerKind,
};
pub use table::{Admission, MembershipEntry, MembershipTable, Release};

/// Identifies one state machine instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupMembershipKey {
    pub device: DeviceId,
    pub port: PortNumber,
    pub vlan: VlanId,
    pub group: Ipv4Addr,
    /// `None` is the any-source ("*") membership
    pub source: Option<Ipv4Addr>,
}

impl GroupMembershipKey {
    /// Same device, port, vlan and group, ignoring the source
    pub fn same_group_on_port(&self, other: &GroupMembershipKey) -> bool {
        self.device == other.device
            && self.port == other.port
            && self.vlan == other.vlan
            && self.group == other.group
    }
}

impl std::fmt::Display for GroupMembershipKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match self.source {
            Some(src) => src.to_string(),
            None => "*".to_string(),
        };
        write!(
            f,
            "{}/{} vlan {} ({}, {})",
            self.device, self.port, self.vlan, source, self.group
        )
    }
}

/// How upstream signalling is deduplicated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregationMode {
    /// Every membership key is signalled upstream on its own
    #[default]
    PerSubscriber,
    /// All subscribers behind one aggregation point share one upstream
    /// Join/Leave per group
    PerPod,
}

/// Key under which upstream Join/Leave is reference counted
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AggregationKey {
    Subscriber(GroupMembershipKey),
    Pod {
        aggregation_point: String,
        group: Ipv4Addr,
    },
}

impl AggregationKey {
    pub fn for_key(
        key: &GroupMembershipKey,
        mode: AggregationMode,
        aggregation_point: &str,
    ) -> Self {
        match mode {
            AggregationMode::PerSubscriber => AggregationKey::Subscriber(key.clone()),
            AggregationMode::PerPod => AggregationKey::Pod {
                aggregation_point: aggregation_point.to_string(),
                group: key.group,
            },
        }
    }
}
