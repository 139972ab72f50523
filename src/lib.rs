// SPDX-License-Identifier: Apache-2.0 OR MIT
//! IGMP proxy for SDN access networks.
//!
//! Subscriber IGMP traffic is intercepted per (device, port, vlan), tracked
//! in a membership table of per-(group, source) state machines, and
//! aggregated into upstream Join/Leave reports toward the multicast router.
//! Forwarding state is requested from an external flow service as semantic
//! ADD/REMOVE intents.
//!
//! ## Layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`protocols`] | IGMPv2/v3 frame codec |
//! | [`membership`] | State machines, membership table, aggregation ledger |
//! | [`timer`] | Single-shot and periodic timers with cancellation |
//! | [`proxy`] | Per-packet controller and collaborator traits |
//! | [`config`] | JSON5 configuration |
//! | [`logging`] | Facility/severity logging |

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

pub mod logging;

pub mod config;
pub mod membership;
pub mod protocols;
pub mod proxy;
pub mod timer;

/// Identifier of an access device (OLT / switch), e.g. `of:0000000000000001`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

pub type PortNumber = u32;

/// VLAN id; 0 means untagged
pub type VlanId = u16;

/// A port on a device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectPoint {
    pub device: DeviceId,
    pub port: PortNumber,
}

impl ConnectPoint {
    pub fn new(device: DeviceId, port: PortNumber) -> Self {
        Self { device, port }
    }
}

impl std::fmt::Display for ConnectPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.device, self.port)
    }
}

/// Where an inbound frame was received
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PacketContext {
    pub device: DeviceId,
    pub port: PortNumber,
    pub vlan: VlanId,
}

impl PacketContext {
    pub fn new(device: impl Into<String>, port: PortNumber, vlan: VlanId) -> Self {
        Self {
            device: DeviceId(device.into()),
            port,
            vlan,
        }
    }

    pub fn connect_point(&self) -> ConnectPoint {
        ConnectPoint::new(self.device.clone(), self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlowAction {
    Add,
    Remove,
}

/// Semantic forwarding request for the flow-programming collaborator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardingIntent {
    pub device: DeviceId,
    pub group: Ipv4Addr,
    pub port: PortNumber,
    pub action: FlowAction,
}
