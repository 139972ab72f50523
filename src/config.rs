// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Configuration file types and parsing for igmpproxyd.
//!
//! JSON5 configuration format supporting:
//! - Global IGMP timers and proxy policy
//! - Per-device uplink, aggregation and enable flags
//! - SSM translation for source-less reports
//! - Comments and trailing commas

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logging::{Facility, Severity};
use crate::membership::{AggregationMode, MembershipTimers};
use crate::protocols::{IgmpVersion, MacAddr, QuerierTimers};
use crate::{DeviceId, PortNumber};

/// Proxy configuration (JSON5 file format)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Aggregate upstream signalling per POD instead of per subscriber.
    /// Devices may override this.
    pub igmp_on_pod_basis: bool,

    /// Source MAC of proxy-originated frames, `aa:bb:cc:dd:ee:ff`
    pub source_mac: String,

    /// Source IP of proxy-originated packets
    pub source_ip: Ipv4Addr,

    /// Upstream report encoding unless a v2 querier is seen
    pub default_version: IgmpVersion,

    pub robustness: u8,

    /// General query interval
    pub query_interval_secs: u64,

    /// Max response time advertised in general queries
    pub query_response_interval_secs: u64,

    pub last_member_query_interval_ms: u64,

    pub last_member_query_count: u8,

    /// Overrides the computed group membership interval when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keepalive_interval_secs: Option<u64>,

    /// Confirm leaves without a last-member query
    pub fast_leave: bool,

    /// Send general queries to subscriber ports every query interval
    pub periodic_query: bool,

    /// Answer upstream queries at once instead of after a random delay
    pub immediate_response: bool,

    /// Granularity of the per-key timer sweep
    pub sweep_interval_ms: u64,

    pub statistics_interval_secs: u64,

    /// VLAN tag for upstream reports
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_vlan: Option<u16>,

    /// Source used for source-less reports of these groups
    pub ssm_translate: Vec<SsmTranslation>,

    /// Per-device settings keyed by device id
    pub devices: HashMap<String, DeviceConfig>,

    /// Minimum log level per facility, e.g. `{ membership: "debug" }`
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub log_levels: BTreeMap<String, Severity>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            igmp_on_pod_basis: false,
            source_mac: "02:00:00:00:00:01".to_string(),
            source_ip: Ipv4Addr::new(10, 0, 0, 1),
            default_version: IgmpVersion::V3,
            robustness: 2,
            query_interval_secs: 125,
            query_response_interval_secs: 10,
            last_member_query_interval_ms: 1000,
            last_member_query_count: 2,
            keepalive_interval_secs: None,
            fast_leave: false,
            periodic_query: false,
            immediate_response: false,
            sweep_interval_ms: 1000,
            statistics_interval_secs: 30,
            upstream_vlan: None,
            ssm_translate: Vec::new(),
            devices: HashMap::new(),
            log_levels: BTreeMap::new(),
        }
    }
}

/// Per-device configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Port facing the multicast router
    pub uplink_port: PortNumber,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Overrides the global `igmp_on_pod_basis`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub igmp_on_pod_basis: Option<bool>,

    /// Devices naming the same aggregation point form one POD.
    /// Defaults to the device id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_point: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl DeviceConfig {
    pub fn new(uplink_port: PortNumber) -> Self {
        Self {
            uplink_port,
            enabled: true,
            igmp_on_pod_basis: None,
            aggregation_point: None,
        }
    }
}

/// SSM translation entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SsmTranslation {
    pub group: Ipv4Addr,
    pub source: Ipv4Addr,
}

impl ProxyConfig {
    /// Load configuration from a JSON5 file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        json5::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Serialize configuration to JSON5 string (with pretty formatting)
    pub fn to_json5(&self) -> String {
        // JSON is valid JSON5; json5 has no pretty printer
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Save configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_json5())
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.source_mac_bytes()?;

        if self.source_ip.is_multicast() || self.source_ip.is_unspecified() {
            return Err(ConfigError::InvalidSourceAddress(self.source_ip));
        }

        if self.robustness == 0 || self.robustness > MAX_ROBUSTNESS {
            return Err(ConfigError::InvalidTimer {
                field: "robustness",
                reason: format!("must be between 1 and {}", MAX_ROBUSTNESS),
            });
        }
        if self.last_member_query_count == 0 {
            return Err(ConfigError::InvalidTimer {
                field: "last_member_query_count",
                reason: "must be at least 1".to_string(),
            });
        }
        for (field, value) in [
            ("query_interval_secs", self.query_interval_secs),
            ("last_member_query_interval_ms", self.last_member_query_interval_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("statistics_interval_secs", self.statistics_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidTimer {
                    field,
                    reason: "must be non-zero".to_string(),
                });
            }
        }
        for (field, value, max) in [
            ("query_interval_secs", self.query_interval_secs, MAX_QUERY_INTERVAL_SECS),
            (
                "query_response_interval_secs",
                self.query_response_interval_secs,
                MAX_RESPONSE_SECS,
            ),
            (
                "last_member_query_interval_ms",
                self.last_member_query_interval_ms,
                MAX_RESPONSE_SECS * 1000,
            ),
            (
                "keepalive_interval_secs",
                self.keepalive_interval_secs.unwrap_or(0),
                MAX_HOUSEKEEPING_SECS,
            ),
            ("sweep_interval_ms", self.sweep_interval_ms, MAX_HOUSEKEEPING_SECS * 1000),
            (
                "statistics_interval_secs",
                self.statistics_interval_secs,
                MAX_HOUSEKEEPING_SECS,
            ),
        ] {
            if value > max {
                return Err(ConfigError::InvalidTimer {
                    field,
                    reason: format!("must not exceed {}", max),
                });
            }
        }
        if self.query_response_interval_secs >= self.query_interval_secs {
            return Err(ConfigError::InvalidTimer {
                field: "query_response_interval_secs",
                reason: "must be less than query_interval_secs".to_string(),
            });
        }
        if self.keepalive_interval_secs == Some(0) {
            return Err(ConfigError::InvalidTimer {
                field: "keepalive_interval_secs",
                reason: "must be non-zero".to_string(),
            });
        }

        if let Some(vlan) = self.upstream_vlan {
            validate_vlan(vlan)?;
        }

        let mut seen = HashMap::new();
        for (idx, entry) in self.ssm_translate.iter().enumerate() {
            if !entry.group.is_multicast() {
                return Err(ConfigError::InvalidMulticastAddress {
                    address: entry.group,
                    context: format!("ssm_translate entry {}", idx),
                });
            }
            if entry.source.is_multicast() || entry.source.is_unspecified() {
                return Err(ConfigError::InvalidSourceAddress(entry.source));
            }
            if let Some(prev) = seen.insert(entry.group, idx) {
                return Err(ConfigError::DuplicateTranslation {
                    group: entry.group,
                    indices: (prev, idx),
                });
            }
        }

        self.facility_levels()?;

        for (device, cfg) in &self.devices {
            if device.is_empty() {
                return Err(ConfigError::InvalidDevice {
                    device: device.clone(),
                    reason: "device id cannot be empty".to_string(),
                });
            }
            if cfg.aggregation_point.as_deref() == Some("") {
                return Err(ConfigError::InvalidDevice {
                    device: device.clone(),
                    reason: "aggregation point cannot be empty".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Parsed `log_levels`
    pub fn facility_levels(&self) -> Result<Vec<(Facility, Severity)>, ConfigError> {
        self.log_levels
            .iter()
            .map(|(name, level)| {
                name.parse::<Facility>()
                    .map(|facility| (facility, *level))
                    .map_err(|_| ConfigError::UnknownFacility(name.clone()))
            })
            .collect()
    }

    /// Parsed `source_mac`
    pub fn source_mac_bytes(&self) -> Result<MacAddr, ConfigError> {
        parse_mac(&self.source_mac)
    }

    pub fn device(&self, device: &DeviceId) -> Option<&DeviceConfig> {
        self.devices.get(device.as_str())
    }

    /// Aggregation mode in force for `device`
    pub fn aggregation_mode(&self, device: &DeviceId) -> AggregationMode {
        let pod = self
            .device(device)
            .and_then(|d| d.igmp_on_pod_basis)
            .unwrap_or(self.igmp_on_pod_basis);
        if pod {
            AggregationMode::PerPod
        } else {
            AggregationMode::PerSubscriber
        }
    }

    /// Aggregation point of `device`, defaulting to the device id
    pub fn aggregation_point<'a>(&'a self, device: &'a DeviceId) -> &'a str {
        self.device(device)
            .and_then(|d| d.aggregation_point.as_deref())
            .unwrap_or(device.as_str())
    }

    pub fn ssm_source(&self, group: Ipv4Addr) -> Option<Ipv4Addr> {
        self.ssm_translate
            .iter()
            .find(|entry| entry.group == group)
            .map(|entry| entry.source)
    }

    pub fn query_interval(&self) -> Duration {
        Duration::from_secs(self.query_interval_secs)
    }

    pub fn query_response_interval(&self) -> Duration {
        Duration::from_secs(self.query_response_interval_secs)
    }

    pub fn last_member_query_interval(&self) -> Duration {
        Duration::from_millis(self.last_member_query_interval_ms)
    }

    /// Robustness x query interval + query response interval, unless a
    /// keepalive interval is configured
    pub fn group_membership_interval(&self) -> Duration {
        match self.keepalive_interval_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self
                .query_interval()
                .saturating_mul(u32::from(self.robustness))
                .saturating_add(self.query_response_interval()),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn statistics_interval(&self) -> Duration {
        Duration::from_secs(self.statistics_interval_secs)
    }

    /// Timing policy handed to every state machine
    /// Timers advertised to hosts in downstream v3 queries
    pub fn querier_timers(&self) -> QuerierTimers {
        QuerierTimers {
            robustness: self.robustness,
            query_interval: self.query_interval(),
        }
    }

    pub fn membership_timers(&self) -> MembershipTimers {
        MembershipTimers {
            group_membership_interval: self.group_membership_interval(),
            last_member_query_interval: self.last_member_query_interval(),
            last_member_query_count: self.last_member_query_count,
            fast_leave: self.fast_leave,
        }
    }
}

/// Parse `aa:bb:cc:dd:ee:ff` (or `-` separated)
pub fn parse_mac(text: &str) -> Result<MacAddr, ConfigError> {
    let invalid = || ConfigError::InvalidMacAddress(text.to_string());
    let mut mac = [0u8; 6];
    let mut parts = text.split(|c| c == ':' || c == '-');
    for byte in mac.iter_mut() {
        let part = parts.next().ok_or_else(invalid)?;
        if part.len() != 2 {
            return Err(invalid());
        }
        *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    if parts.next().is_some() {
        return Err(invalid());
    }
    if mac[0] & 0x01 != 0 {
        // Group bit set
        return Err(invalid());
    }
    Ok(mac)
}

/// Largest robustness a v3 query's QRV field carries
const MAX_ROBUSTNESS: u8 = 7;
/// Largest interval the QQIC code represents
const MAX_QUERY_INTERVAL_SECS: u64 = 31_744;
/// Largest max response time the v3 code represents, whole seconds
const MAX_RESPONSE_SECS: u64 = 3_174;
const MAX_HOUSEKEEPING_SECS: u64 = 86_400;

fn validate_vlan(vlan: u16) -> Result<(), ConfigError> {
    if vlan == 0 || vlan >= 4095 {
        return Err(ConfigError::InvalidVlan(vlan));
    }
    Ok(())
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0:?}: {1}")]
    IoError(PathBuf, String),
    #[error("failed to parse config: {0}")]
    ParseError(String),
    #[error("invalid MAC address '{0}'")]
    InvalidMacAddress(String),
    #[error("invalid source address {0}")]
    InvalidSourceAddress(Ipv4Addr),
    #[error("invalid VLAN id {0}")]
    InvalidVlan(u16),
    #[error("invalid {field}: {reason}")]
    InvalidTimer { field: &'static str, reason: String },
    #[error("{address} is not a multicast address ({context})")]
    InvalidMulticastAddress { address: Ipv4Addr, context: String },
    #[error("duplicate SSM translation for {group} (entries {} and {})", .indices.0, .indices.1)]
    DuplicateTranslation {
        group: Ipv4Addr,
        indices: (usize, usize),
    },
    #[error("invalid device '{device}': {reason}")]
    InvalidDevice { device: String, reason: String },
    #[error("unknown log facility '{0}'")]
    UnknownFacility(String),
}
