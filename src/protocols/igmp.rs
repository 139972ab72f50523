// SPDX-License-Identifier: Apache-2.0 OR MIT
//! IGMPv2 / IGMPv3 message model (RFC 2236, RFC 3376)
//!
//! ## IGMP Message Types
//!
//! | Type | Value | Description |
//! |------|-------|-------------|
//! | Membership Query | 0x11 | v2 (8 bytes) or v3 (12+ bytes) |
//! | V1 Membership Report | 0x12 | Legacy (unsupported) |
//! | V2 Membership Report | 0x16 | Host joined group |
//! | V2 Leave Group | 0x17 | Host left group |
//! | V3 Membership Report | 0x22 | Group records with source lists |

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{DecodeError, MalformedPacket, PacketBuilder};

pub const IGMP_MEMBERSHIP_QUERY: u8 = 0x11;
pub const IGMP_V1_MEMBERSHIP_REPORT: u8 = 0x12;
pub const IGMP_V2_MEMBERSHIP_REPORT: u8 = 0x16;
pub const IGMP_V2_LEAVE_GROUP: u8 = 0x17;
pub const IGMP_V3_MEMBERSHIP_REPORT: u8 = 0x22;

/// All systems on this subnet (224.0.0.1), destination of general queries
pub const ALL_SYSTEMS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);
/// All routers (224.0.0.2), destination of v2 Leave Group
pub const ALL_ROUTERS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 2);
/// All IGMPv3-capable routers (224.0.0.22), destination of v3 reports
pub const IGMPV3_ALL_ROUTERS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 22);

const V2_MESSAGE_LEN: usize = 8;
const V3_QUERY_MIN_LEN: usize = 12;
const V3_REPORT_HEADER_LEN: usize = 8;
const V3_RECORD_HEADER_LEN: usize = 8;

/// Protocol version used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IgmpVersion {
    V2,
    V3,
}

impl std::fmt::Display for IgmpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IgmpVersion::V2 => write!(f, "v2"),
            IgmpVersion::V3 => write!(f, "v3"),
        }
    }
}

/// IGMPv3 group record types (RFC 3376 section 4.2.12)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    ModeIsInclude = 1,
    ModeIsExclude = 2,
    ChangeToIncludeMode = 3,
    ChangeToExcludeMode = 4,
    AllowNewSources = 5,
    BlockOldSources = 6,
}

impl RecordType {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordType::ModeIsInclude),
            2 => Some(RecordType::ModeIsExclude),
            3 => Some(RecordType::ChangeToIncludeMode),
            4 => Some(RecordType::ChangeToExcludeMode),
            5 => Some(RecordType::AllowNewSources),
            6 => Some(RecordType::BlockOldSources),
            _ => None,
        }
    }
}

/// Whether a report asks to start or stop receiving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MembershipChange {
    Join,
    Leave,
}

/// One membership intent extracted from a report
///
/// `source == None` is the any-source ("*") membership. A `Leave` with no
/// source withdraws every membership of the group on the reporting port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipIntent {
    pub change: MembershipChange,
    pub group: Ipv4Addr,
    pub source: Option<Ipv4Addr>,
}

/// A group record as carried in an IGMPv3 report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub record_type: RecordType,
    pub group: Ipv4Addr,
    pub sources: Vec<Ipv4Addr>,
}

impl GroupRecord {
    /// Upstream record announcing interest in `group` (optionally one source)
    pub fn join(group: Ipv4Addr, source: Option<Ipv4Addr>) -> Self {
        match source {
            Some(src) => Self {
                record_type: RecordType::AllowNewSources,
                group,
                sources: vec![src],
            },
            None => Self {
                record_type: RecordType::ChangeToExcludeMode,
                group,
                sources: Vec::new(),
            },
        }
    }

    /// Upstream record withdrawing interest in one source of `group`
    pub fn block(group: Ipv4Addr, source: Ipv4Addr) -> Self {
        Self {
            record_type: RecordType::BlockOldSources,
            group,
            sources: vec![source],
        }
    }

    /// Upstream record withdrawing interest in `group` entirely (TO_IN {})
    pub fn leave(group: Ipv4Addr) -> Self {
        Self {
            record_type: RecordType::ChangeToIncludeMode,
            group,
            sources: Vec::new(),
        }
    }

    /// Current-state record used to answer a query
    pub fn current_state(group: Ipv4Addr, source: Option<Ipv4Addr>) -> Self {
        match source {
            Some(src) => Self {
                record_type: RecordType::ModeIsInclude,
                group,
                sources: vec![src],
            },
            None => Self {
                record_type: RecordType::ModeIsExclude,
                group,
                sources: Vec::new(),
            },
        }
    }

    /// Translate the record into join/leave intents.
    ///
    /// EXCLUDE-mode records are treated as any-source joins; the exclusion
    /// list itself is not tracked.
    pub fn intents(&self) -> Vec<MembershipIntent> {
        let each = |change| {
            self.sources
                .iter()
                .map(move |src| MembershipIntent {
                    change,
                    group: self.group,
                    source: Some(*src),
                })
                .collect::<Vec<_>>()
        };

        match self.record_type {
            RecordType::ModeIsExclude | RecordType::ChangeToExcludeMode => vec![MembershipIntent {
                change: MembershipChange::Join,
                group: self.group,
                source: None,
            }],
            RecordType::ModeIsInclude | RecordType::ChangeToIncludeMode
                if self.sources.is_empty() =>
            {
                vec![MembershipIntent {
                    change: MembershipChange::Leave,
                    group: self.group,
                    source: None,
                }]
            }
            RecordType::ModeIsInclude
            | RecordType::ChangeToIncludeMode
            | RecordType::AllowNewSources => each(MembershipChange::Join),
            RecordType::BlockOldSources => each(MembershipChange::Leave),
        }
    }

    fn wire_len(&self) -> usize {
        V3_RECORD_HEADER_LEN + 4 * self.sources.len()
    }
}

/// Decoded IGMP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgmpMessage {
    /// Membership query; `group == 0.0.0.0` is a general query
    Query {
        version: IgmpVersion,
        group: Ipv4Addr,
        max_resp: Duration,
        sources: Vec<Ipv4Addr>,
    },
    /// Membership report. v2 reports are normalised to one EXCLUDE record.
    Report {
        version: IgmpVersion,
        records: Vec<GroupRecord>,
    },
    /// IGMPv2 Leave Group
    Leave { group: Ipv4Addr },
}

impl IgmpMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            IgmpMessage::Query { group, .. } if group.is_unspecified() => "General Query",
            IgmpMessage::Query { .. } => "Group-Specific Query",
            IgmpMessage::Report {
                version: IgmpVersion::V2,
                ..
            } => "V2 Membership Report",
            IgmpMessage::Report { .. } => "V3 Membership Report",
            IgmpMessage::Leave { .. } => "Leave Group",
        }
    }

    /// Join/leave intents carried by a report or leave; empty for queries
    pub fn intents(&self) -> Vec<MembershipIntent> {
        match self {
            IgmpMessage::Query { .. } => Vec::new(),
            IgmpMessage::Report { records, .. } => {
                records.iter().flat_map(GroupRecord::intents).collect()
            }
            IgmpMessage::Leave { group } => vec![MembershipIntent {
                change: MembershipChange::Leave,
                group: *group,
                source: None,
            }],
        }
    }
}

/// Decode the IGMP max response code into a duration.
///
/// v2 codes are tenths of a second; v3 codes >= 128 use the floating-point
/// encoding of RFC 3376 section 4.1.1.
pub fn decode_max_resp(code: u8, version: IgmpVersion) -> Duration {
    let tenths = match version {
        IgmpVersion::V3 => decode_float_code(code),
        IgmpVersion::V2 => code as u64,
    };
    Duration::from_millis(tenths * 100)
}

/// Encode a duration as an IGMP max response code
pub fn encode_max_resp(max_resp: Duration, version: IgmpVersion) -> u8 {
    let tenths = (max_resp.as_millis() / 100) as u64;
    match version {
        IgmpVersion::V3 => encode_float_code(tenths),
        IgmpVersion::V2 => tenths.min(u8::MAX as u64) as u8,
    }
}

/// Querier's Query Interval Code, whole seconds in the same float format
pub fn decode_qqic(code: u8) -> Duration {
    Duration::from_secs(decode_float_code(code))
}

pub fn encode_qqic(query_interval: Duration) -> u8 {
    encode_float_code(query_interval.as_secs())
}

/// 1eeemmmm codes above 127, rounding down, saturating at 0xff
fn encode_float_code(value: u64) -> u8 {
    if value < 0x80 {
        return value as u8;
    }
    // Smallest exponent whose mantissa fits in four bits
    for exp in 0u8..8 {
        let shifted = value >> (exp + 3);
        if (0x10..=0x1f).contains(&shifted) {
            return 0x80 | (exp << 4) | (shifted - 0x10) as u8;
        }
    }
    0xff
}

fn decode_float_code(code: u8) -> u64 {
    if code < 0x80 {
        return code as u64;
    }
    let exp = (code >> 4) & 0x07;
    let mant = code & 0x0f;
    ((mant as u64) | 0x10) << (exp + 3)
}

/// Parse the IGMP layer. The checksum must already be verified.
pub fn parse_message(data: &[u8]) -> Result<IgmpMessage, DecodeError> {
    if data.len() < V2_MESSAGE_LEN {
        return Err(MalformedPacket::Truncated {
            expected: V2_MESSAGE_LEN,
            actual: data.len(),
        }
        .into());
    }
    let group = read_addr(data, 4);

    match data[0] {
        IGMP_MEMBERSHIP_QUERY if data.len() > V2_MESSAGE_LEN && data.len() < V3_QUERY_MIN_LEN => {
            Err(MalformedPacket::Truncated {
                expected: V3_QUERY_MIN_LEN,
                actual: data.len(),
            }
            .into())
        }
        IGMP_MEMBERSHIP_QUERY if data.len() >= V3_QUERY_MIN_LEN => {
            let num_sources = u16::from_be_bytes([data[10], data[11]]) as usize;
            let needed = V3_QUERY_MIN_LEN + 4 * num_sources;
            if data.len() < needed {
                return Err(MalformedPacket::SourceCountMismatch {
                    declared: num_sources,
                    available: (data.len() - V3_QUERY_MIN_LEN) / 4,
                }
                .into());
            }
            let sources = (0..num_sources)
                .map(|i| read_addr(data, V3_QUERY_MIN_LEN + 4 * i))
                .collect();
            Ok(IgmpMessage::Query {
                version: IgmpVersion::V3,
                group,
                max_resp: decode_max_resp(data[1], IgmpVersion::V3),
                sources,
            })
        }
        IGMP_MEMBERSHIP_QUERY => Ok(IgmpMessage::Query {
            version: IgmpVersion::V2,
            group,
            max_resp: decode_max_resp(data[1], IgmpVersion::V2),
            sources: Vec::new(),
        }),
        IGMP_V2_MEMBERSHIP_REPORT => Ok(IgmpMessage::Report {
            version: IgmpVersion::V2,
            records: vec![GroupRecord {
                record_type: RecordType::ModeIsExclude,
                group,
                sources: Vec::new(),
            }],
        }),
        IGMP_V2_LEAVE_GROUP => Ok(IgmpMessage::Leave { group }),
        IGMP_V3_MEMBERSHIP_REPORT => parse_v3_report(data),
        other => Err(DecodeError::UnsupportedVersion(other)),
    }
}

fn parse_v3_report(data: &[u8]) -> Result<IgmpMessage, DecodeError> {
    let num_records = u16::from_be_bytes([data[6], data[7]]) as usize;
    let mut records = Vec::with_capacity(num_records);
    let mut offset = V3_REPORT_HEADER_LEN;

    for _ in 0..num_records {
        if data.len() < offset + V3_RECORD_HEADER_LEN {
            return Err(MalformedPacket::RecordOverrun { offset }.into());
        }
        let raw_type = data[offset];
        let aux_words = data[offset + 1] as usize;
        let num_sources = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let group = read_addr(data, offset + 4);
        let record_len = V3_RECORD_HEADER_LEN + 4 * num_sources + 4 * aux_words;
        if data.len() < offset + record_len {
            return Err(MalformedPacket::RecordOverrun { offset }.into());
        }
        let record_type = RecordType::from_u8(raw_type)
            .ok_or(MalformedPacket::UnknownRecordType(raw_type))?;
        let sources = (0..num_sources)
            .map(|i| read_addr(data, offset + V3_RECORD_HEADER_LEN + 4 * i))
            .collect();

        records.push(GroupRecord {
            record_type,
            group,
            sources,
        });
        offset += record_len;
    }

    Ok(IgmpMessage::Report {
        version: IgmpVersion::V3,
        records,
    })
}

fn read_addr(data: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[at], data[at + 1], data[at + 2], data[at + 3])
}

fn finish(mut packet: Vec<u8>, builder: &impl PacketBuilder) -> Vec<u8> {
    let checksum = builder.calculate_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// Builder for IGMP Membership Query packets
#[derive(Debug)]
pub struct IgmpQueryBuilder {
    pub version: IgmpVersion,
    pub max_resp: Duration,
    /// Group address (0.0.0.0 for general query)
    pub group: Ipv4Addr,
    /// Querier's robustness variable (v3 only)
    pub robustness: u8,
    /// Querier's query interval (v3 only)
    pub query_interval: Duration,
}

impl IgmpQueryBuilder {
    /// Create a general query (all groups)
    pub fn general_query(version: IgmpVersion, max_resp: Duration) -> Self {
        Self::group_specific_query(version, Ipv4Addr::UNSPECIFIED, max_resp)
    }

    /// Create a group-specific query
    pub fn group_specific_query(version: IgmpVersion, group: Ipv4Addr, max_resp: Duration) -> Self {
        Self {
            version,
            max_resp,
            group,
            robustness: 2,
            query_interval: Duration::from_secs(125),
        }
    }

    /// Advertise the querier's own robustness and query interval
    pub fn with_querier_timers(mut self, robustness: u8, query_interval: Duration) -> Self {
        self.robustness = robustness;
        self.query_interval = query_interval;
        self
    }
}

impl PacketBuilder for IgmpQueryBuilder {
    fn build(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(V3_QUERY_MIN_LEN);
        packet.push(IGMP_MEMBERSHIP_QUERY);
        packet.push(encode_max_resp(self.max_resp, self.version));
        packet.extend_from_slice(&[0, 0]);
        packet.extend_from_slice(&self.group.octets());

        if self.version == IgmpVersion::V3 {
            packet.push(self.robustness.min(7));
            packet.push(encode_qqic(self.query_interval));
            packet.extend_from_slice(&0u16.to_be_bytes());
        }

        finish(packet, self)
    }
}

/// Builder for IGMPv3 Membership Report packets
#[derive(Debug)]
pub struct IgmpV3ReportBuilder {
    pub records: Vec<GroupRecord>,
}

impl IgmpV3ReportBuilder {
    pub fn new(records: Vec<GroupRecord>) -> Self {
        Self { records }
    }
}

impl PacketBuilder for IgmpV3ReportBuilder {
    fn build(&self) -> Vec<u8> {
        let len = V3_REPORT_HEADER_LEN + self.records.iter().map(GroupRecord::wire_len).sum::<usize>();
        let mut packet = Vec::with_capacity(len);

        packet.push(IGMP_V3_MEMBERSHIP_REPORT);
        packet.push(0);
        packet.extend_from_slice(&[0, 0]);
        packet.extend_from_slice(&[0, 0]);
        packet.extend_from_slice(&(self.records.len() as u16).to_be_bytes());

        for record in &self.records {
            packet.push(record.record_type as u8);
            packet.push(0); // aux data len
            packet.extend_from_slice(&(record.sources.len() as u16).to_be_bytes());
            packet.extend_from_slice(&record.group.octets());
            for source in &record.sources {
                packet.extend_from_slice(&source.octets());
            }
        }

        finish(packet, self)
    }
}

/// Builder for IGMPv2 Membership Report and Leave Group packets
#[derive(Debug)]
pub struct IgmpV2MessageBuilder {
    pub msg_type: u8,
    pub group: Ipv4Addr,
}

impl IgmpV2MessageBuilder {
    pub fn report(group: Ipv4Addr) -> Self {
        Self {
            msg_type: IGMP_V2_MEMBERSHIP_REPORT,
            group,
        }
    }

    pub fn leave(group: Ipv4Addr) -> Self {
        Self {
            msg_type: IGMP_V2_LEAVE_GROUP,
            group,
        }
    }
}

impl PacketBuilder for IgmpV2MessageBuilder {
    fn build(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(V2_MESSAGE_LEN);
        packet.push(self.msg_type);
        packet.push(0);
        packet.extend_from_slice(&[0, 0]);
        packet.extend_from_slice(&self.group.octets());
        finish(packet, self)
    }
}
