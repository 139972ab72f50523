// SPDX-License-Identifier: Apache-2.0 OR MIT
//! IGMP packet codec
//!
//! Pure, stateless transforms between Ethernet frames and IGMP messages:
//!
//! - **Decode**: Ethernet (optionally 802.1Q / QinQ tagged) -> IPv4 -> IGMP,
//!   verifying the IPv4 header checksum and the IGMP checksum.
//! - **Encode**: upstream IGMPv3 or IGMPv2 reports/leaves and downstream
//!   queries, wrapped in IPv4 with the Router Alert option.
//!
//! Every function here is safe to call concurrently from packet workers.

pub mod frame;
pub mod igmp;

use std::net::Ipv4Addr;
use std::time::Duration;

use thiserror::Error;

pub use frame::{FrameHeaders, MacAddr};
pub use igmp::{GroupRecord, IgmpMessage, IgmpVersion, MembershipChange, MembershipIntent, RecordType};

use igmp::{
    IgmpQueryBuilder, IgmpV2MessageBuilder, IgmpV3ReportBuilder, ALL_ROUTERS_GROUP,
    ALL_SYSTEMS_GROUP, IGMPV3_ALL_ROUTERS_GROUP,
};

/// Structural problems with a frame; always dropped and counted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedPacket {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("invalid EtherType: expected 0x0800 (IPv4), got {0:#06x}")]
    InvalidEtherType(u16),

    #[error("more than two VLAN tags")]
    TooManyVlanTags,

    #[error("invalid IP version: expected 4, got {0}")]
    InvalidIpVersion(u8),

    #[error("IP header length too small: {0} bytes")]
    IpHeaderTooSmall(usize),

    #[error("IP total length {total} shorter than header length {header}")]
    IpLengthMismatch { header: usize, total: usize },

    #[error("fragmented IGMP packet")]
    Fragmented,

    #[error("invalid IP protocol: expected 2 (IGMP), got {0}")]
    InvalidIpProtocol(u8),

    #[error("IP header checksum mismatch")]
    IpChecksumMismatch,

    #[error("IGMP checksum mismatch")]
    IgmpChecksumMismatch,

    #[error("query declares {declared} sources but carries {available}")]
    SourceCountMismatch { declared: usize, available: usize },

    #[error("group record at offset {offset} runs past the end of the report")]
    RecordOverrun { offset: usize },

    #[error("unknown group record type {0}")]
    UnknownRecordType(u8),
}

/// Errors returned by [`decode`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] MalformedPacket),

    #[error("unsupported IGMP message type {0:#04x}")]
    UnsupportedVersion(u8),
}

/// A decoded inbound IGMP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgmpPacket {
    pub headers: FrameHeaders,
    pub message: IgmpMessage,
}

/// Common trait for IGMP packet builders
pub trait PacketBuilder {
    /// Build the IGMP payload, checksum included
    fn build(&self) -> Vec<u8>;

    /// Internet checksum of `data`
    fn calculate_checksum(&self, data: &[u8]) -> u16 {
        checksum(data)
    }
}

/// RFC 1071 one's complement checksum. Returns 0 when run over data that
/// already contains a correct checksum.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum = sum.wrapping_add(word as u32);
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Decode an Ethernet frame carrying IGMP
pub fn decode(frame: &[u8]) -> Result<IgmpPacket, DecodeError> {
    let (headers, payload) = frame::parse_frame(frame)?;
    if payload.len() >= 4 && checksum(payload) != 0 {
        return Err(MalformedPacket::IgmpChecksumMismatch.into());
    }
    let message = igmp::parse_message(payload)?;
    Ok(IgmpPacket { headers, message })
}

/// Upstream report toward the multicast router.
///
/// IGMPv3 carries all records in one report to 224.0.0.22. IGMPv2 has no
/// source lists: each record becomes a report or a Leave Group (to
/// 224.0.0.2), so one frame is produced per record.
pub fn encode_report(
    records: &[GroupRecord],
    version: IgmpVersion,
    src_mac: MacAddr,
    src_ip: Ipv4Addr,
    vlan: Option<u16>,
) -> Vec<Vec<u8>> {
    match version {
        IgmpVersion::V3 => {
            let payload = IgmpV3ReportBuilder::new(records.to_vec()).build();
            vec![frame::build_frame(
                src_mac,
                src_ip,
                IGMPV3_ALL_ROUTERS_GROUP,
                vlan,
                &payload,
            )]
        }
        IgmpVersion::V2 => records
            .iter()
            .filter_map(|record| {
                let (builder, dst) = match record.record_type {
                    RecordType::ChangeToIncludeMode if record.sources.is_empty() => {
                        (IgmpV2MessageBuilder::leave(record.group), ALL_ROUTERS_GROUP)
                    }
                    // v2 cannot withdraw a single source
                    RecordType::BlockOldSources => return None,
                    _ => (IgmpV2MessageBuilder::report(record.group), record.group),
                };
                Some(frame::build_frame(src_mac, src_ip, dst, vlan, &builder.build()))
            })
            .collect(),
    }
}

/// Downstream query toward subscribers; `group == None` is a general query
pub fn encode_query(
    group: Option<Ipv4Addr>,
    max_resp: Duration,
    version: IgmpVersion,
    querier: QuerierTimers,
    src_mac: MacAddr,
    src_ip: Ipv4Addr,
    vlan: Option<u16>,
) -> Vec<u8> {
    let (builder, dst) = match group {
        Some(g) => (IgmpQueryBuilder::group_specific_query(version, g, max_resp), g),
        None => (IgmpQueryBuilder::general_query(version, max_resp), ALL_SYSTEMS_GROUP),
    };
    let builder = builder.with_querier_timers(querier.robustness, querier.query_interval);
    frame::build_frame(src_mac, src_ip, dst, vlan, &builder.build())
}

/// Robustness and query interval a v3 query advertises to hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerierTimers {
    pub robustness: u8,
    pub query_interval: Duration,
}

impl Default for QuerierTimers {
    fn default() -> Self {
        Self {
            robustness: 2,
            query_interval: Duration::from_secs(125),
        }
    }
}
