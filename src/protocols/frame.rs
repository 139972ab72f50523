// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Ethernet / 802.1Q / IPv4 framing for IGMP messages
//!
//! Inbound frames are peeled down to the IGMP payload; outbound IGMP payloads
//! are wrapped in an IPv4 header carrying the Router Alert option (RFC 2113),
//! TTL 1, and an Ethernet header addressed to the mapped multicast MAC.

use std::net::Ipv4Addr;

use super::{checksum, MalformedPacket};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_QINQ: u16 = 0x88a8;
pub const IP_PROTOCOL_IGMP: u8 = 2;

const ETHERNET_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const IPV4_MIN_HEADER_LEN: usize = 20;
const ROUTER_ALERT: [u8; 4] = [0x94, 0x04, 0x00, 0x00];
/// DSCP CS6 (internetwork control)
const IGMP_TOS: u8 = 0xc0;

/// A MAC address in wire order
pub type MacAddr = [u8; 6];

/// Ethernet and IPv4 metadata of a decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeaders {
    pub dst_mac: MacAddr,
    pub src_mac: MacAddr,
    /// Outermost VLAN id, if the frame was tagged
    pub vlan: Option<u16>,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
}

/// Strip Ethernet (with up to two VLAN tags) and IPv4 headers.
///
/// Returns the headers and the IGMP payload, bounded by the IPv4 total length.
pub fn parse_frame(data: &[u8]) -> Result<(FrameHeaders, &[u8]), MalformedPacket> {
    need(data, ETHERNET_HEADER_LEN)?;

    let mut dst_mac = [0u8; 6];
    let mut src_mac = [0u8; 6];
    dst_mac.copy_from_slice(&data[0..6]);
    src_mac.copy_from_slice(&data[6..12]);

    let mut offset = 12;
    let mut ether_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
    let mut vlan = None;
    let mut tags = 0;
    while ether_type == ETHERTYPE_VLAN || ether_type == ETHERTYPE_QINQ {
        if tags == 2 {
            return Err(MalformedPacket::TooManyVlanTags);
        }
        need(data, offset + 2 + VLAN_TAG_LEN)?;
        let tci = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
        if vlan.is_none() {
            vlan = Some(tci & 0x0fff);
        }
        offset += VLAN_TAG_LEN;
        ether_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        tags += 1;
    }
    if ether_type != ETHERTYPE_IPV4 {
        return Err(MalformedPacket::InvalidEtherType(ether_type));
    }

    let ip = &data[offset + 2..];
    need(ip, IPV4_MIN_HEADER_LEN)?;

    let version = ip[0] >> 4;
    if version != 4 {
        return Err(MalformedPacket::InvalidIpVersion(version));
    }
    let header_len = (ip[0] & 0x0f) as usize * 4;
    if header_len < IPV4_MIN_HEADER_LEN {
        return Err(MalformedPacket::IpHeaderTooSmall(header_len));
    }
    need(ip, header_len)?;

    let total_length = u16::from_be_bytes([ip[2], ip[3]]) as usize;
    if total_length < header_len {
        return Err(MalformedPacket::IpLengthMismatch {
            header: header_len,
            total: total_length,
        });
    }
    need(ip, total_length)?;

    let flags_and_offset = u16::from_be_bytes([ip[6], ip[7]]);
    let more_fragments = flags_and_offset & 0x2000 != 0;
    if more_fragments || flags_and_offset & 0x1fff != 0 {
        return Err(MalformedPacket::Fragmented);
    }

    if ip[9] != IP_PROTOCOL_IGMP {
        return Err(MalformedPacket::InvalidIpProtocol(ip[9]));
    }
    if checksum(&ip[..header_len]) != 0 {
        return Err(MalformedPacket::IpChecksumMismatch);
    }

    let headers = FrameHeaders {
        dst_mac,
        src_mac,
        vlan,
        src_ip: Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]),
        dst_ip: Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]),
    };
    Ok((headers, &ip[header_len..total_length]))
}

/// Multicast MAC for an IPv4 group (01:00:5e + low 23 bits)
pub fn multicast_mac(group: Ipv4Addr) -> MacAddr {
    let o = group.octets();
    [0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]]
}

/// Wrap an IGMP payload into a complete Ethernet frame.
pub fn build_frame(
    src_mac: MacAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    vlan: Option<u16>,
    igmp: &[u8],
) -> Vec<u8> {
    let ip_header_len = IPV4_MIN_HEADER_LEN + ROUTER_ALERT.len();
    let total_length = ip_header_len + igmp.len();
    let mut frame = Vec::with_capacity(ETHERNET_HEADER_LEN + VLAN_TAG_LEN + total_length);

    frame.extend_from_slice(&multicast_mac(dst_ip));
    frame.extend_from_slice(&src_mac);
    if let Some(vid) = vlan {
        frame.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
        frame.extend_from_slice(&(vid & 0x0fff).to_be_bytes());
    }
    frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    let ip_start = frame.len();
    frame.push(0x40 | (ip_header_len / 4) as u8);
    frame.push(IGMP_TOS);
    frame.extend_from_slice(&(total_length as u16).to_be_bytes());
    // Identification, flags (DF), fragment offset
    frame.extend_from_slice(&[0x00, 0x00, 0x40, 0x00]);
    frame.push(1); // TTL
    frame.push(IP_PROTOCOL_IGMP);
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(&src_ip.octets());
    frame.extend_from_slice(&dst_ip.octets());
    frame.extend_from_slice(&ROUTER_ALERT);

    let ip_checksum = checksum(&frame[ip_start..ip_start + ip_header_len]);
    frame[ip_start + 10..ip_start + 12].copy_from_slice(&ip_checksum.to_be_bytes());

    frame.extend_from_slice(igmp);
    frame
}

fn need(data: &[u8], expected: usize) -> Result<(), MalformedPacket> {
    if data.len() < expected {
        return Err(MalformedPacket::Truncated {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}
