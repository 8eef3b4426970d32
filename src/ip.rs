//
// Copyright 2025 Jeff Bush
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

// Internet Protocol as described in RFC 791

use crate::arp;
use crate::buf;
use crate::icmp;
use crate::netif;
use crate::tcp;
use crate::udp;
use crate::util;
use std::sync::atomic::{AtomicU16, Ordering};

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

pub const IPV4_HEADER_LEN: usize = 20;

static NEXT_PACKET_ID: AtomicU16 = AtomicU16::new(0);
const DEFAULT_TTL: u8 = 64;

//    0               1               2               3
//    +-------+-------+---------------+-------------------------------+
//  0 |Version|  IHL  |Type of Service|          Total Length         |
//    +-------+-------+---------------+-----+-------------------------+
//  4 |         Identification        |Flags|      Fragment Offset    |
//    +---------------+---------------+-----+-------------------------+
//  8 |  Time to Live |    Protocol   |         Header Checksum       |
//    +---------------+---------------+-------------------------------+
// 12 |                       Source Address                          |
//    +---------------------------------------------------------------+
// 16 |                    Destination Address                        |
//    +---------------------------------------------------------------+

/// Pick the link address for a destination: broadcast addresses map to the
/// broadcast MAC, hosts outside the configured subnet go through the
/// gateway, everything else resolves directly.
pub(crate) fn route_link_addr(
    dest_addr: util::IPv4Addr,
) -> Result<util::EthernetAddr, util::NetError> {
    if dest_addr == util::IPv4Addr::BROADCAST || dest_addr == netif::get_broadcast() {
        return Ok(util::EthernetAddr::BROADCAST);
    }

    let local_ip = netif::get_ipaddr();
    let netmask = netif::get_netmask();
    if (dest_addr.as_u32() & netmask.as_u32()) != (local_ip.as_u32() & netmask.as_u32()) {
        let gateway = netif::get_gateway();
        if gateway.is_zero() {
            return Err(util::NetError::NoRoute);
        }

        arp::resolve(gateway)
    } else {
        arp::resolve(dest_addr)
    }
}

/// Prepend a filled-in IPv4 header for a payload already in the packet.
pub(crate) fn build_ipv4_header(packet: &mut buf::PktBuf, protocol: u8, dest_addr: util::IPv4Addr) {
    packet.alloc_header(IPV4_HEADER_LEN);
    let total_length = packet.len() as u16;
    let header = packet.header_mut();
    header[0] = 0x45; // Version/IHL
    util::set_be16(&mut header[2..4], total_length);
    util::set_be16(
        &mut header[4..6],
        NEXT_PACKET_ID.fetch_add(1, Ordering::AcqRel),
    );
    header[6] = 0x40; // Don't fragment, no offset
    header[8] = DEFAULT_TTL;
    header[9] = protocol;
    netif::get_ipaddr().copy_to(&mut header[12..16]);
    dest_addr.copy_to(&mut header[16..20]);

    let checksum = util::checksum(&header[..IPV4_HEADER_LEN]);
    util::set_be16(&mut header[10..12], checksum);
}

pub fn ip_output(
    mut packet: buf::PktBuf,
    protocol: u8,
    dest_addr: util::IPv4Addr,
) -> Result<(), util::NetError> {
    // Resolution may block waiting for an ARP reply.
    let dest_mac = route_link_addr(dest_addr)?;

    build_ipv4_header(&mut packet, protocol, dest_addr);
    netif::send_frame(packet, dest_mac, netif::ETH_TYPE_IPV4);
    Ok(())
}

/// Validate and dispatch an inbound IPv4 packet (ethernet header already
/// stripped). Malformed packets are dropped without comment; that is the
/// policy for everything arriving off the wire.
pub fn ip_input(mut packet: buf::PktBuf, source_mac: util::EthernetAddr) {
    if packet.len() < IPV4_HEADER_LEN {
        util::STATS.packets_dropped.inc();
        return;
    }

    let header = packet.header();
    if header[0] >> 4 != 4 {
        util::STATS.packets_dropped.inc();
        return;
    }

    let header_len = ((header[0] & 0xf) as usize) * 4;
    if header_len < IPV4_HEADER_LEN || header_len > packet.len() {
        util::STATS.packets_dropped.inc();
        return;
    }

    // Options, if present, are covered by the checksum but otherwise
    // skipped.
    if util::checksum(&header[..header_len]) != 0 {
        println!("IP: bad header checksum");
        util::STATS.packets_dropped.inc();
        return;
    }

    let total_len = util::get_be16(&header[2..4]) as usize;
    if total_len < header_len || total_len > packet.len() {
        util::STATS.packets_dropped.inc();
        return;
    }

    let protocol = header[9];
    let source_addr = util::IPv4Addr::new_from(&header[12..16]);
    let dest_addr = util::IPv4Addr::new_from(&header[16..20]);

    // Drop any link layer padding beyond the declared length.
    let slack = packet.len() - total_len;
    if slack > 0 {
        packet.trim_tail(slack);
    }

    // The packet passed validation; let it refresh the resolution cache.
    arp::update(source_addr, source_mac);

    // Accept only traffic for us or broadcast. While unconfigured,
    // accept everything so DHCP can bootstrap.
    let local_ip = netif::get_ipaddr();
    if dest_addr != util::IPv4Addr::BROADCAST
        && !local_ip.is_zero()
        && dest_addr != local_ip
        && dest_addr != netif::get_broadcast()
    {
        util::STATS.packets_dropped.inc();
        return;
    }

    packet.trim_head(header_len);

    match protocol {
        PROTO_ICMP => icmp::icmp_input(packet, source_addr),
        PROTO_TCP => tcp::tcp_input(packet, source_addr, dest_addr),
        PROTO_UDP => udp::udp_input(packet, source_addr),
        _ => {
            util::STATS.packets_dropped.inc();
        }
    }
}
