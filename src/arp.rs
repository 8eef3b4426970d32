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

// Address Resolution Protocol as described in RFC 826, IPv4 over ethernet
// only. The cache is most-recently-used ordered and is refreshed
// opportunistically from every accepted inbound packet, not just ARP
// replies. Entries never expire.

use crate::buf;
use crate::netif;
use crate::util;
use std::sync::{Condvar, LazyLock, Mutex};
use std::time::{Duration, Instant};

const ARP_PACKET_LEN: usize = 28;
const ARP_HTYPE_ETHERNET: u16 = 1;
const ARP_OPER_REQUEST: u16 = 1;
const ARP_OPER_REPLY: u16 = 2;

// How long resolve() waits for a reply before giving up.
const RESOLVE_TIMEOUT: Duration = Duration::from_millis(100);

struct ArpEntry {
    ip: util::IPv4Addr,
    mac: util::EthernetAddr,
}

struct ArpCache {
    entries: Mutex<Vec<ArpEntry>>,
    updated: Condvar,
}

static ARP_CACHE: LazyLock<ArpCache> = LazyLock::new(|| ArpCache {
    entries: Mutex::new(Vec::new()),
    updated: Condvar::new(),
});

/// Record or refresh a mapping, promoting it to the most-recently-used
/// position. The unassigned address and x.x.x.255 broadcast addresses are
/// never cached.
pub fn update(ip: util::IPv4Addr, mac: util::EthernetAddr) {
    if ip.is_zero() || ip.octets()[3] == 0xff {
        return;
    }

    let mut entries = ARP_CACHE.entries.lock().unwrap();
    if let Some(index) = entries.iter().position(|entry| entry.ip == ip) {
        let mut entry = entries.remove(index);
        entry.mac = mac;
        entries.insert(0, entry);
    } else {
        entries.insert(0, ArpEntry { ip, mac });
    }

    drop(entries);
    ARP_CACHE.updated.notify_all();
}

/// Look up a mapping, promoting it on a hit.
pub fn lookup(ip: util::IPv4Addr) -> Option<util::EthernetAddr> {
    let mut entries = ARP_CACHE.entries.lock().unwrap();
    let index = entries.iter().position(|entry| entry.ip == ip)?;
    let entry = entries.remove(index);
    let mac = entry.mac;
    entries.insert(0, entry);

    Some(mac)
}

/// Resolve an address, transmitting an ARP request and blocking for the
/// reply if it isn't already cached.
pub fn resolve(ip: util::IPv4Addr) -> Result<util::EthernetAddr, util::NetError> {
    if ip == util::IPv4Addr::BROADCAST {
        return Ok(util::EthernetAddr::BROADCAST);
    }

    if let Some(mac) = lookup(ip) {
        return Ok(mac);
    }

    send_request(ip);

    let deadline = Instant::now() + RESOLVE_TIMEOUT;
    let mut entries = ARP_CACHE.entries.lock().unwrap();
    loop {
        if let Some(entry) = entries.iter().find(|entry| entry.ip == ip) {
            return Ok(entry.mac);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(util::NetError::HostUnreachable);
        }

        entries = ARP_CACHE
            .updated
            .wait_timeout(entries, deadline - now)
            .unwrap()
            .0;
    }
}

//    0               1               2               3
//    +-------------------------------+-------------------------------+
//  0 |        Hardware Type          |        Protocol Type          |
//    +---------------+---------------+-------------------------------+
//  4 |   HW Length   |  Proto Length |          Operation            |
//    +---------------+---------------+-------------------------------+
//  8 |                     Sender MAC (bytes 0-3)                    |
//    +-------------------------------+-------------------------------+
// 12 |     Sender MAC (bytes 4-5)    |      Sender IP (bytes 0-1)    |
//    +-------------------------------+-------------------------------+
// 16 |     Sender IP (bytes 2-3)     |      Target MAC (bytes 0-1)   |
//    +-------------------------------+-------------------------------+
// 20 |                     Target MAC (bytes 2-5)                    |
//    +---------------------------------------------------------------+
// 24 |                           Target IP                           |
//    +---------------------------------------------------------------+

fn build_packet(
    oper: u16,
    sender_mac: util::EthernetAddr,
    sender_ip: util::IPv4Addr,
    target_mac: util::EthernetAddr,
    target_ip: util::IPv4Addr,
) -> buf::PktBuf {
    let mut packet = buf::PktBuf::new();
    let mut body = [0u8; ARP_PACKET_LEN];
    util::set_be16(&mut body[0..2], ARP_HTYPE_ETHERNET);
    util::set_be16(&mut body[2..4], netif::ETH_TYPE_IPV4);
    body[4] = 6;
    body[5] = 4;
    util::set_be16(&mut body[6..8], oper);
    sender_mac.copy_to(&mut body[8..14]);
    sender_ip.copy_to(&mut body[14..18]);
    target_mac.copy_to(&mut body[18..24]);
    target_ip.copy_to(&mut body[24..28]);
    packet.append_from_slice(&body);

    packet
}

fn send_request(ip: util::IPv4Addr) {
    let packet = build_packet(
        ARP_OPER_REQUEST,
        netif::get_macaddr(),
        netif::get_ipaddr(),
        util::EthernetAddr::BROADCAST,
        ip,
    );

    netif::send_frame(packet, util::EthernetAddr::BROADCAST, netif::ETH_TYPE_ARP);
}

/// Handle an inbound ARP packet (ethernet header already stripped).
pub fn arp_input(packet: buf::PktBuf, source_mac: util::EthernetAddr) {
    if packet.len() < ARP_PACKET_LEN {
        util::STATS.packets_dropped.inc();
        return;
    }

    let body = packet.header();
    if util::get_be16(&body[0..2]) != ARP_HTYPE_ETHERNET
        || util::get_be16(&body[2..4]) != netif::ETH_TYPE_IPV4
        || body[4] != 6
        || body[5] != 4
    {
        util::STATS.packets_dropped.inc();
        return;
    }

    let oper = util::get_be16(&body[6..8]);
    let sender_mac = util::EthernetAddr::new_from(&body[8..14]);
    let sender_ip = util::IPv4Addr::new_from(&body[14..18]);
    let target_ip = util::IPv4Addr::new_from(&body[24..28]);

    match oper {
        ARP_OPER_REQUEST => {
            if target_ip == netif::get_ipaddr() && !target_ip.is_zero() {
                update(sender_ip, sender_mac);
                let reply = build_packet(
                    ARP_OPER_REPLY,
                    netif::get_macaddr(),
                    netif::get_ipaddr(),
                    sender_mac,
                    sender_ip,
                );

                netif::send_frame(reply, source_mac, netif::ETH_TYPE_ARP);
            }
        }

        ARP_OPER_REPLY => {
            // Trusted as claimed; there is no check that we asked.
            update(sender_ip, sender_mac);
        }

        _ => {
            util::STATS.packets_dropped.inc();
        }
    }
}

#[cfg(test)]
fn cache_position(ip: util::IPv4Addr) -> Option<usize> {
    ARP_CACHE
        .entries
        .lock()
        .unwrap()
        .iter()
        .position(|entry| entry.ip == ip)
}
