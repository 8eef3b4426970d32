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

// Network interface state and ethernet framing. The link driver is not
// part of this crate: it hands us inbound frames through rx_frame and
// supplies a transmit callback at init time. Address configuration is
// normally filled in later by a DHCP client through the setters here.

use crate::arp;
use crate::buf;
use crate::ip;
use crate::util;
use std::sync::{Condvar, Mutex, OnceLock};

pub const ETH_HEADER_LEN: usize = 14;
pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;

pub type TxHandler = Box<dyn Fn(buf::PktBuf) + Send + Sync>;

struct IfConfig {
    mac: util::EthernetAddr,
    ip: util::IPv4Addr,
    netmask: util::IPv4Addr,
    broadcast: util::IPv4Addr,
    gateway: util::IPv4Addr,
    hostname: String,
}

struct NetIf {
    tx_handler: TxHandler,
    config: Mutex<IfConfig>,
    configured: Mutex<bool>,
    configured_cond: Condvar,
}

static NETIF: OnceLock<NetIf> = OnceLock::new();

fn compute_broadcast(ip: util::IPv4Addr, netmask: util::IPv4Addr) -> util::IPv4Addr {
    util::IPv4Addr::from_u32(
        (ip.as_u32() & netmask.as_u32()) | (util::IPv4Addr::BROADCAST.as_u32() & !netmask.as_u32()),
    )
}

/// Install the link transmit callback and the initial address
/// configuration. Addresses may be all-zero here and assigned later (the
/// DHCP path); the interface counts as configured once it has a non-zero
/// address.
pub fn init(
    tx_handler: TxHandler,
    ip: util::IPv4Addr,
    netmask: util::IPv4Addr,
    gateway: util::IPv4Addr,
) {
    let netif = NetIf {
        tx_handler,
        config: Mutex::new(IfConfig {
            mac: util::EthernetAddr::new(),
            ip,
            netmask,
            broadcast: compute_broadcast(ip, netmask),
            gateway,
            hostname: String::new(),
        }),
        configured: Mutex::new(!ip.is_zero()),
        configured_cond: Condvar::new(),
    };

    assert!(NETIF.set(netif).is_ok(), "netif initialized twice");
}

fn netif() -> &'static NetIf {
    NETIF.get().expect("netstack not initialized")
}

pub fn get_macaddr() -> util::EthernetAddr {
    netif().config.lock().unwrap().mac
}

pub fn set_macaddr(mac: util::EthernetAddr) {
    netif().config.lock().unwrap().mac = mac;
}

pub fn get_ipaddr() -> util::IPv4Addr {
    netif().config.lock().unwrap().ip
}

pub fn set_ipaddr(ip: util::IPv4Addr) {
    let iface = netif();
    {
        let mut config = iface.config.lock().unwrap();
        config.ip = ip;
        config.broadcast = compute_broadcast(ip, config.netmask);
    }

    if !ip.is_zero() {
        *iface.configured.lock().unwrap() = true;
        iface.configured_cond.notify_all();
    }
}

pub fn get_netmask() -> util::IPv4Addr {
    netif().config.lock().unwrap().netmask
}

pub fn set_netmask(netmask: util::IPv4Addr) {
    let mut config = netif().config.lock().unwrap();
    config.netmask = netmask;
    config.broadcast = compute_broadcast(config.ip, netmask);
}

pub fn get_gateway() -> util::IPv4Addr {
    netif().config.lock().unwrap().gateway
}

pub fn set_gateway(gateway: util::IPv4Addr) {
    netif().config.lock().unwrap().gateway = gateway;
}

/// The directed broadcast address for the configured subnet, derived from
/// the address and netmask.
pub fn get_broadcast() -> util::IPv4Addr {
    netif().config.lock().unwrap().broadcast
}

pub fn get_hostname() -> String {
    netif().config.lock().unwrap().hostname.clone()
}

pub fn set_hostname(name: &str) {
    netif().config.lock().unwrap().hostname = name.to_string();
}

/// Block until the interface has an address (e.g. DHCP has finished).
pub fn wait_for_configured() {
    let iface = netif();
    let mut configured = iface.configured.lock().unwrap();
    while !*configured {
        configured = iface.configured_cond.wait(configured).unwrap();
    }
}

//    0                    6                   12        14
//    +--------------------+--------------------+---------+
//    |  Destination MAC   |     Source MAC     |  Type   |
//    +--------------------+--------------------+---------+

/// Prepend the ethernet header and hand the frame to the link driver.
pub fn send_frame(mut packet: buf::PktBuf, dest_mac: util::EthernetAddr, eth_type: u16) {
    packet.alloc_header(ETH_HEADER_LEN);
    let local_mac = get_macaddr();
    let header = packet.header_mut();
    dest_mac.copy_to(&mut header[0..6]);
    local_mac.copy_to(&mut header[6..12]);
    util::set_be16(&mut header[12..14], eth_type);

    util::STATS.frames_sent.inc();
    (netif().tx_handler)(packet);
}

/// Raw frame injection point for the link driver. Runs on the driver's
/// receive thread; everything downstream of here is called in that context.
pub fn rx_frame(mut packet: buf::PktBuf) {
    util::STATS.frames_received.inc();

    if packet.len() < ETH_HEADER_LEN {
        util::STATS.packets_dropped.inc();
        return;
    }

    let header = packet.header();
    let source_mac = util::EthernetAddr::new_from(&header[6..12]);
    let eth_type = util::get_be16(&header[12..14]);
    packet.trim_head(ETH_HEADER_LEN);

    match eth_type {
        ETH_TYPE_IPV4 => ip::ip_input(packet, source_mac),
        ETH_TYPE_ARP => arp::arp_input(packet, source_mac),
        _ => {
            util::STATS.packets_dropped.inc();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_address() {
        assert_eq!(
            compute_broadcast(
                util::IPv4Addr::new_from(&[10, 0, 0, 2]),
                util::IPv4Addr::new_from(&[255, 255, 255, 0])
            ),
            util::IPv4Addr::new_from(&[10, 0, 0, 255])
        );

        assert_eq!(
            compute_broadcast(
                util::IPv4Addr::new_from(&[172, 16, 5, 1]),
                util::IPv4Addr::new_from(&[255, 255, 0, 0])
            ),
            util::IPv4Addr::new_from(&[172, 16, 255, 255])
        );
    }

    #[test]
    fn test_send_frame_header() {
        let _stack = testutil::init_test_netif();

        let mut packet = buf::PktBuf::new();
        packet.append_from_slice(b"payload");
        send_frame(
            packet,
            util::EthernetAddr::new_from(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]),
            ETH_TYPE_IPV4,
        );

        let frames = testutil::drain_frames();
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(&frame[0..6], &[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        assert_eq!(&frame[6..12], &testutil::TEST_MAC);
        assert_eq!(util::get_be16(&frame[12..14]), ETH_TYPE_IPV4);
        assert_eq!(&frame[14..], b"payload");
    }

    #[test]
    fn test_runt_frame_dropped() {
        let _stack = testutil::init_test_netif();

        rx_frame(buf::PktBuf::new_from_frame(&[0u8; 6]));
        assert!(testutil::drain_frames().is_empty());
    }
}
