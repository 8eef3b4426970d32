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

// User Datagram Protocol as described in RFC 768. Inbound delivery is a
// callback registry keyed by destination port; outbound sockets resolve
// the remote link address once, at open time.

use crate::buf;
use crate::ip;
use crate::netif;
use crate::util;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const UDP_HEADER_LEN: usize = 8;

// The UDP checksum is optional for IPv4. Off by default; a zero checksum
// field tells the receiver it wasn't computed.
const UDP_FORCE_CHECKSUM: bool = false;

pub type ListenerCallback = Arc<dyn Fn(&[u8], util::IPv4Addr, u16) + Send + Sync>;

lazy_static! {
    static ref LISTENERS: Mutex<HashMap<u16, ListenerCallback>> = Mutex::new(HashMap::new());
}

/// A connected datagram handle. The remote link address was resolved when
/// the socket was opened and is reused for every send.
pub struct UdpSocket {
    remote_ip: util::IPv4Addr,
    remote_port: u16,
    local_port: u16,
    dest_mac: util::EthernetAddr,
}

/// Register a callback for datagrams arriving on a port. One listener per
/// port.
pub fn udp_listen<F>(port: u16, callback: F) -> Result<(), util::NetError>
where
    F: Fn(&[u8], util::IPv4Addr, u16) + Send + Sync + 'static,
{
    let mut listeners = LISTENERS.lock().unwrap();
    if listeners.contains_key(&port) {
        return Err(util::NetError::PortInUse);
    }

    listeners.insert(port, Arc::new(callback));
    Ok(())
}

/// Unregister a port listener. Returns whether one was registered.
pub fn udp_unlisten(port: u16) -> bool {
    LISTENERS.lock().unwrap().remove(&port).is_some()
}

/// Open a send handle to remote_ip:remote_port. The link address is
/// resolved here, eagerly; an unresolvable peer fails the open rather than
/// the first send.
pub fn udp_open(
    remote_ip: util::IPv4Addr,
    local_port: u16,
    remote_port: u16,
) -> Result<UdpSocket, util::NetError> {
    let dest_mac = ip::route_link_addr(remote_ip)?;

    Ok(UdpSocket {
        remote_ip,
        remote_port,
        local_port,
        dest_mac,
    })
}

pub fn udp_close(_socket: UdpSocket) {}

//    0               1               2               3
//    +-------------------------------+-------------------------------+
//  0 |         Source Port           |          Dest Port            |
//    +-------------------------------+-------------------------------+
//  4 |            Length             |           Checksum            |
//    +-------------------------------+-------------------------------+

/// Send one datagram gathered from a list of slices.
pub fn udp_sendv(socket: &UdpSocket, buffers: &[&[u8]]) -> Result<(), util::NetError> {
    let mut packet = buf::PktBuf::new();
    for slice in buffers {
        packet.append_from_slice(slice);
    }

    packet.alloc_header(UDP_HEADER_LEN);
    let length = packet.len() as u16;
    let header = packet.header_mut();
    util::set_be16(&mut header[0..2], socket.local_port);
    util::set_be16(&mut header[2..4], socket.remote_port);
    util::set_be16(&mut header[4..6], length);

    if UDP_FORCE_CHECKSUM {
        let pseudo_sum = util::pseudo_header_sum(
            netif::get_ipaddr(),
            socket.remote_ip,
            ip::PROTO_UDP,
            length as usize,
        );

        let checksum = 0xffff ^ util::ones_sum16(pseudo_sum, packet.header());
        let header = packet.header_mut();
        util::set_be16(&mut header[6..8], checksum);
    }

    ip::build_ipv4_header(&mut packet, ip::PROTO_UDP, socket.remote_ip);
    netif::send_frame(packet, socket.dest_mac, netif::ETH_TYPE_IPV4);
    Ok(())
}

pub fn udp_send(socket: &UdpSocket, data: &[u8]) -> Result<(), util::NetError> {
    udp_sendv(socket, &[data])
}

/// Deliver an inbound datagram to the listener registered on its
/// destination port, if any.
pub fn udp_input(mut packet: buf::PktBuf, source_addr: util::IPv4Addr) {
    if packet.len() < UDP_HEADER_LEN {
        util::STATS.packets_dropped.inc();
        return;
    }

    let header = packet.header();
    let source_port = util::get_be16(&header[0..2]);
    let dest_port = util::get_be16(&header[2..4]);
    let length = util::get_be16(&header[4..6]) as usize;
    if length < UDP_HEADER_LEN || length > packet.len() {
        util::STATS.packets_dropped.inc();
        return;
    }

    let slack = packet.len() - length;
    if slack > 0 {
        packet.trim_tail(slack);
    }

    packet.trim_head(UDP_HEADER_LEN);

    // Clone the handler out so the registry lock isn't held while user
    // code runs.
    let callback = LISTENERS.lock().unwrap().get(&dest_port).cloned();
    match callback {
        Some(callback) => callback(packet.header(), source_addr, source_port),
        None => {
            util::STATS.packets_dropped.inc();
        }
    }
}
