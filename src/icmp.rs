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

use crate::buf;
use crate::ip;
use crate::util;

//    0               1               2               3
//    +---------------+---------------+-------------------------------+
//  0 |     Type      |     Code      |          Checksum             |
//    +---------------+---------------+-------------------------------+
//  4 |                     Payload...                                |
//    +---------------------------------------------------------------+

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;

const ICMP_HEADER_LEN: usize = 4;

// The identifier, sequence number, and data ride in the payload and are
// echoed back untouched; ping validates them on its end.
pub fn icmp_input(mut packet: buf::PktBuf, source_addr: util::IPv4Addr) {
    if packet.len() < ICMP_HEADER_LEN {
        util::STATS.packets_dropped.inc();
        return;
    }

    if util::checksum(packet.header()) != 0 {
        println!("ICMP: bad checksum");
        util::STATS.packets_dropped.inc();
        return;
    }

    let packet_type = packet.header()[0];
    packet.trim_head(ICMP_HEADER_LEN);
    if packet_type == ICMP_ECHO_REQUEST {
        let mut response = buf::PktBuf::new();
        response.append_from_slice(packet.header());
        icmp_output(response, ICMP_ECHO_REPLY, source_addr);
    }
}

pub fn icmp_output(mut packet: buf::PktBuf, packet_type: u8, dest_addr: util::IPv4Addr) {
    packet.alloc_header(ICMP_HEADER_LEN);
    let header = packet.header_mut();
    header[0] = packet_type;
    let checksum = util::checksum(packet.header());

    let header = packet.header_mut();
    util::set_be16(&mut header[2..4], checksum);

    // An unresolvable reply destination is dropped just like any other
    // undeliverable response.
    let _ = ip::ip_output(packet, ip::PROTO_ICMP, dest_addr);
}
