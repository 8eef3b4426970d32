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

// Whole-stack tests through the public interface only: frames go in
// through netif::rx_frame and come back out through the transmit callback
// handed to init_netstack, exactly as a link driver would see them.

use ministack::{buf, init_netstack, netif, tcp, udp, util};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, Once};
use std::time::Duration;

const OUR_IP: [u8; 4] = [10, 0, 0, 2];
const OUR_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
const PEER_IP: [u8; 4] = [10, 0, 0, 7];
const PEER_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x07];

const ETH_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;

const ETH_TYPE_IPV4: u16 = 0x0800;
const ETH_TYPE_ARP: u16 = 0x0806;
const PROTO_ICMP: u8 = 1;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

const FLAG_FIN: u8 = 1;
const FLAG_SYN: u8 = 2;
const FLAG_PSH: u8 = 8;
const FLAG_ACK: u8 = 16;

static TRANSMITTED: LazyLock<Mutex<Vec<Vec<u8>>>> = LazyLock::new(|| Mutex::new(Vec::new()));
static STACK_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));
static INIT: Once = Once::new();

fn setup() -> MutexGuard<'static, ()> {
    INIT.call_once(|| {
        init_netstack(
            Box::new(|packet| {
                TRANSMITTED.lock().unwrap().push(packet.header().to_vec());
            }),
            util::IPv4Addr::new_from(&OUR_IP),
            util::IPv4Addr::new_from(&[255, 255, 255, 0]),
            util::IPv4Addr::new_from(&[10, 0, 0, 1]),
        );
        netif::set_macaddr(util::EthernetAddr::new_from(&OUR_MAC));
    });

    let guard = match STACK_LOCK.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    TRANSMITTED.lock().unwrap().clear();
    guard
}

fn drain() -> Vec<Vec<u8>> {
    std::mem::take(&mut *TRANSMITTED.lock().unwrap())
}

fn inject(frame: Vec<u8>) {
    netif::rx_frame(buf::PktBuf::new_from_frame(&frame));
}

fn eth_frame(eth_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&OUR_MAC);
    frame.extend_from_slice(&PEER_MAC);
    frame.extend_from_slice(&eth_type.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn ipv4_packet(protocol: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; IPV4_HEADER_LEN];
    packet[0] = 0x45;
    let total_len = (IPV4_HEADER_LEN + payload.len()) as u16;
    packet[2..4].copy_from_slice(&total_len.to_be_bytes());
    packet[8] = 64;
    packet[9] = protocol;
    packet[12..16].copy_from_slice(&PEER_IP);
    packet[16..20].copy_from_slice(&OUR_IP);
    let checksum = util::checksum(&packet[..IPV4_HEADER_LEN]);
    util::set_be16(&mut packet[10..12], checksum);
    packet.extend_from_slice(payload);
    packet
}

fn tcp_segment(
    source_port: u16,
    dest_port: u16,
    seq_num: u32,
    ack_num: u32,
    flags: u8,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut segment = vec![0u8; TCP_HEADER_LEN];
    segment[0..2].copy_from_slice(&source_port.to_be_bytes());
    segment[2..4].copy_from_slice(&dest_port.to_be_bytes());
    segment[4..8].copy_from_slice(&seq_num.to_be_bytes());
    segment[8..12].copy_from_slice(&ack_num.to_be_bytes());
    segment[12] = ((TCP_HEADER_LEN / 4) << 4) as u8;
    segment[13] = flags;
    segment[14..16].copy_from_slice(&window.to_be_bytes());
    segment.extend_from_slice(payload);

    let pseudo_sum = util::pseudo_header_sum(
        util::IPv4Addr::new_from(&PEER_IP),
        util::IPv4Addr::new_from(&OUR_IP),
        PROTO_TCP,
        segment.len(),
    );
    let checksum = util::ones_sum16(pseudo_sum, &segment) ^ 0xffff;
    util::set_be16(&mut segment[16..18], checksum);

    segment
}

struct Segment {
    source_port: u16,
    dest_port: u16,
    seq_num: u32,
    ack_num: u32,
    flags: u8,
    payload: Vec<u8>,
}

fn tcp_frames(frames: &[Vec<u8>]) -> Vec<Segment> {
    frames
        .iter()
        .filter(|frame| {
            util::get_be16(&frame[12..14]) == ETH_TYPE_IPV4
                && frame[ETH_HEADER_LEN + 9] == PROTO_TCP
        })
        .map(|frame| {
            let segment = &frame[ETH_HEADER_LEN + IPV4_HEADER_LEN..];
            let header_length = ((segment[12] >> 4) * 4) as usize;
            Segment {
                source_port: util::get_be16(&segment[0..2]),
                dest_port: util::get_be16(&segment[2..4]),
                seq_num: util::get_be32(&segment[4..8]),
                ack_num: util::get_be32(&segment[8..12]),
                flags: segment[13] & 0x3f,
                payload: segment[header_length..].to_vec(),
            }
        })
        .collect()
}

// Prime the neighbor cache so outbound sends don't block resolving.
fn announce_peer() {
    let mut arp = vec![0u8; 28];
    arp[0..2].copy_from_slice(&1u16.to_be_bytes());
    arp[2..4].copy_from_slice(&ETH_TYPE_IPV4.to_be_bytes());
    arp[4] = 6;
    arp[5] = 4;
    arp[6..8].copy_from_slice(&2u16.to_be_bytes()); // reply
    arp[8..14].copy_from_slice(&PEER_MAC);
    arp[14..18].copy_from_slice(&PEER_IP);
    arp[18..24].copy_from_slice(&OUR_MAC);
    arp[24..28].copy_from_slice(&OUR_IP);
    inject(eth_frame(ETH_TYPE_ARP, &arp));
}

#[test]
fn test_arp_request_reply() {
    let _stack = setup();

    // Who has 10.0.0.2?
    let mut arp = vec![0u8; 28];
    arp[0..2].copy_from_slice(&1u16.to_be_bytes());
    arp[2..4].copy_from_slice(&ETH_TYPE_IPV4.to_be_bytes());
    arp[4] = 6;
    arp[5] = 4;
    arp[6..8].copy_from_slice(&1u16.to_be_bytes()); // request
    arp[8..14].copy_from_slice(&PEER_MAC);
    arp[14..18].copy_from_slice(&PEER_IP);
    arp[24..28].copy_from_slice(&OUR_IP);
    inject(eth_frame(ETH_TYPE_ARP, &arp));

    let frames = drain();
    assert_eq!(frames.len(), 1);
    let reply = &frames[0];
    assert_eq!(&reply[0..6], &PEER_MAC);
    assert_eq!(&reply[6..12], &OUR_MAC);
    assert_eq!(util::get_be16(&reply[12..14]), ETH_TYPE_ARP);

    let body = &reply[ETH_HEADER_LEN..];
    assert_eq!(util::get_be16(&body[6..8]), 2); // reply
    assert_eq!(&body[8..14], &OUR_MAC);
    assert_eq!(&body[14..18], &OUR_IP);
    assert_eq!(&body[18..24], &PEER_MAC);
    assert_eq!(&body[24..28], &PEER_IP);
}

#[test]
fn test_ping() {
    let _stack = setup();
    announce_peer();

    let mut echo = vec![0u8; 16];
    echo[0] = 8; // echo request
    echo[4..8].copy_from_slice(&[0xab, 0xcd, 0x00, 0x07]); // id/seq
    echo[8..16].copy_from_slice(b"pingpong");
    let checksum = util::checksum(&echo);
    util::set_be16(&mut echo[2..4], checksum);

    inject(eth_frame(ETH_TYPE_IPV4, &ipv4_packet(PROTO_ICMP, &echo)));

    let frames = drain();
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert_eq!(&frame[0..6], &PEER_MAC);

    let ip_header = &frame[ETH_HEADER_LEN..];
    assert_eq!(ip_header[9], PROTO_ICMP);
    assert_eq!(&ip_header[16..20], &PEER_IP);
    assert_eq!(util::checksum(&ip_header[..IPV4_HEADER_LEN]), 0);

    let reply = &ip_header[IPV4_HEADER_LEN..];
    assert_eq!(reply[0], 0); // echo reply
    assert_eq!(util::checksum(reply), 0);
    assert_eq!(&reply[4..8], &[0xab, 0xcd, 0x00, 0x07]);
    assert_eq!(&reply[8..16], b"pingpong");
}

#[test]
fn test_udp_round_trip() {
    let _stack = setup();
    announce_peer();

    let received = Arc::new(Mutex::new(Vec::new()));
    let received_clone = Arc::clone(&received);
    udp::udp_listen(5353, move |payload, source_ip, source_port| {
        received_clone
            .lock()
            .unwrap()
            .push((payload.to_vec(), source_ip, source_port));
    })
    .unwrap();

    // Inbound datagram lands in the listener.
    let mut datagram = vec![0u8; 8];
    datagram[0..2].copy_from_slice(&9000u16.to_be_bytes());
    datagram[2..4].copy_from_slice(&5353u16.to_be_bytes());
    datagram[4..6].copy_from_slice(&(8u16 + 5).to_be_bytes());
    datagram.extend_from_slice(b"query");
    inject(eth_frame(ETH_TYPE_IPV4, &ipv4_packet(PROTO_UDP, &datagram)));

    {
        let got = received.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, b"query");
        assert_eq!(got[0].1, util::IPv4Addr::new_from(&PEER_IP));
        assert_eq!(got[0].2, 9000);
    }

    // Outbound reply through a connected handle.
    let socket = udp::udp_open(util::IPv4Addr::new_from(&PEER_IP), 5353, 9000).unwrap();
    udp::udp_send(&socket, b"answer").unwrap();

    let frames = drain();
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert_eq!(&frame[0..6], &PEER_MAC);
    let ip_header = &frame[ETH_HEADER_LEN..];
    assert_eq!(ip_header[9], PROTO_UDP);
    let udp_header = &ip_header[IPV4_HEADER_LEN..];
    assert_eq!(util::get_be16(&udp_header[0..2]), 5353);
    assert_eq!(util::get_be16(&udp_header[2..4]), 9000);
    assert_eq!(&udp_header[8..], b"answer");

    udp::udp_unlisten(5353);
}

#[test]
fn test_tcp_session() {
    let _stack = setup();
    announce_peer();

    let listener = tcp::tcp_open_listen(8080).unwrap();

    // Handshake.
    inject(eth_frame(
        ETH_TYPE_IPV4,
        &ipv4_packet(
            PROTO_TCP,
            &tcp_segment(52000, 8080, 5000, 0, FLAG_SYN, 20000, b""),
        ),
    ));

    let segments = tcp_frames(&drain());
    assert_eq!(segments.len(), 1);
    let syn_ack = &segments[0];
    assert_eq!(syn_ack.flags, FLAG_SYN | FLAG_ACK);
    assert_eq!(syn_ack.source_port, 8080);
    assert_eq!(syn_ack.dest_port, 52000);
    assert_eq!(syn_ack.ack_num, 5001);
    let local_seq = syn_ack.seq_num.wrapping_add(1);

    inject(eth_frame(
        ETH_TYPE_IPV4,
        &ipv4_packet(
            PROTO_TCP,
            &tcp_segment(52000, 8080, 5001, local_seq, FLAG_ACK, 20000, b""),
        ),
    ));

    let socket = tcp::tcp_accept_timeout(&listener, Duration::from_millis(500)).unwrap();

    // Client sends a request; the application reads it.
    inject(eth_frame(
        ETH_TYPE_IPV4,
        &ipv4_packet(
            PROTO_TCP,
            &tcp_segment(
                52000,
                8080,
                5001,
                local_seq,
                FLAG_ACK | FLAG_PSH,
                20000,
                b"GET / HTTP/1.0\r\n\r\n",
            ),
        ),
    ));

    let mut request = [0u8; 128];
    let got = tcp::tcp_read(&socket, &mut request).unwrap();
    assert_eq!(&request[..got], b"GET / HTTP/1.0\r\n\r\n");

    // The application answers; the stack segments and sequences it.
    drain();
    let response = b"HTTP/1.0 200 OK\r\n\r\nhello";
    assert_eq!(tcp::tcp_write(&socket, response).unwrap(), response.len());

    let segments = tcp_frames(&drain());
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].flags, FLAG_ACK | FLAG_PSH);
    assert_eq!(segments[0].seq_num, local_seq);
    assert_eq!(segments[0].payload, response);
    assert_eq!(segments[0].ack_num, 5001 + 18);

    // Client acks the response data.
    inject(eth_frame(
        ETH_TYPE_IPV4,
        &ipv4_packet(
            PROTO_TCP,
            &tcp_segment(
                52000,
                8080,
                5001 + 18,
                local_seq.wrapping_add(response.len() as u32),
                FLAG_ACK,
                20000,
                b"",
            ),
        ),
    ));

    // Orderly shutdown from our side.
    tcp::tcp_close(&socket).unwrap();
    let segments = tcp_frames(&drain());
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].flags, FLAG_FIN | FLAG_ACK);
    let fin_seq = segments[0].seq_num;

    // Peer acks our FIN and sends its own; we ack it back.
    inject(eth_frame(
        ETH_TYPE_IPV4,
        &ipv4_packet(
            PROTO_TCP,
            &tcp_segment(
                52000,
                8080,
                5001 + 18,
                fin_seq.wrapping_add(1),
                FLAG_ACK | FLAG_FIN,
                20000,
                b"",
            ),
        ),
    ));

    let segments = tcp_frames(&drain());
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].flags, FLAG_ACK);
    assert_eq!(segments[0].ack_num, 5001 + 18 + 1);

    // The connection is gone as far as the application is concerned.
    let mut scratch = [0u8; 8];
    assert!(tcp::tcp_read(&socket, &mut scratch).is_err());

    tcp::tcp_close(&listener).unwrap();
}
