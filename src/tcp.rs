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

// Transmission Control Protocol, as described in RFC 9293. Passive open
// only: sockets are created by tcp_open_listen and by inbound connections
// against a listener. All window arithmetic uses the wrapping comparisons
// from util; plain integer comparison of sequence numbers is wrong once
// the counter wraps.

use crate::buf;
use crate::cbuf;
use crate::ip;
use crate::netif;
use crate::timer;
use crate::util;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Display;
use std::sync::{Arc, Condvar, LazyLock, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const DEFAULT_MSS: usize = 1460;
const DEFAULT_RX_WINDOW_SIZE: usize = 8192;
const DEFAULT_TX_BUFFER_SIZE: usize = 8192;

const RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(50);
const DELAYED_ACK_TIMEOUT: Duration = Duration::from_millis(50);
const TIME_WAIT_TIMEOUT: Duration = Duration::from_millis(60000); // 1 minute

const TCP_HEADER_LEN: usize = 20;

// Per-segment trace output; state transitions are always logged.
const TCP_TRACE: bool = false;

const FLAG_FIN: u8 = 1;
const FLAG_SYN: u8 = 2;
const FLAG_RST: u8 = 4;
const FLAG_PSH: u8 = 8;
const FLAG_ACK: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpState {
    Closed,
    Listen,
    // Declared for completeness; nothing creates this state because
    // outbound connections are not supported.
    #[allow(dead_code)]
    SynSent,
    SynReceived,
    Established,
    CloseWait,
    LastAck,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
}

pub type SocketReference = Arc<TcpSocket>;

/// The mutex guards every field; the condition variables signal the three
/// places a caller can block (data readable, transmit space available, and
/// a connection waiting to be accepted).
pub struct TcpSocket {
    state: Mutex<TcpSocketState>,
    rx_cond: Condvar,
    tx_cond: Condvar,
    accept_cond: Condvar,
}

struct TcpSocketState {
    state: TcpState,
    local_ip: util::IPv4Addr,
    remote_ip: util::IPv4Addr,
    local_port: u16,
    remote_port: u16,
    mss: usize,

    // Receive window:
    //
    //   rx_win_low   next in-order sequence we expect
    //   rx_win_high  right edge we have advertised to the peer
    //
    rx_win_size: u32,
    rx_win_low: u32,
    rx_win_high: u32,
    rx_buffer: cbuf::CBuf,
    rx_full_mss_count: u32,
    ack_delay_timer: timer::NetTimer,

    // Transmit window:
    //
    //   tx_win_low      lowest unacknowledged sequence
    //   tx_win_high     tx_win_low + the peer's advertised window
    //   tx_highest_seq  highest sequence we have put on the wire
    //
    // Unacknowledged data always sits at the front of tx_buffer, so
    // tx_highest_seq - tx_win_low bytes of it are in flight and the rest
    // is waiting to be sent.
    tx_win_low: u32,
    tx_win_high: u32,
    tx_highest_seq: u32,
    tx_buffer: Vec<u8>,
    tx_buffer_offset: usize,
    retransmit_timer: timer::NetTimer,

    time_wait_timer: timer::NetTimer,

    // Listening sockets: one connection can wait here until accepted.
    accepted: Option<SocketReference>,
}

/// Established sockets are keyed by (remote ip, remote port, local port);
/// listeners use the wildcard remote.
type SocketKey = (util::IPv4Addr, u16, u16);

static SOCKET_TABLE: LazyLock<Mutex<HashMap<SocketKey, SocketReference>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn listen_key(local_port: u16) -> SocketKey {
    (util::IPv4Addr::new(), 0, local_port)
}

fn lookup_socket(
    remote_ip: util::IPv4Addr,
    remote_port: u16,
    local_port: u16,
) -> Option<SocketReference> {
    let table = SOCKET_TABLE.lock().unwrap();
    table
        .get(&(remote_ip, remote_port, local_port))
        .or_else(|| table.get(&listen_key(local_port)))
        .cloned()
}

fn remove_from_table(key: &SocketKey) -> bool {
    SOCKET_TABLE.lock().unwrap().remove(key).is_some()
}

impl TcpSocket {
    fn lock(&self) -> MutexGuard<TcpSocketState> {
        self.state.lock().unwrap()
    }
}

fn create_socket(alloc_buffers: bool) -> SocketReference {
    let initial_sequence = rand::random::<u32>();
    Arc::new(TcpSocket {
        state: Mutex::new(TcpSocketState {
            state: TcpState::Closed,
            local_ip: util::IPv4Addr::new(),
            remote_ip: util::IPv4Addr::new(),
            local_port: 0,
            remote_port: 0,
            mss: DEFAULT_MSS,
            rx_win_size: DEFAULT_RX_WINDOW_SIZE as u32,
            rx_win_low: 0,
            rx_win_high: 0,
            rx_buffer: if alloc_buffers {
                cbuf::CBuf::with_capacity(DEFAULT_RX_WINDOW_SIZE)
            } else {
                cbuf::CBuf::new()
            },
            rx_full_mss_count: 0,
            ack_delay_timer: timer::NetTimer::new(),
            tx_win_low: initial_sequence,
            tx_win_high: initial_sequence,
            tx_highest_seq: initial_sequence,
            tx_buffer: if alloc_buffers {
                vec![0; DEFAULT_TX_BUFFER_SIZE]
            } else {
                Vec::new()
            },
            tx_buffer_offset: 0,
            retransmit_timer: timer::NetTimer::new(),
            time_wait_timer: timer::NetTimer::new(),
            accepted: None,
        }),
        rx_cond: Condvar::new(),
        tx_cond: Condvar::new(),
        accept_cond: Condvar::new(),
    })
}

fn flags_to_str(flags: u8) -> String {
    let mut result = String::new();
    if flags & FLAG_FIN != 0 {
        result.push('F');
    }

    if flags & FLAG_SYN != 0 {
        result.push('S');
    }

    if flags & FLAG_RST != 0 {
        result.push('R');
    }

    if flags & FLAG_PSH != 0 {
        result.push('P');
    }

    if flags & FLAG_ACK != 0 {
        result.push('A');
    }

    result
}

impl Display for TcpSocketState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "tcp {}:{} {}:{}",
            self.local_ip, self.local_port, self.remote_ip, self.remote_port
        )
    }
}

impl TcpSocketState {
    fn set_state(&mut self, new_state: TcpState) {
        println!("{}: state {:?} -> {:?}", self, self.state, new_state);
        self.state = new_state;
    }

    fn socket_key(&self) -> SocketKey {
        (self.remote_ip, self.remote_port, self.local_port)
    }
}

struct TcpSendParams<'a> {
    source_port: u16,
    dest_ip: util::IPv4Addr,
    dest_port: u16,
    seq_num: u32,
    ack_num: u32,
    flags: u8,
    window: u16,
    options: &'a [u8],
}

//
//    0               1               2               3
//    +-------------------------------+-------------------------------+
//  0 |         Source Port           |          Dest Port            |
//    +-------------------------------+-------------------------------+
//  4 |                        Sequence Number                        |
//    +-------------------------------+-------------------------------+
//  8 |                           Ack Number                          |
//    +-------+-------+---------------+-------------------------------+
// 12 |  Offs | Rsvd  |    UAPRSF     |            Window             |
//    +-------+-------+---------------+-------------------------------+
// 16 |          Checksum             |        Urgent Pointer         |
//    +-------------------------------+-------------------------------+
// 20 |                           [Options]                           |
//    +---------------------------------------------------------------+
//

fn tcp_output(mut packet: buf::PktBuf, params: &TcpSendParams) {
    assert!(params.options.len() % 4 == 0); // Must be pre-padded

    let header_length = TCP_HEADER_LEN + params.options.len();
    packet.alloc_header(header_length);
    let packet_length = packet.len();
    {
        let header = packet.header_mut();
        util::set_be16(&mut header[0..2], params.source_port);
        util::set_be16(&mut header[2..4], params.dest_port);
        util::set_be32(&mut header[4..8], params.seq_num);
        util::set_be32(&mut header[8..12], params.ack_num);
        header[12] = ((header_length / 4) << 4) as u8; // Data offset
        header[13] = params.flags;
        util::set_be16(&mut header[14..16], params.window);
        if !params.options.is_empty() {
            header[20..20 + params.options.len()].copy_from_slice(params.options);
        }
    }

    let pseudo_sum = util::pseudo_header_sum(
        netif::get_ipaddr(),
        params.dest_ip,
        ip::PROTO_TCP,
        packet_length,
    );

    let checksum = util::ones_sum16(pseudo_sum, packet.header()) ^ 0xffff;
    let header = packet.header_mut();
    util::set_be16(&mut header[16..18], checksum);

    if TCP_TRACE {
        println!(
            "tcp_output: port {} -> {}:{} flags {} seq {} ack {} window {}",
            params.source_port,
            params.dest_ip,
            params.dest_port,
            flags_to_str(params.flags),
            params.seq_num,
            params.ack_num,
            params.window,
        );
    }

    // An unreachable peer looks the same as a lost segment; the retransmit
    // path deals with it.
    let _ = ip::ip_output(packet, ip::PROTO_TCP, params.dest_ip);
}

/// Answer a segment that doesn't belong to any connection.
fn send_reset(
    dest_ip: util::IPv4Addr,
    dest_port: u16,
    source_port: u16,
    seq_num: u32,
) {
    tcp_output(
        buf::PktBuf::new(),
        &TcpSendParams {
            source_port,
            dest_ip,
            dest_port,
            seq_num,
            ack_num: 0,
            flags: FLAG_RST,
            window: 0,
            options: &[],
        },
    );
}

/// Transmit one segment for this socket. The advertised window is derived
/// from the free space in the receive buffer; the right edge never moves
/// backwards even if the buffer has filled since it was advertised.
fn send_segment(
    guard: &mut MutexGuard<TcpSocketState>,
    packet: buf::PktBuf,
    flags: u8,
    options: &[u8],
    seq_num: u32,
) {
    let new_win_high = guard
        .rx_win_low
        .wrapping_add(guard.rx_win_size)
        .wrapping_sub(guard.rx_buffer.space_used() as u32)
        .wrapping_sub(1);

    if util::seq_gte(new_win_high, guard.rx_win_high) {
        guard.rx_win_high = new_win_high;
    }

    let window = guard.rx_win_high.wrapping_sub(guard.rx_win_low) as u16;

    // This segment carries any acknowledgement we owe.
    if flags & FLAG_ACK != 0 {
        timer::cancel(&guard.ack_delay_timer);
    }

    let params = TcpSendParams {
        source_port: guard.local_port,
        dest_ip: guard.remote_ip,
        dest_port: guard.remote_port,
        seq_num,
        ack_num: if flags & FLAG_ACK != 0 {
            guard.rx_win_low
        } else {
            0
        },
        flags,
        window,
        options,
    };

    tcp_output(packet, &params);
}

fn send_ack(guard: &mut MutexGuard<TcpSocketState>) {
    if !matches!(
        guard.state,
        TcpState::Established | TcpState::CloseWait | TcpState::FinWait2
    ) {
        return;
    }

    let seq = guard.tx_win_low;
    send_segment(guard, buf::PktBuf::new(), FLAG_ACK, &[], seq);
}

/// Copy an in-order segment into the receive buffer and decide how to
/// acknowledge it. A segment only counts if it intersects the bottom of
/// the window; anything else provokes a duplicate ack of the current
/// position so the peer resynchronizes.
fn handle_data(
    guard: &mut MutexGuard<TcpSocketState>,
    socket_ref: &SocketReference,
    data: &[u8],
    seq_num: u32,
) {
    let sequence_top = seq_num.wrapping_add(data.len() as u32 - 1);
    if util::seq_lte(seq_num, guard.rx_win_low) && util::seq_gte(sequence_top, guard.rx_win_low) {
        // Skip whatever prefix we already have (a retransmission can
        // straddle the window edge).
        let offset = guard.rx_win_low.wrapping_sub(seq_num) as usize;
        let window_space = guard.rx_win_high.wrapping_sub(guard.rx_win_low) as usize;
        let copy_len = std::cmp::min(window_space, data.len() - offset);

        let wrote = guard.rx_buffer.write(&data[offset..offset + copy_len]);
        guard.rx_win_low = guard.rx_win_low.wrapping_add(wrote as u32);
        socket_ref.rx_cond.notify_all();

        if wrote >= guard.mss {
            guard.rx_full_mss_count += 1;
        } else {
            guard.rx_full_mss_count = 0;
        }

        // Ack immediately after two full segments in a row, or once the
        // used part of the advertised window passes the halfway point.
        // Otherwise wait briefly for more data to coalesce with.
        let consumed = guard
            .rx_win_low
            .wrapping_add(guard.rx_win_size)
            .wrapping_sub(guard.rx_win_high) as i32;
        if guard.rx_full_mss_count >= 2 || consumed > (guard.rx_win_size / 2) as i32 {
            guard.rx_full_mss_count = 0;
            send_ack(guard);
        } else {
            let socket_clone = socket_ref.clone();
            timer::arm(&guard.ack_delay_timer, DELAYED_ACK_TIMEOUT, move || {
                handle_delayed_ack_timeout(socket_clone);
            });
        }
    } else {
        send_ack(guard);
    }
}

/// The peer acknowledged through `ack_num`: drop the acked prefix of the
/// transmit buffer, slide the window, and flush anything that now fits.
fn handle_ack(
    guard: &mut MutexGuard<TcpSocketState>,
    socket_ref: &SocketReference,
    ack_num: u32,
    win_size: u16,
) {
    if util::seq_lte(ack_num, guard.tx_win_low) {
        // Already acknowledged.
        return;
    }

    if util::seq_gt(ack_num, guard.tx_highest_seq) {
        // Acknowledges data we never sent.
        return;
    }

    let acked_len = ack_num.wrapping_sub(guard.tx_win_low) as usize;
    assert!(
        acked_len <= guard.tx_buffer_offset,
        "{}: acked {} bytes but only {} are buffered",
        guard,
        acked_len,
        guard.tx_buffer_offset
    );

    let tail = guard.tx_buffer_offset;
    guard.tx_buffer.copy_within(acked_len..tail, 0);
    guard.tx_buffer_offset -= acked_len;
    guard.tx_win_low = ack_num;
    guard.tx_win_high = ack_num.wrapping_add(win_size as u32);

    if guard.tx_win_low == guard.tx_highest_seq {
        timer::cancel(&guard.retransmit_timer);
    } else {
        let socket_clone = socket_ref.clone();
        timer::arm(&guard.retransmit_timer, RETRANSMIT_TIMEOUT, move || {
            handle_retransmit_timeout(socket_clone);
        });
    }

    // Transmit buffer space opened up.
    socket_ref.tx_cond.notify_all();
    write_pending_data(guard, socket_ref);
}

/// Send buffered bytes that haven't been transmitted yet, as far as the
/// peer's window allows, one mss-sized segment at a time.
fn write_pending_data(
    guard: &mut MutexGuard<TcpSocketState>,
    socket_ref: &SocketReference,
) -> usize {
    let outstanding = guard.tx_highest_seq.wrapping_sub(guard.tx_win_low) as usize;
    assert!(
        outstanding <= guard.tx_buffer_offset,
        "{}: {} bytes in flight but only {} buffered",
        guard,
        outstanding,
        guard.tx_buffer_offset
    );

    let window_open = guard.tx_win_high.wrapping_sub(guard.tx_highest_seq) as i32;
    let pending = std::cmp::min(
        guard.tx_buffer_offset - outstanding,
        std::cmp::max(window_open, 0) as usize,
    );

    let mut offset = 0;
    while offset < pending {
        let to_send = std::cmp::min(guard.mss, pending - offset);
        let mut packet = buf::PktBuf::new();
        packet
            .append_from_slice(&guard.tx_buffer[outstanding + offset..outstanding + offset + to_send]);

        let seq = guard.tx_highest_seq;
        send_segment(guard, packet, FLAG_ACK | FLAG_PSH, &[], seq);
        guard.tx_highest_seq = guard.tx_highest_seq.wrapping_add(to_send as u32);
        offset += to_send;
    }

    if offset > 0 {
        let socket_clone = socket_ref.clone();
        timer::arm(&guard.retransmit_timer, RETRANSMIT_TIMEOUT, move || {
            handle_retransmit_timeout(socket_clone);
        });
    }

    offset
}

/// Resend one segment from the bottom of the unacknowledged window.
fn retransmit(guard: &mut MutexGuard<TcpSocketState>) -> usize {
    if !matches!(guard.state, TcpState::Established | TcpState::CloseWait) {
        return 0;
    }

    let outstanding = guard.tx_highest_seq.wrapping_sub(guard.tx_win_low) as usize;
    if outstanding == 0 {
        return 0;
    }

    let to_send = std::cmp::min(guard.mss, outstanding);
    let mut packet = buf::PktBuf::new();
    packet.append_from_slice(&guard.tx_buffer[0..to_send]);

    util::STATS.packets_retransmitted.inc();
    println!("{}: retransmitting sequence {}", guard, guard.tx_win_low);

    let seq = guard.tx_win_low;
    send_segment(guard, packet, FLAG_ACK | FLAG_PSH, &[], seq);

    to_send
}

fn handle_retransmit_timeout(socket_ref: SocketReference) {
    let mut guard = socket_ref.lock();
    if retransmit(&mut guard) == 0 {
        return;
    }

    let socket_clone = socket_ref.clone();
    timer::arm(&guard.retransmit_timer, RETRANSMIT_TIMEOUT, move || {
        handle_retransmit_timeout(socket_clone);
    });
}

fn handle_delayed_ack_timeout(socket_ref: SocketReference) {
    let mut guard = socket_ref.lock();
    send_ack(&mut guard);
}

fn handle_time_wait_timeout(socket_ref: SocketReference) {
    let mut guard = socket_ref.lock();
    if guard.state != TcpState::Closed {
        guard.set_state(TcpState::Closed);
    }

    let key = guard.socket_key();
    drop(guard);
    remove_from_table(&key);
}

/// The peer tore the connection down (or it finished tearing down). Wake
/// everything that might be blocked on it.
fn remote_close(guard: &mut MutexGuard<TcpSocketState>, socket_ref: &SocketReference) {
    if guard.state == TcpState::Closed {
        return;
    }

    guard.set_state(TcpState::Closed);
    timer::cancel(&guard.retransmit_timer);
    timer::cancel(&guard.ack_delay_timer);

    socket_ref.rx_cond.notify_all();
    socket_ref.tx_cond.notify_all();
    socket_ref.accept_cond.notify_all();
}

struct TcpHeaderOptions {
    max_segment_size: usize,
}

fn parse_options(option_bytes: &[u8]) -> TcpHeaderOptions {
    let mut options = TcpHeaderOptions {
        max_segment_size: 0,
    };

    let mut offset = 0;
    while offset < option_bytes.len() {
        let option_type = option_bytes[offset];
        if option_type == 0 {
            break;
        }

        if option_type == 1 {
            // No-op padding
            offset += 1;
            continue;
        }

        if offset + 1 >= option_bytes.len() {
            break;
        }

        let option_length = option_bytes[offset + 1] as usize;
        if option_length < 2 || offset + option_length > option_bytes.len() {
            break;
        }

        if option_type == 2 && option_length == 4 {
            options.max_segment_size =
                util::get_be16(&option_bytes[offset + 2..offset + 4]) as usize;
        }

        offset += option_length;
    }

    options
}

/// A SYN arrived for a listening socket: spin up a connection socket in
/// the reply-sent state and park it in the listener's accept slot.
fn handle_new_connection(
    guard: &mut MutexGuard<TcpSocketState>,
    listen_socket_ref: &SocketReference,
    source_ip: util::IPv4Addr,
    dest_ip: util::IPv4Addr,
    source_port: u16,
    seq_num: u32,
    remote_window_size: u16,
    peer_mss: usize,
) {
    // One pending connection at a time; the peer will retry the SYN if it
    // arrived while the slot was full.
    if guard.accepted.is_some() {
        return;
    }

    let new_socket_ref = create_socket(true);
    {
        let mut new_guard = new_socket_ref.lock();
        new_guard.local_ip = dest_ip;
        new_guard.local_port = guard.local_port;
        new_guard.remote_ip = source_ip;
        new_guard.remote_port = source_port;
        if peer_mss != 0 {
            new_guard.mss = std::cmp::min(new_guard.mss, peer_mss);
        }

        new_guard.set_state(TcpState::SynReceived);

        // Their SYN consumed a sequence number.
        new_guard.rx_win_low = seq_num.wrapping_add(1);
        new_guard.rx_win_high = new_guard
            .rx_win_low
            .wrapping_add(new_guard.rx_win_size)
            .wrapping_sub(1);
        new_guard.tx_win_high = new_guard
            .tx_win_low
            .wrapping_add(remote_window_size as u32);

        SOCKET_TABLE
            .lock()
            .unwrap()
            .insert(new_guard.socket_key(), new_socket_ref.clone());

        let mut mss_option = [2u8, 4, 0, 0];
        util::set_be16(&mut mss_option[2..4], DEFAULT_MSS as u16);
        let seq = new_guard.tx_win_low;
        send_segment(
            &mut new_guard,
            buf::PktBuf::new(),
            FLAG_SYN | FLAG_ACK,
            &mss_option,
            seq,
        );

        // As does our SYN.
        new_guard.tx_win_low = new_guard.tx_win_low.wrapping_add(1);
    }

    guard.accepted = Some(new_socket_ref);
    listen_socket_ref.accept_cond.notify_all();
}

/// Inbound segment entry point, called from the IPv4 dispatcher.
pub fn tcp_input(mut packet: buf::PktBuf, source_ip: util::IPv4Addr, dest_ip: util::IPv4Addr) {
    if packet.len() < TCP_HEADER_LEN {
        util::STATS.packets_dropped.inc();
        return;
    }

    let pseudo_sum = util::pseudo_header_sum(source_ip, dest_ip, ip::PROTO_TCP, packet.len());
    if util::ones_sum16(pseudo_sum, packet.header()) ^ 0xffff != 0 {
        println!("TCP: bad checksum");
        util::STATS.packets_dropped.inc();
        return;
    }

    let header = packet.header();
    let source_port = util::get_be16(&header[0..2]);
    let dest_port = util::get_be16(&header[2..4]);
    let seq_num = util::get_be32(&header[4..8]);
    let ack_num = util::get_be32(&header[8..12]);
    let header_length = ((header[12] >> 4) * 4) as usize;
    let flags = header[13] & 0x3f;
    let remote_window_size = util::get_be16(&header[14..16]);

    if header_length < TCP_HEADER_LEN || header_length > packet.len() {
        util::STATS.packets_dropped.inc();
        return;
    }

    if TCP_TRACE {
        println!(
            "tcp_input: {}:{} -> port {} flags {} seq {} ack {} window {} ({} bytes of data)",
            source_ip,
            source_port,
            dest_port,
            flags_to_str(flags),
            seq_num,
            ack_num,
            remote_window_size,
            packet.len() - header_length,
        );
    }

    let options = parse_options(&header[TCP_HEADER_LEN..header_length]);
    packet.trim_head(header_length);

    let data_len = packet.len();

    // The sequence number of the last payload byte; used to decide whether
    // a FIN can be honored yet.
    let highest_sequence = seq_num.wrapping_add(if data_len > 0 { data_len as u32 - 1 } else { 0 });

    let socket_ref = match lookup_socket(source_ip, source_port, dest_port) {
        Some(socket_ref) => socket_ref,
        None => {
            // Not a connection we know about. Never reset a reset.
            if flags & FLAG_RST == 0 {
                send_reset(source_ip, source_port, dest_port, ack_num);
            }
            return;
        }
    };

    let mut guard = socket_ref.lock();

    if flags & FLAG_RST != 0 {
        if !matches!(guard.state, TcpState::Closed | TcpState::Listen) {
            println!("{}: connection reset by peer", guard);
            remote_close(&mut guard, &socket_ref);
        }
        return;
    }

    match guard.state {
        TcpState::Closed => {
            drop(guard);
            send_reset(source_ip, source_port, dest_port, ack_num);
        }

        TcpState::Listen => {
            if flags & FLAG_SYN == 0 {
                drop(guard);
                send_reset(source_ip, source_port, dest_port, ack_num);
                return;
            }

            handle_new_connection(
                &mut guard,
                &socket_ref,
                source_ip,
                dest_ip,
                source_port,
                seq_num,
                remote_window_size,
                options.max_segment_size,
            );
        }

        TcpState::SynReceived => {
            if flags & FLAG_SYN != 0 {
                // Retransmitted SYN; our SYN+ACK should cover it, but a
                // mismatched one gets a reset.
                drop(guard);
                send_reset(source_ip, source_port, dest_port, ack_num);
                return;
            }

            if flags & FLAG_ACK == 0 || ack_num != guard.tx_win_low {
                drop(guard);
                send_reset(source_ip, source_port, dest_port, ack_num);
                return;
            }

            guard.tx_win_high = guard.tx_win_low.wrapping_add(remote_window_size as u32);
            guard.tx_highest_seq = guard.tx_win_low;
            guard.set_state(TcpState::Established);
        }

        TcpState::SynSent => {
            panic!("{}: active open is not implemented", guard);
        }

        TcpState::Established => {
            if flags & FLAG_ACK != 0 {
                handle_ack(&mut guard, &socket_ref, ack_num, remote_window_size);
            }

            if data_len > 0 {
                handle_data(&mut guard, &socket_ref, packet.header(), seq_num);
            }

            if flags & FLAG_FIN != 0 && util::seq_gte(guard.rx_win_low, highest_sequence) {
                // Orderly shutdown from the peer with nothing outstanding.
                // The FIN consumes a sequence number.
                guard.rx_win_low = guard.rx_win_low.wrapping_add(1);
                send_ack(&mut guard);
                guard.set_state(TcpState::CloseWait);

                // Readers need to notice the end of the stream.
                socket_ref.rx_cond.notify_all();
            }
        }

        TcpState::CloseWait => {
            if flags & FLAG_ACK != 0 {
                handle_ack(&mut guard, &socket_ref, ack_num, remote_window_size);
            }

            if flags & FLAG_FIN != 0 {
                // They missed our ack; tell them again.
                send_ack(&mut guard);
            }
        }

        TcpState::LastAck => {
            if flags & FLAG_ACK != 0 {
                // That acknowledges our FIN. tcp_close already ran, so the
                // socket comes off the table here.
                remote_close(&mut guard, &socket_ref);
                let key = guard.socket_key();
                drop(guard);
                remove_from_table(&key);
            }
        }

        TcpState::FinWait1 => {
            if flags & FLAG_ACK != 0 {
                guard.set_state(TcpState::FinWait2);
                if flags & FLAG_FIN != 0 {
                    handle_fin_wait_2_fin(&mut guard, &socket_ref);
                }
            } else if flags & FLAG_FIN != 0 {
                // Simultaneous close: they sent their FIN without acking
                // ours.
                guard.rx_win_low = guard.rx_win_low.wrapping_add(1);
                send_ack(&mut guard);
                guard.set_state(TcpState::Closing);
            }
        }

        TcpState::FinWait2 => {
            if flags & FLAG_FIN != 0 {
                handle_fin_wait_2_fin(&mut guard, &socket_ref);
            }
        }

        TcpState::Closing => {
            if flags & FLAG_ACK != 0 {
                guard.set_state(TcpState::TimeWait);
                let socket_clone = socket_ref.clone();
                timer::arm(&guard.time_wait_timer, TIME_WAIT_TIMEOUT, move || {
                    handle_time_wait_timeout(socket_clone);
                });
            }
        }

        TcpState::TimeWait => {
            // Sink for stray segments.
        }
    }
}

fn handle_fin_wait_2_fin(guard: &mut MutexGuard<TcpSocketState>, socket_ref: &SocketReference) {
    guard.rx_win_low = guard.rx_win_low.wrapping_add(1);
    send_ack(guard);
    guard.set_state(TcpState::TimeWait);

    let socket_clone = socket_ref.clone();
    timer::arm(&guard.time_wait_timer, TIME_WAIT_TIMEOUT, move || {
        handle_time_wait_timeout(socket_clone);
    });
}

//
// User API
//

/// Active open is not part of this stack; only inbound connections are
/// supported.
pub fn tcp_connect(
    _remote_ip: util::IPv4Addr,
    _remote_port: u16,
) -> Result<SocketReference, util::NetError> {
    unimplemented!("tcp_connect: active open is not implemented");
}

pub fn tcp_open_listen(port: u16) -> Result<SocketReference, util::NetError> {
    let mut table = SOCKET_TABLE.lock().unwrap();
    if table.contains_key(&listen_key(port)) {
        return Err(util::NetError::PortInUse);
    }

    let socket_ref = create_socket(false);
    {
        let mut guard = socket_ref.lock();
        guard.local_port = port;
        guard.set_state(TcpState::Listen);
    }

    table.insert(listen_key(port), socket_ref.clone());
    Ok(socket_ref)
}

/// Block until an inbound connection is waiting, then take it.
pub fn tcp_accept(listen_socket: &SocketReference) -> Result<SocketReference, util::NetError> {
    let mut guard = listen_socket.lock();
    loop {
        if let Some(accepted) = guard.accepted.take() {
            return Ok(accepted);
        }

        if guard.state != TcpState::Listen {
            return Err(util::NetError::ChannelClosed);
        }

        guard = listen_socket.accept_cond.wait(guard).unwrap();
    }
}

/// tcp_accept with a bounded wait.
pub fn tcp_accept_timeout(
    listen_socket: &SocketReference,
    timeout: Duration,
) -> Result<SocketReference, util::NetError> {
    let deadline = Instant::now() + timeout;
    let mut guard = listen_socket.lock();
    loop {
        if let Some(accepted) = guard.accepted.take() {
            return Ok(accepted);
        }

        if guard.state != TcpState::Listen {
            return Err(util::NetError::ChannelClosed);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(util::NetError::TimedOut);
        }

        guard = listen_socket
            .accept_cond
            .wait_timeout(guard, deadline - now)
            .unwrap()
            .0;
    }
}

/// Read whatever is buffered, blocking if nothing is. Buffered data is
/// still returned after the peer closes; only a drained, closed
/// connection reports the end of the stream.
pub fn tcp_read(socket_ref: &SocketReference, data: &mut [u8]) -> Result<usize, util::NetError> {
    if data.is_empty() {
        return Ok(0);
    }

    let mut guard = socket_ref.lock();
    loop {
        let got = guard.rx_buffer.read(data);
        if got > 0 {
            // If draining reopened a window that had collapsed to less
            // than a segment, tell the peer without waiting to be asked.
            let advertised = guard.rx_win_high.wrapping_sub(guard.rx_win_low);
            if guard.rx_buffer.space_avail() >= guard.mss && advertised < guard.mss as u32 {
                send_ack(&mut guard);
            }

            return Ok(got);
        }

        if guard.state != TcpState::Established {
            return Err(util::NetError::ChannelClosed);
        }

        guard = socket_ref.rx_cond.wait(guard).unwrap();
    }
}

/// Queue data for transmit, blocking per chunk while the buffer is full.
/// Everything that fits is pushed to the wire immediately, as far as the
/// peer's window allows.
pub fn tcp_write(socket_ref: &SocketReference, data: &[u8]) -> Result<usize, util::NetError> {
    let mut guard = socket_ref.lock();

    let mut offset = 0;
    while offset < data.len() {
        if !matches!(guard.state, TcpState::Established | TcpState::CloseWait) {
            return Err(util::NetError::ChannelClosed);
        }

        let space = guard.tx_buffer.len() - guard.tx_buffer_offset;
        let to_copy = std::cmp::min(space, data.len() - offset);
        if to_copy == 0 {
            guard = socket_ref.tx_cond.wait(guard).unwrap();
            continue;
        }

        let buffer_offset = guard.tx_buffer_offset;
        guard.tx_buffer[buffer_offset..buffer_offset + to_copy]
            .copy_from_slice(&data[offset..offset + to_copy]);
        guard.tx_buffer_offset += to_copy;

        write_pending_data(&mut guard, socket_ref);
        offset += to_copy;
    }

    Ok(data.len())
}

/// Begin closing this side of the connection. The socket isn't freed
/// here; teardown completes when the peer acknowledges (or, for listeners
/// and already-reset sockets, immediately). Calling this on a socket that
/// is already closing is a caller error.
pub fn tcp_close(socket_ref: &SocketReference) -> Result<(), util::NetError> {
    let mut guard = socket_ref.lock();

    println!("{}: tcp_close in state {:?}", guard, guard.state);
    match guard.state {
        TcpState::Closed | TcpState::Listen => {
            let key = if guard.state == TcpState::Listen {
                listen_key(guard.local_port)
            } else {
                guard.socket_key()
            };

            timer::cancel(&guard.ack_delay_timer);
            timer::cancel(&guard.retransmit_timer);
            guard.set_state(TcpState::Closed);

            if !remove_from_table(&key) {
                // Second close of an already torn down socket.
                return Err(util::NetError::ChannelClosed);
            }
        }

        TcpState::SynReceived | TcpState::Established => {
            guard.set_state(TcpState::FinWait1);
            let seq = guard.tx_win_low;
            send_segment(&mut guard, buf::PktBuf::new(), FLAG_FIN | FLAG_ACK, &[], seq);
            guard.tx_win_low = guard.tx_win_low.wrapping_add(1);
        }

        TcpState::CloseWait => {
            guard.set_state(TcpState::LastAck);
            let seq = guard.tx_win_low;
            send_segment(&mut guard, buf::PktBuf::new(), FLAG_FIN | FLAG_ACK, &[], seq);
            guard.tx_win_low = guard.tx_win_low.wrapping_add(1);
        }

        TcpState::SynSent
        | TcpState::FinWait1
        | TcpState::FinWait2
        | TcpState::Closing
        | TcpState::TimeWait
        | TcpState::LastAck => {
            // Close was already called; these states only exist after it.
            return Err(util::NetError::ChannelClosed);
        }
    }

    socket_ref.rx_cond.notify_all();
    socket_ref.tx_cond.notify_all();
    socket_ref.accept_cond.notify_all();

    Ok(())
}

/// One line per socket, for the console.
pub fn dump_sockets() {
    let table = SOCKET_TABLE.lock().unwrap();
    for socket_ref in table.values() {
        let guard = socket_ref.lock();
        println!(
            "{} state {:?} rx [{} {}] tx [{} {} highest {}] buffered {}",
            guard,
            guard.state,
            guard.rx_win_low,
            guard.rx_win_high,
            guard.tx_win_low,
            guard.tx_win_high,
            guard.tx_highest_seq,
            guard.tx_buffer_offset,
        );
    }
}
