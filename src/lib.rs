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

// A small TCP/IP stack for embedding next to a link driver. The driver
// supplies a transmit callback to init_netstack and feeds received frames
// to netif::rx_frame; applications use the tcp and udp modules. There is
// no receive thread here: receive-side work runs on whatever thread the
// driver injects frames from, plus the one timer thread.

pub mod arp;
pub mod buf;
pub mod netif;
pub mod tcp;
pub mod timer;
pub mod udp;
pub mod util;

mod cbuf;
mod icmp;
mod ip;

/// Bring the stack up. The addresses may be zero when a DHCP client will
/// configure the interface afterward.
pub fn init_netstack(
    tx_handler: netif::TxHandler,
    ip: util::IPv4Addr,
    netmask: util::IPv4Addr,
    gateway: util::IPv4Addr,
) {
    netif::init(tx_handler, ip, netmask, gateway);
    timer::init();
}
