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

// A packet buffer is a single contiguous array with headroom at the front.
// Payload is appended first and each protocol layer then prepends its
// header with alloc_header, so nothing is ever copied to make room. On
// receive the layers peel headers off the front with trim_head.

/// Large enough for a full ethernet frame plus headroom for every header
/// the stack will prepend.
const PKT_BUF_SIZE: usize = 2048;

/// Headroom reserved for ethernet + IPv4 + TCP headers and options.
const MAX_HEADER_SIZE: usize = 128;

pub struct PktBuf {
    data: Box<[u8; PKT_BUF_SIZE]>,
    offset: usize,
    length: usize,
}

impl PktBuf {
    pub fn new() -> PktBuf {
        PktBuf {
            data: Box::new([0; PKT_BUF_SIZE]),
            offset: MAX_HEADER_SIZE,
            length: MAX_HEADER_SIZE,
        }
    }

    /// Wrap a received frame. No headroom is needed on the receive path;
    /// headers are consumed, not added.
    pub fn new_from_frame(frame: &[u8]) -> PktBuf {
        assert!(frame.len() <= PKT_BUF_SIZE);
        let mut buf = PktBuf {
            data: Box::new([0; PKT_BUF_SIZE]),
            offset: 0,
            length: frame.len(),
        };

        buf.data[..frame.len()].copy_from_slice(frame);
        buf
    }

    pub fn len(&self) -> usize {
        self.length - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.length == self.offset
    }

    /// The current packet contents, starting at the outermost header.
    pub fn header(&self) -> &[u8] {
        &self.data[self.offset..self.length]
    }

    pub fn header_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.offset..self.length]
    }

    /// Extend the front of the packet to make room for a new header. The
    /// new bytes are zeroed.
    pub fn alloc_header(&mut self, size: usize) {
        assert!(size <= self.offset, "out of packet headroom");
        self.offset -= size;
        self.data[self.offset..self.offset + size].fill(0);
    }

    /// Consume bytes from the front (strip a header).
    pub fn trim_head(&mut self, size: usize) {
        assert!(size <= self.len());
        self.offset += size;
    }

    /// Drop trailing bytes (e.g. link layer padding past the IP total
    /// length).
    pub fn trim_tail(&mut self, size: usize) {
        assert!(size <= self.len());
        self.length -= size;
    }

    pub fn append_from_slice(&mut self, slice: &[u8]) {
        assert!(self.length + slice.len() <= PKT_BUF_SIZE);
        self.data[self.length..self.length + slice.len()].copy_from_slice(slice);
        self.length += slice.len();
    }

    /// Copy as much of the packet as fits into the destination, returning
    /// the number of bytes copied.
    pub fn copy_to_slice(&self, dest: &mut [u8]) -> usize {
        let copy_len = std::cmp::min(self.len(), dest.len());
        dest[..copy_len].copy_from_slice(&self.data[self.offset..self.offset + copy_len]);
        copy_len
    }
}

impl Default for PktBuf {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_len() {
        let mut packet = PktBuf::new();
        assert!(packet.is_empty());
        packet.append_from_slice(b"hello");
        assert_eq!(packet.len(), 5);
        assert_eq!(packet.header(), b"hello");
    }

    #[test]
    fn test_alloc_header() {
        let mut packet = PktBuf::new();
        packet.append_from_slice(b"payload");
        packet.alloc_header(4);
        assert_eq!(packet.len(), 11);

        // New header space is zeroed, payload untouched.
        assert_eq!(&packet.header()[..4], &[0, 0, 0, 0]);
        assert_eq!(&packet.header()[4..], b"payload");

        packet.header_mut()[0] = 0x45;
        assert_eq!(packet.header()[0], 0x45);
    }

    #[test]
    fn test_trim_head() {
        let mut packet = PktBuf::new();
        packet.append_from_slice(b"headpayload");
        packet.trim_head(4);
        assert_eq!(packet.header(), b"payload");
    }

    #[test]
    fn test_trim_tail() {
        let mut packet = PktBuf::new_from_frame(b"payloadPADDING");
        packet.trim_tail(7);
        assert_eq!(packet.header(), b"payload");
    }

    #[test]
    fn test_from_frame() {
        let packet = PktBuf::new_from_frame(&[1, 2, 3, 4]);
        assert_eq!(packet.len(), 4);
        assert_eq!(packet.header(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_copy_to_slice() {
        let mut packet = PktBuf::new();
        packet.append_from_slice(b"abcdef");

        let mut small = [0u8; 4];
        assert_eq!(packet.copy_to_slice(&mut small), 4);
        assert_eq!(&small, b"abcd");

        let mut large = [0u8; 16];
        assert_eq!(packet.copy_to_slice(&mut large), 6);
        assert_eq!(&large[..6], b"abcdef");
    }

    #[test]
    fn test_headroom_round_trip() {
        // Build outbound style, then peel like the receive path.
        let mut packet = PktBuf::new();
        packet.append_from_slice(b"data");
        packet.alloc_header(8); // transport
        packet.alloc_header(20); // ip
        packet.alloc_header(14); // ethernet
        assert_eq!(packet.len(), 46);

        packet.trim_head(14);
        packet.trim_head(20);
        packet.trim_head(8);
        assert_eq!(packet.header(), b"data");
    }
}
