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

// Fixed capacity byte ring used for the TCP receive window. Writes are
// bounded by the free space; data is never overwritten.

pub struct CBuf {
    data: Vec<u8>,
    head: usize,
    tail: usize,
    used: usize,
}

impl CBuf {
    /// A zero capacity ring; reads and writes are no-ops. Used by sockets
    /// that never carry data (listeners).
    pub fn new() -> CBuf {
        CBuf {
            data: Vec::new(),
            head: 0,
            tail: 0,
            used: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> CBuf {
        assert!(capacity > 0);
        CBuf {
            data: vec![0; capacity],
            head: 0,
            tail: 0,
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn space_used(&self) -> usize {
        self.used
    }

    pub fn space_avail(&self) -> usize {
        self.data.len() - self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Copy in as many bytes as fit, returning the number written.
    pub fn write(&mut self, buffer: &[u8]) -> usize {
        if self.data.is_empty() {
            return 0;
        }

        let write_len = std::cmp::min(buffer.len(), self.space_avail());
        for &byte in &buffer[..write_len] {
            self.data[self.head] = byte;
            self.head = (self.head + 1) % self.data.len();
        }

        self.used += write_len;
        write_len
    }

    /// Copy out up to `buffer.len()` bytes, returning the number read.
    pub fn read(&mut self, buffer: &mut [u8]) -> usize {
        if self.data.is_empty() {
            return 0;
        }

        let read_len = std::cmp::min(buffer.len(), self.used);
        for byte in buffer[..read_len].iter_mut() {
            *byte = self.data[self.tail];
            self.tail = (self.tail + 1) % self.data.len();
        }

        self.used -= read_len;
        read_len
    }
}
