/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;

use crate::protocol::FlowKey;

bitflags! {
    /// Classification flags filled in by the capture backend's rx
    /// descriptor. Dissection itself happens behind the backend seam, the
    /// core only carries the result.
    #[derive(Default)]
    pub struct PacketFlags: u32 {
        const TCP = 1 << 0;
        const UDP = 1 << 1;
        const TCP_SYN = 1 << 2;
        const TCP_FIN = 1 << 3;
        const TCP_RST = 1 << 4;
        const RETRANSMIT = 1 << 5;
        const OUT_OF_ORDER = 1 << 6;
        const DUP_ACK = 1 << 7;
        const WINDOW_UPDATE = 1 << 8;
        const FLOW_TIMEOUT = 1 << 9;
    }
}

/// One captured frame or one transmit buffer flowing through a channel.
pub struct Packet {
    pub timestamp: Duration,
    pub if_index: u32,
    pub capture_length: u32,
    pub data: Vec<u8>,
    /// Backend flow classification, when the stream provides it.
    pub flow: Option<FlowKey>,
    pub flags: PacketFlags,
    pub frame_number: u64,
}

impl Packet {
    /// Empty buffer for transmit pools. Data is written by the generating
    /// task, capture_length must be updated to the written length.
    pub fn empty(buf_size: usize) -> Self {
        Self {
            timestamp: Duration::ZERO,
            if_index: 0,
            capture_length: 0,
            data: vec![0u8; buf_size],
            flow: None,
            flags: PacketFlags::default(),
            frame_number: 0,
        }
    }

    pub fn reset(&mut self) {
        self.timestamp = Duration::ZERO;
        self.capture_length = 0;
        self.flow = None;
        self.flags = PacketFlags::default();
        self.frame_number = 0;
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("frame_number", &self.frame_number)
            .field("capture_length", &self.capture_length)
            .field("data_len", &self.data.len())
            .field("timestamp", &self.timestamp)
            .field("flags", &self.flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer_keeps_backing_storage_on_reset() {
        let mut p = Packet::empty(256);
        p.capture_length = 64;
        p.flags = PacketFlags::TCP | PacketFlags::TCP_SYN;
        p.frame_number = 42;

        p.reset();
        assert_eq!(p.capture_length, 0);
        assert_eq!(p.data.len(), 256);
        assert!(p.flags.is_empty());
        assert_eq!(p.frame_number, 0);
    }
}
