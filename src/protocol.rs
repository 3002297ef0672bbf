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

use std::net::Ipv4Addr;

use bitflags::bitflags;

use crate::packet::{Packet, PacketFlags};

/// 5-tuple identity of a logical flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
}

/// Analysis event kinds emitted by a protocol stack. Closed enumeration:
/// handler sites match exhaustively, adding a kind forces every site to
/// cover it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    StreamSyn,
    StreamFin,
    StreamRst,
    StreamTimeout,
    SegmentOutOfOrder,
    WindowResize,
    Retransmit,
    DuplicateAck,
}

bitflags! {
    #[derive(Default)]
    pub struct TokenMask: u32 {
        const STREAM_SYN = 1 << 0;
        const STREAM_FIN = 1 << 1;
        const STREAM_RST = 1 << 2;
        const STREAM_TIMEOUT = 1 << 3;
        const SEGMENT_OUT_OF_ORDER = 1 << 4;
        const WINDOW_RESIZE = 1 << 5;
        const RETRANSMIT = 1 << 6;
        const DUPLICATE_ACK = 1 << 7;
    }
}

impl TokenKind {
    pub fn mask(self) -> TokenMask {
        match self {
            TokenKind::StreamSyn => TokenMask::STREAM_SYN,
            TokenKind::StreamFin => TokenMask::STREAM_FIN,
            TokenKind::StreamRst => TokenMask::STREAM_RST,
            TokenKind::StreamTimeout => TokenMask::STREAM_TIMEOUT,
            TokenKind::SegmentOutOfOrder => TokenMask::SEGMENT_OUT_OF_ORDER,
            TokenKind::WindowResize => TokenMask::WINDOW_RESIZE,
            TokenKind::Retransmit => TokenMask::RETRANSMIT,
            TokenKind::DuplicateAck => TokenMask::DUPLICATE_ACK,
        }
    }

    /// Terminal kinds end the flow's lifecycle; state keyed by the flow is
    /// evicted when one is observed.
    pub fn is_terminal(self) -> bool {
        matches!(self, TokenKind::StreamTimeout)
    }
}

/// Lightweight analysis event. Tokens hold no frame data, only the flow
/// identity and the frame number the event was generated for.
#[derive(Debug, Clone, Copy)]
pub struct Token {
    pub kind: TokenKind,
    pub flow: FlowKey,
    pub frame_number: u64,
}

/// Pre-processing seam between a raw traffic stream and typed channels.
/// Output items are ordinary channel items, the core does not interpret
/// them.
pub trait ProtocolStack<T>: Send + Sync {
    fn dissect(&self, packet: &Packet) -> Vec<T>;
}

/// Maps backend descriptor flags to TCP analysis tokens. Stands in for the
/// full reassembly stack, which lives behind the backend seam.
#[derive(Debug, Default)]
pub struct TcpTokenStack;

impl ProtocolStack<Token> for TcpTokenStack {
    fn dissect(&self, packet: &Packet) -> Vec<Token> {
        let flow = match packet.flow {
            Some(flow) => flow,
            None => return vec![],
        };
        if !packet.flags.contains(PacketFlags::TCP) {
            return vec![];
        }

        let mut tokens = vec![];
        let mut emit = |kind| {
            tokens.push(Token {
                kind,
                flow,
                frame_number: packet.frame_number,
            })
        };
        if packet.flags.contains(PacketFlags::TCP_SYN) {
            emit(TokenKind::StreamSyn);
        }
        if packet.flags.contains(PacketFlags::TCP_FIN) {
            emit(TokenKind::StreamFin);
        }
        if packet.flags.contains(PacketFlags::TCP_RST) {
            emit(TokenKind::StreamRst);
        }
        if packet.flags.contains(PacketFlags::RETRANSMIT) {
            emit(TokenKind::Retransmit);
        }
        if packet.flags.contains(PacketFlags::OUT_OF_ORDER) {
            emit(TokenKind::SegmentOutOfOrder);
        }
        if packet.flags.contains(PacketFlags::DUP_ACK) {
            emit(TokenKind::DuplicateAck);
        }
        if packet.flags.contains(PacketFlags::WINDOW_UPDATE) {
            emit(TokenKind::WindowResize);
        }
        if packet.flags.contains(PacketFlags::FLOW_TIMEOUT) {
            emit(TokenKind::StreamTimeout);
        }
        tokens
    }
}
