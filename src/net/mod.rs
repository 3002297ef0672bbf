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

pub mod backend;
pub mod filter;

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use log::debug;
use public::counter::{Counter, CounterType, CounterValue, RefCountable};

use crate::channel::{Channel, Emitter, Injector, TxOptions};
use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::protocol::{ProtocolStack, Token, TokenKind};
use crate::session::Net;
use filter::{CompiledFilter, FilterSpec};

pub use backend::{Backend, SyntheticBackend, SyntheticConfig};

const PREFILL_TIMEOUT: Duration = Duration::from_millis(100);
const TOKEN_TIMEOUT: Duration = Duration::from_millis(10);

/// Read-only device attributes resolved through the port directory.
#[derive(Debug, Clone)]
pub struct Port {
    pub name: String,
    pub index: u32,
    pub mac: public::net::MacAddr,
    pub flags: public::net::LinkFlags,
}

impl Port {
    pub fn link_up(&self) -> bool {
        self.flags.contains(public::net::LinkFlags::UP)
    }
}

#[derive(Debug, Default)]
pub struct TrafficCounter {
    pub assigned: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
}

impl TrafficCounter {
    pub fn snapshot(&self) -> TrafficMetrics {
        TrafficMetrics {
            packets_assigned: self.assigned.load(Ordering::Relaxed),
            packets_delivered: self.delivered.load(Ordering::Relaxed),
            packets_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl RefCountable for TrafficCounter {
    fn get_counters(&self) -> Vec<Counter> {
        // cumulative gauges, the user-facing metrics() reads the same values
        vec![
            (
                "assigned",
                CounterType::Gauged,
                CounterValue::Unsigned(self.assigned.load(Ordering::Relaxed)),
            ),
            (
                "delivered",
                CounterType::Gauged,
                CounterValue::Unsigned(self.delivered.load(Ordering::Relaxed)),
            ),
            (
                "dropped",
                CounterType::Gauged,
                CounterValue::Unsigned(self.dropped.load(Ordering::Relaxed)),
            ),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficMetrics {
    pub packets_assigned: u64,
    pub packets_delivered: u64,
    pub packets_dropped: u64,
}

/// Opaque handle over an activated traffic stream.
pub trait TrafficHandle: Send + Sync {
    fn name(&self) -> &str;
    fn metrics(&self) -> TrafficMetrics;
    fn counter(&self) -> Arc<TrafficCounter>;
    fn stop(&self);
}

/// Downstream frame consumer used by transmit/inline emission.
pub trait TxSink: Send + Sync {
    fn transmit(&self, data: &[u8], port: u32);
}

/// Typed channel for analysis tokens with a per-kind delivery mask. The
/// mask is honored at the stack seam, before tokens reach the channel.
pub struct TokenChannel {
    channel: Channel<Token>,
    disabled: Arc<AtomicU32>,
}

impl Clone for TokenChannel {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            disabled: self.disabled.clone(),
        }
    }
}

impl TokenChannel {
    pub fn new(channel: Channel<Token>) -> Self {
        Self {
            channel,
            disabled: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn channel(&self) -> &Channel<Token> {
        &self.channel
    }

    /// Stops delivery of one token kind to this channel. Used by analysis
    /// loops to prune kinds they are not interested in.
    pub fn disable(&self, kind: TokenKind) {
        self.disabled
            .fetch_or(kind.mask().bits(), Ordering::Relaxed);
    }

    pub fn is_disabled(&self, kind: TokenKind) -> bool {
        self.disabled.load(Ordering::Relaxed) & kind.mask().bits() != 0
    }
}

/// Feeds a protocol stack's token output into a token channel, honoring the
/// channel's disable mask.
pub struct TokenTee {
    injector: Injector<Token>,
    stack: Arc<dyn ProtocolStack<Token>>,
    disabled: Arc<AtomicU32>,
}

impl TokenTee {
    pub fn feed(&self, packet: &Packet) {
        for token in self.stack.dissect(packet) {
            if self.disabled.load(Ordering::Relaxed) & token.kind.mask().bits() != 0 {
                continue;
            }
            if self.injector.send(token, Some(TOKEN_TIMEOUT)).is_err() {
                // token channel congested or gone, analysis is best effort
                debug!("token channel {} not accepting", self.injector.channel_name());
                return;
            }
        }
    }
}

/// Work order handed to `Backend::open_capture`.
pub struct CaptureJob {
    pub name: String,
    pub port: Port,
    pub filter: CompiledFilter,
    pub outputs: Vec<Injector<Packet>>,
    pub tokens: Option<TokenTee>,
}

/// Work order handed to `Backend::open_transmit`.
pub struct TransmitJob {
    pub name: String,
    pub ports: Vec<Port>,
}

pub struct TransmitStream {
    pub handle: Arc<dyn TrafficHandle>,
    pub sink: Arc<dyn TxSink>,
}

struct SinkEmitter {
    sink: Arc<dyn TxSink>,
    default_port: u32,
}

impl Emitter<Packet> for SinkEmitter {
    fn emit(&self, packet: &Packet, tx: &TxOptions) {
        let port = tx.port.unwrap_or(self.default_port);
        let len = (packet.capture_length as usize).min(packet.data.len());
        self.sink.transmit(&packet.data[..len], port);
    }
}

/// `net.capture(name, port).filter(..).assign_to(..).apply()`.
pub struct CaptureBuilder {
    pub(crate) net: Net,
    pub(crate) name: String,
    pub(crate) port: String,
    pub(crate) filter: FilterSpec,
    pub(crate) channels: Vec<Channel<Packet>>,
    pub(crate) tokens: Option<(TokenChannel, Arc<dyn ProtocolStack<Token>>)>,
}

impl CaptureBuilder {
    pub fn filter<S: Into<FilterSpec>>(mut self, spec: S) -> Self {
        self.filter = spec.into();
        self
    }

    pub fn assign_to(mut self, channels: &[Channel<Packet>]) -> Self {
        self.channels.extend(channels.iter().cloned());
        self
    }

    pub fn assign_channel(mut self, channel: &Channel<Packet>) -> Self {
        self.channels.push(channel.clone());
        self
    }

    /// Routes the protocol stack's tokens for this stream into `channel`.
    pub fn tokens(mut self, channel: &TokenChannel, stack: Arc<dyn ProtocolStack<Token>>) -> Self {
        self.tokens = Some((channel.clone(), stack));
        self
    }

    pub fn apply(self) -> Result<Capture> {
        if self.channels.is_empty() {
            return Err(Error::IllegalState(format!(
                "capture {} has no channels assigned",
                self.name
            )));
        }
        let port = self.net.get_port(&self.port)?;
        let filter = self.net.compile_filter(&self.filter)?;
        let tokens = self.tokens.map(|(channel, stack)| TokenTee {
            injector: channel.channel().injector(),
            stack,
            disabled: channel.disabled.clone(),
        });
        let job = CaptureJob {
            name: self.name.clone(),
            port: port.clone(),
            filter: filter.clone(),
            outputs: self.channels.iter().map(|c| c.injector()).collect(),
            tokens,
        };
        let handle = self.net.activate_capture(job)?;
        Ok(Capture {
            handle,
            port,
            filter,
        })
    }
}

pub struct Capture {
    handle: Arc<dyn TrafficHandle>,
    port: Port,
    filter: CompiledFilter,
}

impl Capture {
    pub fn port(&self) -> &Port {
        &self.port
    }

    pub fn filter(&self) -> &CompiledFilter {
        &self.filter
    }

    pub fn metrics(&self) -> TrafficMetrics {
        self.handle.metrics()
    }

    pub fn close(&self) {
        self.handle.stop();
    }
}

/// Inline streams capture and re-emit on release: the assigned channels get
/// an emission sink and default tx attributes, workers drop frames by
/// disabling tx on the loan.
pub struct InlineBuilder {
    pub(crate) capture: CaptureBuilder,
    pub(crate) tx_enable: bool,
    pub(crate) tx_ports: Vec<String>,
}

impl InlineBuilder {
    pub fn filter<S: Into<FilterSpec>>(mut self, spec: S) -> Self {
        self.capture = self.capture.filter(spec);
        self
    }

    pub fn assign_to(mut self, channels: &[Channel<Packet>]) -> Self {
        self.capture = self.capture.assign_to(channels);
        self
    }

    pub fn tx_enable(mut self, enabled: bool) -> Self {
        self.tx_enable = enabled;
        self
    }

    pub fn tx_ports(mut self, ports: &[&str]) -> Self {
        self.tx_ports = ports.iter().map(|p| (*p).to_owned()).collect();
        self
    }

    pub fn apply(self) -> Result<Inline> {
        let net = self.capture.net.clone();
        let name = self.capture.name.clone();
        let ports = net.resolve_ports(&self.tx_ports)?;
        let default_port = ports
            .first()
            .map(|p| p.index)
            .ok_or_else(|| Error::IllegalState(format!("inline {} has no tx ports", name)))?;
        let stream = net.activate_transmit(TransmitJob {
            name: format!("{}-tx", name),
            ports,
        })?;
        for channel in &self.capture.channels {
            channel.set_emitter(Box::new(SinkEmitter {
                sink: stream.sink.clone(),
                default_port,
            }));
            channel.set_default_tx(TxOptions {
                enabled: self.tx_enable,
                port: None,
            });
        }
        let capture = self.capture.apply()?;
        Ok(Inline {
            capture,
            tx: stream.handle,
        })
    }
}

pub struct Inline {
    capture: Capture,
    tx: Arc<dyn TrafficHandle>,
}

impl Inline {
    pub fn port(&self) -> &Port {
        self.capture.port()
    }

    pub fn metrics(&self) -> TrafficMetrics {
        self.capture.metrics()
    }

    pub fn tx_metrics(&self) -> TrafficMetrics {
        self.tx.metrics()
    }

    pub fn close(&self) {
        self.capture.close();
        self.tx.stop();
    }
}

/// Transmit pools hand out empty buffers; releasing with tx enabled emits
/// the frame. Buffers cycle through the pool in release order.
pub struct TransmitBuilder {
    pub(crate) net: Net,
    pub(crate) name: String,
    pub(crate) ports: Vec<String>,
    pub(crate) channels: Vec<Channel<Packet>>,
    pub(crate) tx_enable: bool,
    pub(crate) tx_port: Option<String>,
    pub(crate) buf_size: usize,
}

impl TransmitBuilder {
    pub fn assign_to(mut self, channels: &[Channel<Packet>]) -> Self {
        self.channels.extend(channels.iter().cloned());
        self
    }

    pub fn tx_enable(mut self, enabled: bool) -> Self {
        self.tx_enable = enabled;
        self
    }

    pub fn tx_port<S: AsRef<str>>(mut self, port: S) -> Self {
        self.tx_port = Some(port.as_ref().to_owned());
        self
    }

    pub fn buf_size(mut self, buf_size: usize) -> Self {
        self.buf_size = buf_size;
        self
    }

    pub fn apply(self) -> Result<Transmit> {
        if self.channels.is_empty() {
            return Err(Error::IllegalState(format!(
                "transmit {} has no channels assigned",
                self.name
            )));
        }
        let ports = self.net.resolve_ports(&self.ports)?;
        if ports.is_empty() {
            return Err(Error::IllegalState(format!(
                "transmit {} matched no ports",
                self.name
            )));
        }
        let default_port = match &self.tx_port {
            Some(name) => self.net.get_port(name)?.index,
            None => ports[0].index,
        };
        let stream = self.net.activate_transmit(TransmitJob {
            name: self.name.clone(),
            ports: ports.clone(),
        })?;
        for channel in &self.channels {
            channel.set_emitter(Box::new(SinkEmitter {
                sink: stream.sink.clone(),
                default_port,
            }));
            channel.set_default_tx(TxOptions {
                enabled: self.tx_enable,
                port: None,
            });
            // pre-fill the pool with empty buffers
            let injector = channel.injector();
            for _ in 0..channel.capacity() {
                injector.send(Packet::empty(self.buf_size), Some(PREFILL_TIMEOUT))?;
            }
        }
        Ok(Transmit {
            handle: stream.handle,
            ports,
        })
    }
}

pub struct Transmit {
    handle: Arc<dyn TrafficHandle>,
    ports: Vec<Port>,
}

impl Transmit {
    pub fn list_ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn metrics(&self) -> TrafficMetrics {
        self.handle.metrics()
    }

    pub fn close(&self) {
        self.handle.stop();
    }
}
