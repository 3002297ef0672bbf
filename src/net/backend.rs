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
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use parking_lot::Mutex;
use public::net::{LinkFlags, MacAddr};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{CaptureJob, Port, TrafficCounter, TrafficHandle, TrafficMetrics, TransmitJob, TransmitStream, TxSink};
use crate::error::Result;
use crate::packet::{Packet, PacketFlags};
use crate::protocol::FlowKey;

const INJECT_TIMEOUT: Duration = Duration::from_millis(10);
const THROTTLE_BATCH: u64 = 64;

/// Traffic stream provider. Real deployments back this with PCAP, DPDK or a
/// SmartNIC driver; the in-process synthetic implementation below generates
/// classified traffic so the channel core runs without hardware.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;
    fn ports(&self) -> Vec<Port>;
    fn open_capture(&self, job: CaptureJob) -> Result<Arc<dyn TrafficHandle>>;
    fn open_transmit(&self, job: TransmitJob) -> Result<TransmitStream>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub ports: Vec<String>,
    /// Packets per second, 0 means unthrottled.
    pub rate_pps: u64,
    /// Stop generating after this many packets.
    pub max_packets: Option<u64>,
    pub flows: usize,
    pub payload: usize,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            ports: vec!["en0".to_owned(), "en1".to_owned(), "lo".to_owned()],
            rate_pps: 0,
            max_packets: None,
            flows: 16,
            payload: 256,
            seed: 42,
        }
    }
}

pub struct SyntheticBackend {
    config: SyntheticConfig,
    ports: Vec<Port>,
}

impl SyntheticBackend {
    pub fn new(config: SyntheticConfig) -> Self {
        let ports = config
            .ports
            .iter()
            .enumerate()
            .map(|(i, name)| Port {
                name: name.clone(),
                index: i as u32,
                mac: MacAddr::from([0x02, 0x1b, 0x21, 0x00, 0x00, i as u8]),
                flags: if name == "lo" {
                    LinkFlags::UP | LinkFlags::LOOPBACK
                } else {
                    LinkFlags::UP | LinkFlags::BROADCAST | LinkFlags::MULTICAST
                },
            })
            .collect();
        Self { config, ports }
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new(SyntheticConfig::default())
    }
}

struct SyntheticStream {
    name: String,
    counter: Arc<TrafficCounter>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TrafficHandle for SyntheticStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn metrics(&self) -> TrafficMetrics {
        self.counter.snapshot()
    }

    fn counter(&self) -> Arc<TrafficCounter> {
        self.counter.clone()
    }

    fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        debug!("traffic stream {} stopped", self.name);
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        self.stop();
    }
}

struct FlowState {
    key: FlowKey,
    started: bool,
    packets: u64,
    lifetime: u64,
}

fn synth_flows(rng: &mut StdRng, count: usize, tcp: bool, udp: bool) -> Vec<FlowState> {
    (0..count.max(1))
        .map(|_| {
            let proto = match (tcp, udp) {
                (true, false) => 6,
                (false, true) => 17,
                _ => {
                    if rng.gen_bool(0.5) {
                        6
                    } else {
                        17
                    }
                }
            };
            FlowState {
                key: FlowKey {
                    src_ip: Ipv4Addr::new(10, 0, rng.gen(), rng.gen()),
                    dst_ip: Ipv4Addr::new(10, 1, rng.gen(), rng.gen()),
                    src_port: rng.gen_range(1024..u16::MAX),
                    dst_port: if proto == 6 { 443 } else { 53 },
                    proto,
                },
                started: false,
                packets: 0,
                lifetime: rng.gen_range(64..512),
            }
        })
        .collect()
}

fn synth_packet(
    rng: &mut StdRng,
    flow: &mut FlowState,
    port: &Port,
    frame_number: u64,
    payload: usize,
) -> Packet {
    let mut flags = if flow.key.proto == 6 {
        PacketFlags::TCP
    } else {
        PacketFlags::UDP
    };
    if flow.key.proto == 6 {
        if !flow.started {
            flags |= PacketFlags::TCP_SYN;
            flow.started = true;
        } else if flow.packets >= flow.lifetime {
            // flows mostly close, a few time out
            if rng.gen_bool(0.125) {
                flags |= PacketFlags::FLOW_TIMEOUT;
            } else {
                flags |= PacketFlags::TCP_FIN;
            }
            flow.started = false;
            flow.packets = 0;
        } else {
            match rng.gen_range(0..64u32) {
                0 => flags |= PacketFlags::RETRANSMIT,
                1 => flags |= PacketFlags::OUT_OF_ORDER,
                2 => flags |= PacketFlags::DUP_ACK,
                3 => flags |= PacketFlags::WINDOW_UPDATE,
                4 => flags |= PacketFlags::TCP_RST,
                _ => (),
            }
        }
    }
    flow.packets += 1;
    let len = rng.gen_range(64..64 + payload.max(1));
    Packet {
        timestamp: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default(),
        if_index: port.index,
        capture_length: len as u32,
        data: vec![0u8; len],
        flow: Some(flow.key),
        flags,
        frame_number,
    }
}

impl Backend for SyntheticBackend {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn ports(&self) -> Vec<Port> {
        self.ports.clone()
    }

    fn open_capture(&self, job: CaptureJob) -> Result<Arc<dyn TrafficHandle>> {
        let counter = Arc::new(TrafficCounter::default());
        let running = Arc::new(AtomicBool::new(true));
        let config = self.config.clone();

        let stream = Arc::new(SyntheticStream {
            name: job.name.clone(),
            counter: counter.clone(),
            running: running.clone(),
            thread: Mutex::new(None),
        });

        let thread_name = format!("capture-{}", job.name);
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let CaptureJob {
                    name,
                    port,
                    filter,
                    outputs,
                    tokens,
                } = job;
                let selection = filter.selection();
                let mut rng = StdRng::seed_from_u64(config.seed ^ port.index as u64);
                let mut flows =
                    synth_flows(&mut rng, config.flows, selection.tcp, selection.udp);
                let mut outputs = outputs;
                let mut frame_number = 0u64;
                let mut next_output = 0usize;

                info!(
                    "capture {} started on port {} with filter {:?}",
                    name,
                    port.name,
                    filter.to_expression()
                );
                while running.load(Ordering::Acquire) && !outputs.is_empty() {
                    if let Some(max) = config.max_packets {
                        if frame_number >= max {
                            break;
                        }
                    }
                    frame_number += 1;
                    let slot = rng.gen_range(0..flows.len());
                    let packet = synth_packet(
                        &mut rng,
                        &mut flows[slot],
                        &port,
                        frame_number,
                        config.payload,
                    );
                    counter.assigned.fetch_add(1, Ordering::Relaxed);

                    if let Some(tee) = &tokens {
                        tee.feed(&packet);
                    }

                    // each frame goes to exactly one channel
                    let start = next_output;
                    next_output = (next_output + 1) % outputs.len();
                    match outputs[start % outputs.len()].send(packet, Some(INJECT_TIMEOUT)) {
                        Ok(()) => {
                            counter.delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(crate::error::Error::Timeout(_)) => {
                            counter.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            let closed = outputs.remove(start % outputs.len());
                            debug!(
                                "capture {} output channel {} closed",
                                name,
                                closed.channel_name()
                            );
                            if next_output >= outputs.len() {
                                next_output = 0;
                            }
                            counter.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }

                    if config.rate_pps > 0 && frame_number % THROTTLE_BATCH == 0 {
                        let pause =
                            Duration::from_secs(1).mul_f64(THROTTLE_BATCH as f64 / config.rate_pps as f64);
                        thread::sleep(pause);
                    }
                }
                info!("capture {} generator exiting", name);
            })
            .map_err(|e| {
                crate::error::Error::IllegalState(format!("capture thread spawn failed: {}", e))
            })?;
        *stream.thread.lock() = Some(handle);
        Ok(stream)
    }

    fn open_transmit(&self, job: TransmitJob) -> Result<TransmitStream> {
        let counter = Arc::new(TrafficCounter::default());
        let stream = Arc::new(SyntheticStream {
            name: job.name.clone(),
            counter: counter.clone(),
            running: Arc::new(AtomicBool::new(true)),
            thread: Mutex::new(None),
        });
        info!(
            "transmit {} opened on ports [{}]",
            job.name,
            job.ports
                .iter()
                .map(|p| p.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        let sink = Arc::new(SyntheticTxSink {
            counter,
            ports: job.ports,
        });
        Ok(TransmitStream {
            handle: stream,
            sink,
        })
    }
}

/// Counts transmitted frames; a hardware backend would queue them on the
/// NIC here.
struct SyntheticTxSink {
    counter: Arc<TrafficCounter>,
    ports: Vec<Port>,
}

impl TxSink for SyntheticTxSink {
    fn transmit(&self, data: &[u8], port: u32) {
        if !self.ports.iter().any(|p| p.index == port) {
            warn!("transmit on unknown port index {}, frame dropped", port);
            self.counter.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counter.delivered.fetch_add(1, Ordering::Relaxed);
        let _ = data;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelMode, ChannelSettings};
    use crate::net::filter::{ExprCompiler, FilterCompiler, FilterSpec};

    fn capture_job(name: &str, outputs: Vec<crate::channel::Injector<Packet>>) -> CaptureJob {
        let backend = SyntheticBackend::default();
        CaptureJob {
            name: name.to_owned(),
            port: backend.ports()[0].clone(),
            filter: ExprCompiler.compile(&FilterSpec::new("tcp")).unwrap(),
            outputs,
            tokens: None,
        }
    }

    #[test]
    fn bounded_generator_counts_match() {
        let backend = SyntheticBackend::new(SyntheticConfig {
            max_packets: Some(500),
            ..Default::default()
        });
        let channel: Channel<Packet> = Channel::new(
            "cap-test",
            ChannelSettings {
                capacity: 64,
                mode: ChannelMode::Stream,
            },
        );
        let handle = backend
            .open_capture(capture_job("cap-test", vec![channel.injector()]))
            .unwrap();

        let mut received = 0u64;
        loop {
            match channel.acquire(Some(Duration::from_millis(200)), None) {
                Ok(loan) => {
                    assert!(loan.flags.contains(PacketFlags::TCP));
                    received += 1;
                    channel.release(loan).unwrap();
                }
                Err(_) => break,
            }
        }
        handle.stop();
        let metrics = handle.metrics();
        assert_eq!(metrics.packets_assigned, 500);
        assert_eq!(metrics.packets_delivered, received);
        assert_eq!(
            metrics.packets_assigned,
            metrics.packets_delivered + metrics.packets_dropped
        );
    }

    #[test]
    fn generator_stops_when_all_channels_close() {
        let backend = SyntheticBackend::default();
        let channel: Channel<Packet> = Channel::new(
            "cap-close",
            ChannelSettings {
                capacity: 8,
                mode: ChannelMode::Stream,
            },
        );
        let handle = backend
            .open_capture(capture_job("cap-close", vec![channel.injector()]))
            .unwrap();
        channel.close();
        // generator notices the closed output and exits; stop() then joins
        handle.stop();
        assert!(handle.metrics().packets_assigned > 0);
    }

    #[test]
    fn transmit_sink_counts_known_ports_only() {
        let backend = SyntheticBackend::default();
        let ports = backend.ports();
        let stream = backend
            .open_transmit(TransmitJob {
                name: "tx-test".to_owned(),
                ports: ports[..2].to_vec(),
            })
            .unwrap();
        stream.sink.transmit(&[0u8; 64], 0);
        stream.sink.transmit(&[0u8; 64], 1);
        stream.sink.transmit(&[0u8; 64], 9);
        let metrics = stream.handle.metrics();
        assert_eq!(metrics.packets_delivered, 2);
        assert_eq!(metrics.packets_dropped, 1);
    }
}
