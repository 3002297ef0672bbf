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

//! Broader tour of the channel API: multi-channel capture, inline
//! forward-or-drop, pooled traffic generation and token analysis with
//! per-flow state, all supervised by one task group.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::info;

use netchannels::channel::{ChannelMode, ChannelSettings};
use netchannels::config::NetConfig;
use netchannels::executor::Recovery;
use netchannels::flow::FlowTable;
use netchannels::logger;
use netchannels::packet::PacketFlags;
use netchannels::protocol::{FlowKey, TcpTokenStack, TokenKind};
use netchannels::{Net, Packet};
use public::CancelToken;

#[derive(Parser)]
struct Opts {
    /// Specify config file location
    #[clap(short = 'f', long)]
    config_file: Option<String>,

    /// How long to run
    #[clap(short, long, default_value = "30")]
    seconds: u64,
}

#[derive(Default)]
struct FlowRecord {
    packets: u64,
    resets: u64,
    losses: u64,
    congestion: u64,
    closing: bool,
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let config = match &opts.config_file {
        Some(path) => NetConfig::load(path)?,
        None => NetConfig::default(),
    };
    let (_logger, _log_counter) = logger::init(&config.log)?;

    let net = Net::synthetic(&config);

    let cap_settings = ChannelSettings {
        capacity: 64,
        mode: ChannelMode::Stream,
    };
    let pool_settings = ChannelSettings {
        capacity: 16,
        mode: ChannelMode::Pooled,
    };
    let cap_channels = net.packet_channels("capture-channel", 4, cap_settings)?;
    let ids_channels = net.packet_channels("inline-ids-channel", 2, cap_settings)?;
    let gen_channels = net.packet_channels("traffic-gen-channel", 2, pool_settings)?;
    let tcp_tokens = net.token_channel(
        "analysis-tokens",
        ChannelSettings {
            capacity: 512,
            mode: ChannelMode::Stream,
        },
    )?;

    let capture = net
        .capture("udp-capture-channel", "en0")
        .filter("udp")
        .assign_to(&cap_channels)
        .apply()?;

    let inline = net
        .inline("inline-ids-channel", "en1")
        .filter("all")
        .assign_to(&ids_channels)
        .tx_enable(true)
        .tx_ports(&["en0"])
        .apply()?;

    let transmit = net
        .transmit("traffic-gen-channel", &[])
        .assign_to(&gen_channels)
        .tx_enable(true)
        .tx_port("en0")
        .buf_size(2048)
        .apply()?;

    let tokens_capture = net
        .capture("tcp-token-capture", "lo")
        .filter("tcp")
        .assign_to(&net.packet_channels("tcp-raw", 1, cap_settings)?)
        .tokens(&tcp_tokens, Arc::new(TcpTokenStack))
        .apply()?;

    info!("selected port for capture: {}", capture.port().name);
    info!("selected port for inline: {}", inline.port().name);
    info!(
        "selected ports for transmit: {}",
        transmit
            .list_ports()
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let en0 = net.get_port("en0")?;
    let en1 = net.get_port("en1")?;

    let executor = net.executor("packet-tasks")?;
    executor
        .on_task_exception(|ctx, _err| {
            // attempt recovery only once per task
            if ctx.restart_count() == 0 {
                Recovery::RestartDelayed
            } else {
                Recovery::ShutdownGroup
            }
        })
        .max_restarts(3)
        .restart_delay(Duration::from_secs(1));

    // capture workers: acquire, account, release
    let captured = Arc::new(AtomicU64::new(0));
    let seen = captured.clone();
    executor.fork_each(&cap_channels, move |ch| {
        while ch.is_active() {
            match ch.acquire() {
                Ok(packet) => {
                    seen.fetch_add(1, Ordering::Relaxed);
                    ch.release(packet)?;
                }
                Err(e) if e.is_shutdown() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    })?;

    // inline workers: drop fragments-forbidden frames, forward the rest
    executor.fork_each(&ids_channels, |ch| {
        while ch.is_active() {
            match ch.acquire() {
                Ok(mut packet) => {
                    if packet.flags.contains(PacketFlags::TCP_RST) {
                        packet.tx.enabled = false; // do not transmit, drop
                    }
                    ch.release(packet)?;
                }
                Err(e) if e.is_shutdown() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    })?;

    // traffic generators: fill empty pool buffers, transmit on release
    let src_mac = *en0.mac.octets();
    let dst_mac = *en1.mac.octets();
    let tx_port = en1.index;
    executor.fork_each(&gen_channels, move |ch| {
        while ch.is_active() {
            match ch.acquire() {
                Ok(mut packet) => {
                    write_frame(&mut packet, &src_mac, &dst_mac);
                    packet.tx.port = Some(tx_port); // override transmit port
                    ch.release(packet)?; // transmitted on release
                }
                Err(e) if e.is_shutdown() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    })?;

    // token analysis: per-flow state with explicit eviction on terminals
    let state_map: Arc<FlowTable<FlowKey, FlowRecord>> = Arc::new(FlowTable::default());
    let analysis_map = state_map.clone();
    let token_channel = tcp_tokens.clone();
    executor.fork(tcp_tokens.channel(), move |ch| {
        while ch.is_active() {
            let token = match ch.acquire() {
                Ok(token) => token,
                Err(e) if e.is_shutdown() => break,
                Err(e) => return Err(e),
            };
            let flow = token.flow;
            match token.kind {
                TokenKind::StreamSyn => {
                    analysis_map.with_or_insert(flow, |_| FlowRecord::default(), |r| {
                        r.packets += 1
                    });
                }
                TokenKind::StreamFin => {
                    analysis_map.with(&flow, |r| r.closing = true);
                }
                TokenKind::StreamTimeout => {
                    // terminal kind: state is removed globally, right here
                    analysis_map.evict(&flow);
                }
                TokenKind::StreamRst => {
                    analysis_map.with(&flow, |r| r.resets += 1);
                }
                TokenKind::Retransmit => {
                    analysis_map.with(&flow, |r| r.losses += 1);
                }
                TokenKind::DuplicateAck => {
                    analysis_map.with(&flow, |r| r.congestion += 1);
                }
                TokenKind::SegmentOutOfOrder => {
                    analysis_map.with(&flow, |r| r.losses += 1);
                }
                TokenKind::WindowResize => {
                    // not interested, stop delivery of this kind
                    token_channel.disable(TokenKind::WindowResize);
                }
            }
            ch.release(token)?;
        }
        Ok(())
    })?;

    executor.shutdown_after(Duration::from_secs(opts.seconds));

    let interrupt = CancelToken::new();
    install_signal_handler(interrupt.clone());
    match executor.await_completion_cancellable(&interrupt) {
        Ok(()) => (),
        Err(e) if e.is_shutdown() => {
            info!("interrupted, waiting for tasks to wind down");
            executor.await_completion(Some(Duration::from_secs(5)))?;
        }
        Err(e) => return Err(e.into()),
    }

    println!(
        "capture complete: {} packets assigned, {} processed",
        capture.metrics().packets_assigned,
        captured.load(Ordering::Relaxed)
    );
    println!(
        "inline: {} in, {} out; generated: {} frames",
        inline.metrics().packets_delivered,
        inline.tx_metrics().packets_delivered,
        transmit.metrics().packets_delivered
    );
    println!(
        "token capture: {} packets, {} flows still tracked",
        tokens_capture.metrics().packets_assigned,
        state_map.len()
    );
    net.close();
    Ok(())
}

fn write_frame(packet: &mut Packet, src_mac: &[u8; 6], dst_mac: &[u8; 6]) {
    // ethernet header only, payload stays zeroed
    packet.data[..6].copy_from_slice(dst_mac);
    packet.data[6..12].copy_from_slice(src_mac);
    packet.data[12..14].copy_from_slice(&0x0800u16.to_be_bytes()); // ether.type = IPv4
    packet.capture_length = 64;
}

#[cfg(unix)]
fn install_signal_handler(interrupt: CancelToken) {
    use signal_hook::{consts::TERM_SIGNALS, iterator::Signals};

    std::thread::spawn(move || {
        let mut signals = match Signals::new(TERM_SIGNALS) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("signal handler not installed: {}", e);
                return;
            }
        };
        if signals.forever().next().is_some() {
            interrupt.cancel();
        }
    });
}

#[cfg(not(unix))]
fn install_signal_handler(_interrupt: CancelToken) {}
