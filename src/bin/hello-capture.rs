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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::info;

use netchannels::config::NetConfig;
use netchannels::logger;
use netchannels::stats::Countable;
use netchannels::Net;

/// Minimal capture pipeline: one channel, one task, acquire/release until a
/// deadline shuts the group down.
#[derive(Parser)]
struct Opts {
    /// Specify config file location
    #[clap(short = 'f', long)]
    config_file: Option<String>,

    /// How long to capture
    #[clap(short, long, default_value = "10")]
    seconds: u64,

    /// Capture filter expression
    #[clap(long, default_value = "tcp")]
    filter: String,

    /// Capture port
    #[clap(long, default_value = "en0")]
    port: String,
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let config = match &opts.config_file {
        Some(path) => NetConfig::load(path)?,
        None => NetConfig::default(),
    };
    let (_logger, log_counter) = logger::init(&config.log)?;

    let net = Net::synthetic(&config);
    net.stats()
        .register_countable("log_counter", Countable::Owned(Box::new(log_counter)), vec![]);

    let channel = net.packet_channel("hello-channel")?;
    let capture = net
        .capture("hello-capture", &opts.port)
        .filter(opts.filter.as_str())
        .assign_channel(&channel)
        .apply()?;
    info!("selected port for capture: {}", capture.port().name);

    let count = Arc::new(AtomicU64::new(0));
    let seen = count.clone();
    let executor = net.executor("packet-task")?;
    executor
        .fork(&channel, move |ch| {
            info!("starting packet capture...");
            while ch.is_active() {
                match ch.acquire() {
                    Ok(packet) => {
                        let n = seen.fetch_add(1, Ordering::Relaxed) + 1;
                        if n % 1000 == 0 {
                            info!(
                                "packet #{}: len={}, ts={:?}",
                                n, packet.capture_length, packet.timestamp
                            );
                        }
                        ch.release(packet)?;
                    }
                    Err(e) if e.is_shutdown() => break,
                    Err(e) => return Err(e),
                }
            }
            info!("capture stopped");
            Ok(())
        })?
        .shutdown_after(Duration::from_secs(opts.seconds));
    executor.await_completion(None)?;

    let metrics = capture.metrics();
    println!(
        "capture complete: {} packets assigned, {} processed",
        metrics.packets_assigned,
        count.load(Ordering::Relaxed)
    );
    net.close();
    Ok(())
}
