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
use std::net::{ToSocketAddrs, UdpSocket};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cadence::{prelude::*, Metric, MetricBuilder, StatsdClient, UdpMetricSink};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

pub use public::counter::*;

const STATS_PREFIX: &str = "netchannels";
const TICK_CYCLE: Duration = Duration::from_secs(10);

pub enum StatsOption {
    Tag(&'static str, String),
    Interval(Duration),
}

struct Source {
    module: &'static str,
    interval: Duration,
    countable: Countable,
    tags: Vec<(&'static str, String)>,
    // countdown to next metrics collection
    skip: i64,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{:?}", self.module, self.tags)
    }
}

/// Periodically polls registered countables and forwards the points to a
/// statsd endpoint when one is configured, otherwise to the debug log.
pub struct Collector {
    hostname: String,
    statsd: Option<StatsdClient>,

    sources: Mutex<Vec<Source>>,

    running: Mutex<bool>,
    timer: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    pub fn new<S: AsRef<str>>(hostname: S, statsd_addr: Option<String>) -> Self {
        let statsd = statsd_addr.as_deref().and_then(Self::new_statsd_client);
        Self {
            hostname: hostname.as_ref().to_owned(),
            statsd,
            sources: Mutex::new(vec![]),
            running: Mutex::new(false),
            timer: Condvar::new(),
            thread: Mutex::new(None),
        }
    }

    fn new_statsd_client(addr: &str) -> Option<StatsdClient> {
        let socket = match UdpSocket::bind("0.0.0.0:0") {
            Ok(s) => s,
            Err(e) => {
                warn!("stats socket bind failed: {}", e);
                return None;
            }
        };
        let resolved = match addr.to_socket_addrs().map(|mut a| a.next()) {
            Ok(Some(a)) => a,
            _ => {
                warn!("stats server address {} does not resolve", addr);
                return None;
            }
        };
        match UdpMetricSink::from(resolved, socket) {
            Ok(sink) => {
                info!("stats client connect to {:?}", resolved);
                Some(StatsdClient::from_sink(STATS_PREFIX, sink))
            }
            Err(e) => {
                warn!("stats sink setup failed: {}", e);
                None
            }
        }
    }

    pub fn register_countable(
        &self,
        module: &'static str,
        countable: Countable,
        options: Vec<StatsOption>,
    ) {
        let mut source = Source {
            module,
            interval: TICK_CYCLE,
            countable,
            tags: vec![],
            skip: 0,
        };
        for option in options {
            match option {
                StatsOption::Tag(k, v) if !source.tags.iter().any(|(key, _)| key == &k) => {
                    source.tags.push((k, v))
                }
                StatsOption::Interval(interval) => {
                    source.interval = Duration::from_secs(
                        interval.as_secs() / TICK_CYCLE.as_secs() * TICK_CYCLE.as_secs(),
                    )
                }
                _ => warn!("duplicated tag in stats source {}", source),
            }
        }
        source.skip = (source.interval.as_secs().max(TICK_CYCLE.as_secs())
            / TICK_CYCLE.as_secs()) as i64;
        self.sources.lock().push(source);
    }

    pub fn deregister_countables<'a, I>(&self, countables: I)
    where
        I: Iterator<Item = (&'static str, Vec<StatsOption>)> + 'a,
    {
        let mut tags = vec![];
        let mut sources = self.sources.lock();
        for (module, options) in countables {
            tags.clear();
            for option in options {
                if let StatsOption::Tag(k, v) = option {
                    if !tags.iter().any(|(key, _)| key == &k) {
                        tags.push((k, v));
                    }
                }
            }
            sources.retain(|s| !(s.module == module && s.tags == tags));
        }
    }

    fn send_metrics<'a, T: Metric + From<String>>(
        mut b: MetricBuilder<'a, '_, T>,
        host: &'a str,
        tags: &'a [(&'static str, String)],
    ) {
        let mut has_host = false;
        for (k, v) in tags {
            if *k == "host" {
                has_host = true;
            }
            b = b.with_tag(k, v);
        }
        if !has_host {
            b = b.with_tag("host", host);
        }
        b.send();
    }

    fn tick(&self) {
        let mut sources = self.sources.lock();
        sources.retain(|s| !s.countable.closed());
        for source in sources.iter_mut() {
            source.skip -= 1;
            if source.skip > 0 {
                continue;
            }
            source.skip =
                (source.interval.as_secs().max(TICK_CYCLE.as_secs()) / TICK_CYCLE.as_secs()) as i64;
            let points = source.countable.get_counters();
            if points.is_empty() {
                continue;
            }
            match &self.statsd {
                Some(client) => {
                    for (name, counter_type, value) in points {
                        let full_name = format!("{}_{}", source.module, name);
                        match counter_type {
                            CounterType::Counted => Self::send_metrics(
                                client.count_with_tags(&full_name, value),
                                &self.hostname,
                                &source.tags,
                            ),
                            CounterType::Gauged => Self::send_metrics(
                                client.gauge_with_tags(&full_name, value),
                                &self.hostname,
                                &source.tags,
                            ),
                        }
                    }
                }
                None => debug!("stats {}: {:?}", source, points),
            }
        }
    }

    pub fn start(self: &std::sync::Arc<Self>) {
        {
            let mut running = self.running.lock();
            if *running {
                return;
            }
            *running = true;
        }
        let collector = self.clone();
        let thread = thread::Builder::new()
            .name("stats-collector".to_owned())
            .spawn(move || loop {
                collector.tick();
                let mut running = collector.running.lock();
                if !*running {
                    break;
                }
                collector.timer.wait_for(&mut running, TICK_CYCLE);
                if !*running {
                    break;
                }
            });
        match thread {
            Ok(handle) => *self.thread.lock() = Some(handle),
            Err(e) => warn!("stats collector thread failed to start: {}", e),
        }
    }

    pub fn notify_stop(&self) -> Option<JoinHandle<()>> {
        *self.running.lock() = false;
        self.timer.notify_all();
        self.thread.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    };

    use super::*;

    #[derive(Default)]
    struct Hits(AtomicU64);

    impl RefCountable for Hits {
        fn get_counters(&self) -> Vec<Counter> {
            vec![(
                "hits",
                CounterType::Counted,
                CounterValue::Unsigned(self.0.swap(0, Ordering::Relaxed)),
            )]
        }
    }

    #[test]
    fn closed_sources_are_dropped_on_tick() {
        let collector = Arc::new(Collector::new("test-host", None));
        let hits = Arc::new(Hits::default());
        collector.register_countable(
            "module",
            Countable::Ref(Arc::downgrade(&hits) as Weak<dyn RefCountable>),
            vec![StatsOption::Tag("index", "0".to_owned())],
        );
        assert_eq!(collector.sources.lock().len(), 1);

        drop(hits);
        collector.tick();
        assert_eq!(collector.sources.lock().len(), 0);
    }

    #[test]
    fn deregister_matches_module_and_tags() {
        let collector = Collector::new("test-host", None);
        let a = Arc::new(Hits::default());
        let b = Arc::new(Hits::default());
        collector.register_countable(
            "queue",
            Countable::Ref(Arc::downgrade(&a) as Weak<dyn RefCountable>),
            vec![StatsOption::Tag("index", "0".to_owned())],
        );
        collector.register_countable(
            "queue",
            Countable::Ref(Arc::downgrade(&b) as Weak<dyn RefCountable>),
            vec![StatsOption::Tag("index", "1".to_owned())],
        );

        collector.deregister_countables(
            vec![(
                "queue",
                vec![StatsOption::Tag("index", "0".to_owned())],
            )]
            .into_iter(),
        );
        let sources = collector.sources.lock();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].tags[0].1, "1");
    }

    #[test]
    fn start_stop_is_reentrant() {
        let collector = Arc::new(Collector::new("test-host", None));
        collector.start();
        collector.start();
        let handle = collector.notify_stop();
        assert!(handle.is_some());
        handle.unwrap().join().unwrap();
        assert!(collector.notify_stop().is_none());
    }
}
