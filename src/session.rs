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

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use log::info;
use parking_lot::Mutex;

use crate::channel::{Channel, ChannelControl, ChannelSettings};
use crate::config::NetConfig;
use crate::error::{Error, Result};
use crate::executor::{ExecShared, TaskExecutor};
use crate::net::{
    Backend, CaptureBuilder, CaptureJob, InlineBuilder, Port, SyntheticBackend, TokenChannel,
    TrafficHandle, TransmitBuilder, TransmitJob, TransmitStream,
};
use crate::net::filter::{CompiledFilter, ExprCompiler, FilterCompiler, FilterSpec};
use crate::packet::Packet;
use crate::stats::{self, Countable, RefCountable, StatsOption};

const DEFAULT_TX_BUF_SIZE: usize = 2048;

#[derive(Default)]
struct Children {
    channels: Vec<Arc<dyn ChannelControl>>,
    executors: Vec<Arc<ExecShared>>,
    traffic: Vec<Arc<dyn TrafficHandle>>,
}

struct NetInner {
    backend: Box<dyn Backend>,
    compiler: Box<dyn FilterCompiler>,
    stats: Arc<stats::Collector>,
    channel_defaults: ChannelSettings,
    children: Mutex<Children>,
    closed: AtomicBool,
    executor_defaults: crate::executor::ExecutorSettings,
}

impl NetInner {
    fn teardown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing {} session", self.backend.name());
        let children = std::mem::take(&mut *self.children.lock());
        // producers first, then supervised groups (implicit bounded join),
        // then the channels themselves
        for traffic in children.traffic.iter() {
            traffic.stop();
        }
        for executor in children.executors.iter() {
            executor.close();
        }
        for channel in children.channels.iter() {
            channel.close();
        }
        if let Some(handle) = self.stats.notify_stop() {
            let _ = handle.join();
        }
        info!("{} session closed", self.backend.name());
    }
}

impl Drop for NetInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Root session. Owns every channel, executor and traffic stream created
/// through it; closing the root transitively closes children in a
/// deterministic order, and no child outlives it.
pub struct Net {
    inner: Arc<NetInner>,
}

impl Clone for Net {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Net {
    pub fn with_backend<B: Backend + 'static>(backend: B, config: &NetConfig) -> Self {
        let hostname = config
            .hostname
            .clone()
            .unwrap_or_else(|| "localhost".to_owned());
        let stats = Arc::new(stats::Collector::new(hostname, config.statsd.clone()));
        stats.start();
        info!("session opened on {} backend", backend.name());
        Self {
            inner: Arc::new(NetInner {
                backend: Box::new(backend),
                compiler: Box::new(ExprCompiler),
                stats,
                channel_defaults: config.channel,
                executor_defaults: config.executor,
                children: Mutex::new(Children::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// In-process backend with generated traffic; the default for demos and
    /// tests.
    pub fn synthetic(config: &NetConfig) -> Self {
        Self::with_backend(SyntheticBackend::new(config.synthetic.clone()), config)
    }

    pub fn backend_name(&self) -> &str {
        self.inner.backend.name()
    }

    pub fn stats(&self) -> &Arc<stats::Collector> {
        &self.inner.stats
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::SessionShutdown);
        }
        Ok(())
    }

    /// Creates one channel owned by this session.
    pub fn channel<T: Send + 'static, S: AsRef<str>>(
        &self,
        name: S,
        settings: ChannelSettings,
    ) -> Result<Channel<T>> {
        self.ensure_open()?;
        let channel = Channel::new(name, settings);
        self.inner.stats.register_countable(
            "channel",
            Countable::Ref(Arc::downgrade(&channel.counter()) as Weak<dyn RefCountable>),
            vec![StatsOption::Tag("name", channel.name().to_owned())],
        );
        self.inner.children.lock().channels.push(channel.control());
        Ok(channel)
    }

    pub fn packet_channel<S: AsRef<str>>(&self, name: S) -> Result<Channel<Packet>> {
        self.channel(name, self.inner.channel_defaults)
    }

    pub fn packet_channel_with<S: AsRef<str>>(
        &self,
        name: S,
        settings: ChannelSettings,
    ) -> Result<Channel<Packet>> {
        self.channel(name, settings)
    }

    /// Creates `count` packet channels named `{name}-{i}`.
    pub fn packet_channels<S: AsRef<str>>(
        &self,
        name: S,
        count: usize,
        settings: ChannelSettings,
    ) -> Result<Vec<Channel<Packet>>> {
        (0..count)
            .map(|i| self.channel(format!("{}-{}", name.as_ref(), i), settings))
            .collect()
    }

    pub fn token_channel<S: AsRef<str>>(
        &self,
        name: S,
        settings: ChannelSettings,
    ) -> Result<TokenChannel> {
        Ok(TokenChannel::new(self.channel(name, settings)?))
    }

    /// Creates a supervised task group owned by this session.
    pub fn executor<S: AsRef<str>>(&self, name: S) -> Result<TaskExecutor> {
        self.ensure_open()?;
        let executor = TaskExecutor::new(name, self.inner.executor_defaults);
        self.inner.stats.register_countable(
            "executor",
            Countable::Ref(Arc::downgrade(&executor.counter()) as Weak<dyn RefCountable>),
            vec![StatsOption::Tag("name", executor.name().to_owned())],
        );
        self.inner.children.lock().executors.push(executor.shared());
        Ok(executor)
    }

    pub fn capture<S: AsRef<str>, P: AsRef<str>>(&self, name: S, port: P) -> CaptureBuilder {
        CaptureBuilder {
            net: self.clone(),
            name: name.as_ref().to_owned(),
            port: port.as_ref().to_owned(),
            filter: FilterSpec::new("all"),
            channels: vec![],
            tokens: None,
        }
    }

    pub fn inline<S: AsRef<str>, P: AsRef<str>>(&self, name: S, port: P) -> InlineBuilder {
        InlineBuilder {
            capture: self.capture(name, port),
            tx_enable: true,
            tx_ports: vec![],
        }
    }

    pub fn transmit<S: AsRef<str>>(&self, name: S, ports: &[&str]) -> TransmitBuilder {
        TransmitBuilder {
            net: self.clone(),
            name: name.as_ref().to_owned(),
            ports: ports.iter().map(|p| (*p).to_owned()).collect(),
            channels: vec![],
            tx_enable: true,
            tx_port: None,
            buf_size: DEFAULT_TX_BUF_SIZE,
        }
    }

    /// Name → handle resolution for the backend's ports.
    pub fn get_port(&self, name: &str) -> Result<Port> {
        self.inner
            .backend
            .ports()
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::PortNotFound(name.to_owned()))
    }

    pub fn ports(&self) -> Vec<Port> {
        self.inner.backend.ports()
    }

    /// Empty selection means every port with link up.
    pub(crate) fn resolve_ports(&self, names: &[String]) -> Result<Vec<Port>> {
        if names.is_empty() {
            return Ok(self
                .inner
                .backend
                .ports()
                .into_iter()
                .filter(|p| p.link_up())
                .collect());
        }
        names.iter().map(|n| self.get_port(n)).collect()
    }

    pub(crate) fn compile_filter(&self, spec: &FilterSpec) -> Result<CompiledFilter> {
        self.inner.compiler.compile(spec)
    }

    pub(crate) fn activate_capture(&self, job: CaptureJob) -> Result<Arc<dyn TrafficHandle>> {
        self.ensure_open()?;
        let handle = self.inner.backend.open_capture(job)?;
        self.inner.stats.register_countable(
            "traffic",
            Countable::Ref(Arc::downgrade(&handle.counter()) as Weak<dyn RefCountable>),
            vec![StatsOption::Tag("name", handle.name().to_owned())],
        );
        self.inner.children.lock().traffic.push(handle.clone());
        Ok(handle)
    }

    pub(crate) fn activate_transmit(&self, job: TransmitJob) -> Result<TransmitStream> {
        self.ensure_open()?;
        let stream = self.inner.backend.open_transmit(job)?;
        self.inner.stats.register_countable(
            "traffic",
            Countable::Ref(Arc::downgrade(&stream.handle.counter()) as Weak<dyn RefCountable>),
            vec![StatsOption::Tag("name", stream.handle.name().to_owned())],
        );
        self.inner.children.lock().traffic.push(stream.handle.clone());
        Ok(stream)
    }

    /// Ordered, idempotent teardown: traffic streams stop producing, task
    /// groups shut down and join, channels close, then the session itself.
    pub fn close(&self) {
        self.inner.teardown();
    }
}
