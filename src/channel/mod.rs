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

use std::collections::{HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use log::debug;
use parking_lot::{Condvar, Mutex};
use public::counter::{Counter, CounterType, CounterValue, RefCountable};
use public::CancelToken;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Stream channels free a released item's backing resource; pooled channels
/// recycle it to the FIFO tail so buffers cycle in release order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    Stream,
    Pooled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub capacity: usize,
    pub mode: ChannelMode,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CHANNEL_CAPACITY,
            mode: ChannelMode::Stream,
        }
    }
}

/// Transmit attributes of a loan. When enabled, releasing the loan emits
/// the item to the channel's sink; when disabled, the item is discarded
/// (stream) or silently recycled (pooled).
#[derive(Debug, Clone, Copy, Default)]
pub struct TxOptions {
    pub enabled: bool,
    pub port: Option<u32>,
}

/// Downstream delivery seam, registered by transmit/inline builders.
pub trait Emitter<T>: Send + Sync {
    fn emit(&self, item: &T, tx: &TxOptions);
}

pub(crate) struct EmitterCell<T>(pub Box<dyn Emitter<T>>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Draining,
    Closed,
}

#[derive(Debug, Default)]
pub struct ChannelCounter {
    pub injected: AtomicU64,
    pub acquired: AtomicU64,
    pub released: AtomicU64,
    pub emitted: AtomicU64,
    pub abandoned: AtomicU64,
    pub in_flight: AtomicU64,
}

impl RefCountable for ChannelCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "injected",
                CounterType::Counted,
                CounterValue::Unsigned(self.injected.swap(0, Ordering::Relaxed)),
            ),
            (
                "acquired",
                CounterType::Counted,
                CounterValue::Unsigned(self.acquired.swap(0, Ordering::Relaxed)),
            ),
            (
                "released",
                CounterType::Counted,
                CounterValue::Unsigned(self.released.swap(0, Ordering::Relaxed)),
            ),
            (
                "emitted",
                CounterType::Counted,
                CounterValue::Unsigned(self.emitted.swap(0, Ordering::Relaxed)),
            ),
            (
                "abandoned",
                CounterType::Counted,
                CounterValue::Unsigned(self.abandoned.swap(0, Ordering::Relaxed)),
            ),
            (
                "in_flight",
                CounterType::Gauged,
                CounterValue::Unsigned(self.in_flight.load(Ordering::Relaxed)),
            ),
        ]
    }
}

struct State<T> {
    lifecycle: Lifecycle,
    queue: VecDeque<T>,
    outstanding: HashSet<u64>,
    next_loan: u64,
}

pub(crate) struct Shared<T> {
    id: u64,
    name: String,
    capacity: usize,
    mode: ChannelMode,
    active: AtomicBool,
    state: Mutex<State<T>>,
    cond: Condvar,
    default_tx: ArcSwap<TxOptions>,
    emitter: ArcSwapOption<EmitterCell<T>>,
    counter: Arc<ChannelCounter>,
}

impl<T: Send + 'static> Shared<T> {
    fn abandon(&self, token: u64, value: T) {
        let mut state = self.state.lock();
        if !state.outstanding.remove(&token) {
            // close already cleared the bookkeeping
            return;
        }
        self.counter.abandoned.fetch_add(1, Ordering::Relaxed);
        self.counter.in_flight.fetch_sub(1, Ordering::Relaxed);
        if self.mode == ChannelMode::Pooled && state.lifecycle == Lifecycle::Open {
            state.queue.push_back(value);
        }
        self.cond.notify_all();
    }

    fn request_shutdown(&self) {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Open {
            return;
        }
        state.lifecycle = Lifecycle::Draining;
        self.active.store(false, Ordering::Release);
        self.cond.notify_all();
        debug!("channel {} draining", self.name);
    }

    fn force_close(&self) {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Closed {
            return;
        }
        state.lifecycle = Lifecycle::Closed;
        self.active.store(false, Ordering::Release);
        state.queue.clear();
        state.outstanding.clear();
        self.counter.in_flight.store(0, Ordering::Relaxed);
        self.cond.notify_all();
        debug!("channel {} closed", self.name);
    }
}

/// Control surface the executor and the root session use to tear a channel
/// down without knowing its item type.
pub(crate) trait ChannelControl: Send + Sync {
    fn name(&self) -> &str;
    fn shutdown(&self);
    fn close(&self);
}

impl<T: Send + 'static> ChannelControl for Shared<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn shutdown(&self) {
        self.request_shutdown();
    }

    fn close(&self) {
        self.force_close();
    }
}

/// Bounded conduit yielding one item per `acquire` under an exclusive loan,
/// reclaiming it on `release`. At most `capacity` items are in circulation
/// (queued plus loaned) at any instant.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Channel<T> {
    pub fn new<S: AsRef<str>>(name: S, settings: ChannelSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                name: name.as_ref().to_owned(),
                capacity: settings.capacity,
                mode: settings.mode,
                active: AtomicBool::new(true),
                state: Mutex::new(State {
                    lifecycle: Lifecycle::Open,
                    queue: VecDeque::with_capacity(settings.capacity),
                    outstanding: HashSet::new(),
                    next_loan: 0,
                }),
                cond: Condvar::new(),
                default_tx: ArcSwap::from_pointee(TxOptions::default()),
                emitter: ArcSwapOption::const_empty(),
                counter: Arc::new(ChannelCounter::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn mode(&self) -> ChannelMode {
        self.shared.mode
    }

    /// Loop condition for worker tasks. Turns false as soon as shutdown is
    /// requested, before the queue necessarily drains.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn counter(&self) -> Arc<ChannelCounter> {
        self.shared.counter.clone()
    }

    /// Blocks until an item is available, the optional timeout elapses, the
    /// cancel token fires, or the channel stops serving. During draining,
    /// items still queued may be acquired; once none remain the call fails
    /// with `SessionShutdown`.
    pub fn acquire(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<Loan<T>> {
        let deadline = timeout.map(|d| Instant::now() + d);
        // the hook takes the state lock before notifying, so a cancel
        // cannot slip between the flag check below and the wait
        let _wake = cancel.map(|c| {
            let shared = self.shared.clone();
            c.subscribe(move || {
                let _guard = shared.state.lock();
                shared.cond.notify_all();
            })
        });

        let shared = &self.shared;
        let mut state = shared.state.lock();
        loop {
            if let Some(c) = cancel {
                if c.is_cancelled() {
                    return Err(Error::Interrupted);
                }
            }
            match state.lifecycle {
                Lifecycle::Closed => return Err(Error::ChannelClosed(shared.name.clone())),
                Lifecycle::Draining if state.queue.is_empty() => {
                    return Err(Error::SessionShutdown)
                }
                _ => (),
            }
            if let Some(value) = state.queue.pop_front() {
                let token = state.next_loan;
                state.next_loan += 1;
                state.outstanding.insert(token);
                shared.counter.acquired.fetch_add(1, Ordering::Relaxed);
                shared.counter.in_flight.fetch_add(1, Ordering::Relaxed);
                return Ok(Loan {
                    value: Some(value),
                    token,
                    channel_id: shared.id,
                    tx: **shared.default_tx.load(),
                    owner: Arc::downgrade(shared),
                });
            }
            match deadline {
                Some(dl) => {
                    if shared.cond.wait_until(&mut state, dl).timed_out() {
                        return Err(Error::Timeout(timeout.unwrap_or_default()));
                    }
                }
                None => shared.cond.wait(&mut state),
            }
        }
    }

    /// Returns ownership of a loan to the channel. Pooled channels recycle
    /// the buffer at the FIFO tail; if the loan's tx attributes are enabled
    /// the item is first emitted to the configured sink. Releasing a loan
    /// this channel does not consider outstanding fails with `IllegalState`
    /// and changes no counts.
    pub fn release(&self, mut loan: Loan<T>) -> Result<()> {
        let shared = &self.shared;
        if loan.channel_id != shared.id {
            // the loan is dropped intact and returns to its real owner
            return Err(Error::IllegalState(format!(
                "released an item not acquired from channel {}",
                shared.name
            )));
        }
        let value = match loan.value.take() {
            Some(v) => v,
            None => {
                return Err(Error::IllegalState(
                    "released a loan that was already returned".to_owned(),
                ))
            }
        };
        let tx = loan.tx;

        let mut state = shared.state.lock();
        if state.lifecycle == Lifecycle::Closed {
            return Err(Error::ChannelClosed(shared.name.clone()));
        }
        if !state.outstanding.remove(&loan.token) {
            return Err(Error::IllegalState(
                "released an item not currently owned by the caller".to_owned(),
            ));
        }
        shared.counter.released.fetch_add(1, Ordering::Relaxed);
        shared.counter.in_flight.fetch_sub(1, Ordering::Relaxed);

        if tx.enabled {
            if let Some(cell) = shared.emitter.load_full() {
                cell.0.emit(&value, &tx);
                shared.counter.emitted.fetch_add(1, Ordering::Relaxed);
            }
        }
        match shared.mode {
            ChannelMode::Stream => drop(value),
            ChannelMode::Pooled => {
                // during draining released buffers retire instead of
                // recycling, so the pool runs dry and blocked acquirers exit
                if state.lifecycle == Lifecycle::Open {
                    state.queue.push_back(value);
                }
            }
        }
        shared.cond.notify_all();
        Ok(())
    }

    /// Open → Draining: no new items are accepted, queued ones may still be
    /// drained, blocked acquirers with nothing pending wake and fail.
    pub fn shutdown(&self) {
        self.shared.request_shutdown();
    }

    /// Hard close. Idempotent; queued items are dropped and every blocked
    /// call wakes with `ChannelClosed`.
    pub fn close(&self) {
        self.shared.force_close();
    }

    pub fn injector(&self) -> Injector<T> {
        Injector {
            shared: self.shared.clone(),
        }
    }

    pub(crate) fn control(&self) -> Arc<dyn ChannelControl> {
        self.shared.clone()
    }

    pub(crate) fn set_emitter(&self, emitter: Box<dyn Emitter<T>>) {
        self.shared
            .emitter
            .store(Some(Arc::new(EmitterCell(emitter))));
    }

    pub(crate) fn set_default_tx(&self, tx: TxOptions) {
        self.shared.default_tx.store(Arc::new(tx));
    }
}

/// Exclusive loan of one channel item. Dropping a loan without releasing it
/// returns the buffer to a pooled channel (without emission) or frees it,
/// so failed tasks cannot leak pool capacity.
pub struct Loan<T> {
    value: Option<T>,
    token: u64,
    channel_id: u64,
    pub tx: TxOptions,
    owner: Weak<Shared<T>>,
}

impl<T> Deref for Loan<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // value is Some for the whole time a caller can hold the loan
        self.value.as_ref().unwrap()
    }
}

impl<T> DerefMut for Loan<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().unwrap()
    }
}

impl<T> Drop for Loan<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            if let Some(shared) = self.owner.upgrade() {
                let mut state = shared.state.lock();
                if state.outstanding.remove(&self.token) {
                    shared.counter.abandoned.fetch_add(1, Ordering::Relaxed);
                    shared.counter.in_flight.fetch_sub(1, Ordering::Relaxed);
                    if shared.mode == ChannelMode::Pooled
                        && state.lifecycle == Lifecycle::Open
                    {
                        state.queue.push_back(value);
                    }
                    shared.cond.notify_all();
                }
            }
        }
    }
}

/// Producer-side handle given to traffic sources. Sending blocks while the
/// capacity bound (queued + loaned) is met and fails once the channel stops
/// accepting new items.
pub struct Injector<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Injector<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Injector<T> {
    pub fn is_open(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn channel_name(&self) -> &str {
        &self.shared.name
    }

    pub fn send(&self, value: T, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let shared = &self.shared;
        let mut slot = Some(value);
        let mut state = shared.state.lock();
        loop {
            if state.lifecycle != Lifecycle::Open {
                return Err(Error::ChannelClosed(shared.name.clone()));
            }
            if state.queue.len() + state.outstanding.len() < shared.capacity {
                // slot is only taken here, right before returning
                state.queue.push_back(slot.take().unwrap());
                shared.counter.injected.fetch_add(1, Ordering::Relaxed);
                shared.cond.notify_all();
                return Ok(());
            }
            match deadline {
                Some(dl) => {
                    if shared.cond.wait_until(&mut state, dl).timed_out() {
                        return Err(Error::Timeout(timeout.unwrap_or_default()));
                    }
                }
                None => shared.cond.wait(&mut state),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use super::*;

    fn stream(capacity: usize) -> Channel<u64> {
        Channel::new(
            "test-stream",
            ChannelSettings {
                capacity,
                mode: ChannelMode::Stream,
            },
        )
    }

    fn pooled(capacity: usize) -> Channel<u64> {
        let c = Channel::new(
            "test-pool",
            ChannelSettings {
                capacity,
                mode: ChannelMode::Pooled,
            },
        );
        let injector = c.injector();
        for i in 0..capacity as u64 {
            injector.send(i, None).unwrap();
        }
        c
    }

    struct CountingEmitter(AtomicUsize);

    impl Emitter<u64> for CountingEmitter {
        fn emit(&self, _item: &u64, _tx: &TxOptions) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn fifo_delivery() {
        let c = stream(4);
        let injector = c.injector();
        for i in 0..4 {
            injector.send(i, None).unwrap();
        }
        for i in 0..4 {
            let loan = c.acquire(None, None).unwrap();
            assert_eq!(*loan, i);
            c.release(loan).unwrap();
        }
    }

    // P1: queued + loaned never exceeds capacity
    #[test]
    fn capacity_bounds_outstanding_items() {
        let c = stream(2);
        let injector = c.injector();
        injector.send(1, None).unwrap();
        injector.send(2, None).unwrap();

        let a = c.acquire(None, None).unwrap();
        // both items are loaned or queued, a third send must time out
        assert!(matches!(
            injector.send(3, Some(Duration::from_millis(20))),
            Err(Error::Timeout(_))
        ));

        c.release(a).unwrap();
        injector.send(3, Some(Duration::from_millis(100))).unwrap();
        assert_eq!(c.counter().in_flight.load(Ordering::Relaxed), 0);
    }

    // P2: pooled buffers recycle in release order
    #[test]
    fn pooled_recycles_in_release_order() {
        let c = pooled(3);
        let a = c.acquire(None, None).unwrap();
        let b = c.acquire(None, None).unwrap();
        let d = c.acquire(None, None).unwrap();
        let (va, vb, vd) = (*a, *b, *d);

        // release out of original acquire order
        c.release(d).unwrap();
        c.release(a).unwrap();
        c.release(b).unwrap();

        assert_eq!(*c.acquire(None, None).unwrap(), vd);
        assert_eq!(*c.acquire(None, None).unwrap(), va);
        assert_eq!(*c.acquire(None, None).unwrap(), vb);
    }

    // Scenario C: pooled channel with tx disabled never emits, never leaks
    #[test]
    fn pooled_tx_disabled_cycles_without_emission() {
        let c = pooled(2);
        let emitter = Arc::new(CountingEmitter(AtomicUsize::new(0)));
        let counting = emitter.clone();
        struct Fwd(Arc<CountingEmitter>);
        impl Emitter<u64> for Fwd {
            fn emit(&self, item: &u64, tx: &TxOptions) {
                self.0.emit(item, tx);
            }
        }
        c.set_emitter(Box::new(Fwd(counting)));

        for _ in 0..100 {
            let loan = c.acquire(None, None).unwrap();
            assert!(!loan.tx.enabled);
            c.release(loan).unwrap();
        }
        assert_eq!(emitter.0.load(Ordering::Relaxed), 0);
        let counter = c.counter();
        assert_eq!(counter.acquired.load(Ordering::Relaxed), 100);
        assert_eq!(counter.released.load(Ordering::Relaxed), 100);
        assert_eq!(counter.in_flight.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn pooled_tx_enabled_emits_on_release() {
        let c = pooled(2);
        let emitter = Arc::new(CountingEmitter(AtomicUsize::new(0)));
        struct Fwd(Arc<CountingEmitter>);
        impl Emitter<u64> for Fwd {
            fn emit(&self, item: &u64, tx: &TxOptions) {
                self.0.emit(item, tx);
            }
        }
        c.set_emitter(Box::new(Fwd(emitter.clone())));
        c.set_default_tx(TxOptions {
            enabled: true,
            port: Some(1),
        });

        let mut loan = c.acquire(None, None).unwrap();
        assert!(loan.tx.enabled);
        loan.tx.port = Some(7);
        c.release(loan).unwrap();

        let mut loan = c.acquire(None, None).unwrap();
        loan.tx.enabled = false; // per-loan drop decision
        c.release(loan).unwrap();

        assert_eq!(emitter.0.load(Ordering::Relaxed), 1);
        assert_eq!(c.counter().emitted.load(Ordering::Relaxed), 1);
    }

    // Scenario D: releasing a loan owned by another channel is refused and
    // the refusing channel's counts do not move
    #[test]
    fn foreign_release_is_illegal_state() {
        let a = pooled(2);
        let b = pooled(2);
        let loan = a.acquire(None, None).unwrap();

        let released_before = b.counter().released.load(Ordering::Relaxed);
        let in_flight_before = b.counter().in_flight.load(Ordering::Relaxed);
        assert!(matches!(
            b.release(loan),
            Err(Error::IllegalState(_))
        ));
        assert_eq!(b.counter().released.load(Ordering::Relaxed), released_before);
        assert_eq!(
            b.counter().in_flight.load(Ordering::Relaxed),
            in_flight_before
        );

        // the refused loan went back to its real owner on drop
        assert_eq!(a.counter().in_flight.load(Ordering::Relaxed), 0);
        let x = a.acquire(Some(Duration::from_millis(100)), None).unwrap();
        a.release(x).unwrap();
    }

    #[test]
    fn abandoned_loan_returns_to_pool() {
        let c = pooled(1);
        {
            let _loan = c.acquire(None, None).unwrap();
            // dropped without release
        }
        assert_eq!(c.counter().abandoned.load(Ordering::Relaxed), 1);
        let loan = c.acquire(Some(Duration::from_millis(100)), None).unwrap();
        c.release(loan).unwrap();
    }

    #[test]
    fn acquire_times_out_on_empty_channel() {
        let c = stream(4);
        match c.acquire(Some(Duration::from_millis(20)), None) {
            Err(Error::Timeout(_)) => (),
            other => panic!("expected timeout, got {:?}", other.map(|l| *l)),
        }
    }

    // P3: a blocked acquire wakes promptly on shutdown
    #[test]
    fn shutdown_wakes_blocked_acquirers() {
        let c = stream(4);
        let worker = {
            let c = c.clone();
            thread::spawn(move || c.acquire(None, None).map(|l| *l))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(c.is_active());
        c.shutdown();
        assert!(!c.is_active());
        assert!(matches!(worker.join().unwrap(), Err(Error::SessionShutdown)));
    }

    #[test]
    fn cancel_token_interrupts_blocked_acquire() {
        let c = stream(4);
        let token = CancelToken::new();
        let worker = {
            let c = c.clone();
            let token = token.clone();
            thread::spawn(move || c.acquire(None, Some(&token)).map(|l| *l))
        };
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(matches!(worker.join().unwrap(), Err(Error::Interrupted)));
        // channel itself is untouched
        assert!(c.is_active());
    }

    #[test]
    fn draining_serves_pending_items_then_fails() {
        let c = stream(4);
        let injector = c.injector();
        injector.send(1, None).unwrap();
        injector.send(2, None).unwrap();
        c.shutdown();

        assert!(matches!(
            injector.send(3, None),
            Err(Error::ChannelClosed(_))
        ));
        let a = c.acquire(None, None).unwrap();
        assert_eq!(*a, 1);
        c.release(a).unwrap();
        let b = c.acquire(None, None).unwrap();
        assert_eq!(*b, 2);
        c.release(b).unwrap();
        assert!(matches!(c.acquire(None, None), Err(Error::SessionShutdown)));
    }

    // P5: close is idempotent
    #[test]
    fn close_is_idempotent() {
        let c = stream(4);
        let injector = c.injector();
        injector.send(1, None).unwrap();
        c.close();
        c.close();
        assert!(matches!(c.acquire(None, None), Err(Error::ChannelClosed(_))));
        assert!(matches!(
            injector.send(2, None),
            Err(Error::ChannelClosed(_))
        ));
    }

    #[test]
    fn release_after_close_fails() {
        let c = pooled(2);
        let loan = c.acquire(None, None).unwrap();
        c.close();
        assert!(matches!(c.release(loan), Err(Error::ChannelClosed(_))));
    }

    #[test]
    fn multi_consumer_items_delivered_exactly_once() {
        let c = stream(64);
        let injector = c.injector();
        let total = 1000u64;
        let seen = Arc::new(Mutex::new(HashSet::new()));

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let c = c.clone();
                let seen = seen.clone();
                thread::spawn(move || loop {
                    match c.acquire(None, None) {
                        Ok(loan) => {
                            assert!(seen.lock().insert(*loan), "duplicate handout");
                            c.release(loan).unwrap();
                        }
                        Err(_) => break,
                    }
                })
            })
            .collect();

        for i in 0..total {
            injector.send(i, None).unwrap();
        }
        // drain, then stop serving
        while c.counter().released.load(Ordering::Relaxed) < total {
            thread::sleep(Duration::from_millis(1));
        }
        c.shutdown();
        for h in consumers {
            h.join().unwrap();
        }
        assert_eq!(seen.lock().len(), total as usize);
    }
}
