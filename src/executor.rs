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

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use public::counter::{Counter, CounterType, CounterValue, RefCountable};
use public::CancelToken;
use serde::{Deserialize, Serialize};

use crate::channel::{Channel, ChannelControl, Loan};
use crate::error::{Error, Result, TaskFailure};

/// Recovery instruction returned by a group's failure handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Fail,
    Restart,
    RestartDelayed,
    ShutdownGroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Restarting,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    ShuttingDown,
    Closed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub max_restarts: u32,
    #[serde(with = "humantime_serde")]
    pub restart_delay: Duration,
    /// Bound on the implicit join performed by `close`. Workers still stuck
    /// past this point are detached, never waited on forever.
    #[serde(with = "humantime_serde")]
    pub close_grace: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            restart_delay: Duration::from_secs(1),
            close_grace: Duration::from_secs(30),
        }
    }
}

/// Supervision context passed to the failure handler.
pub struct TaskContext {
    name: String,
    index: usize,
    channel: String,
    restart_count: AtomicU32,
}

impl TaskContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::Relaxed)
    }
}

pub type RecoveryHandler = dyn Fn(&TaskContext, &Error) -> Recovery + Send + Sync;

/// Channel handle bound to one supervised task. Blocking calls observe the
/// task's cancel token, so group shutdown wakes the worker without the user
/// function polling anything beyond `is_active`.
pub struct TaskChannel<T> {
    channel: Channel<T>,
    cancel: CancelToken,
}

impl<T: Send + 'static> TaskChannel<T> {
    pub fn acquire(&self) -> Result<Loan<T>> {
        self.channel.acquire(None, Some(&self.cancel))
    }

    pub fn acquire_timeout(&self, timeout: Duration) -> Result<Loan<T>> {
        self.channel.acquire(Some(timeout), Some(&self.cancel))
    }

    pub fn release(&self, loan: Loan<T>) -> Result<()> {
        self.channel.release(loan)
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && self.channel.is_active()
    }

    pub fn name(&self) -> &str {
        self.channel.name()
    }

    pub fn channel(&self) -> &Channel<T> {
        &self.channel
    }
}

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub name: String,
    pub channel: String,
    pub state: TaskState,
    pub restarts: u32,
}

#[derive(Debug, Default)]
pub struct ExecutorCounter {
    pub forked: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub restarts: AtomicU64,
}

impl RefCountable for ExecutorCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "forked",
                CounterType::Counted,
                CounterValue::Unsigned(self.forked.swap(0, Ordering::Relaxed)),
            ),
            (
                "completed",
                CounterType::Counted,
                CounterValue::Unsigned(self.completed.swap(0, Ordering::Relaxed)),
            ),
            (
                "failed",
                CounterType::Counted,
                CounterValue::Unsigned(self.failed.swap(0, Ordering::Relaxed)),
            ),
            (
                "restarts",
                CounterType::Counted,
                CounterValue::Unsigned(self.restarts.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

struct Policy {
    handler: Option<Arc<RecoveryHandler>>,
    max_restarts: u32,
    restart_delay: Duration,
    close_grace: Duration,
}

struct TaskSlot {
    name: String,
    channel: String,
    state: TaskState,
    restarts: u32,
    cancel: CancelToken,
}

struct GroupState {
    phase: Phase,
    tasks: Vec<TaskSlot>,
    live: usize,
    channels: Vec<Arc<dyn ChannelControl>>,
    first_failure: Option<TaskFailure>,
    secondary: Vec<TaskFailure>,
    handles: Vec<JoinHandle<()>>,
}

pub(crate) struct ExecShared {
    name: String,
    created_at: Instant,
    policy: Mutex<Policy>,
    state: Mutex<GroupState>,
    cond: Condvar,
    closed: AtomicBool,
    counter: Arc<ExecutorCounter>,
}

impl ExecShared {
    fn initiate_shutdown_locked(&self, state: &mut GroupState) {
        if state.phase != Phase::Open {
            return;
        }
        state.phase = Phase::ShuttingDown;
        info!("executor {} shutting down {} tasks", self.name, state.tasks.len());
        for channel in state.channels.iter() {
            channel.shutdown();
        }
        for task in state.tasks.iter() {
            task.cancel.cancel();
        }
        self.cond.notify_all();
    }

    fn record_failure(&self, failure: TaskFailure, shutdown_group: bool) {
        let mut state = self.state.lock();
        if state.first_failure.is_none() {
            state.first_failure = Some(failure);
        } else {
            state.secondary.push(failure);
        }
        if shutdown_group {
            self.initiate_shutdown_locked(&mut state);
        }
    }

    fn set_task(&self, index: usize, task_state: TaskState, restarts: u32) {
        let mut state = self.state.lock();
        state.tasks[index].state = task_state;
        state.tasks[index].restarts = restarts;
    }

    fn finish_task(&self, index: usize, terminal: TaskState, restarts: u32) {
        let mut state = self.state.lock();
        state.tasks[index].state = terminal;
        state.tasks[index].restarts = restarts;
        state.live -= 1;
        match terminal {
            TaskState::Completed => self.counter.completed.fetch_add(1, Ordering::Relaxed),
            TaskState::Failed => self.counter.failed.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        if state.live == 0 && state.phase == Phase::ShuttingDown {
            state.phase = Phase::Closed;
        }
        self.cond.notify_all();
    }

    // Returns true if the delay elapsed with the group still open.
    fn wait_restart_delay(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut state = self.state.lock();
        loop {
            if state.phase != Phase::Open {
                return false;
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return state.phase == Phase::Open;
            }
        }
    }

    fn wait_done(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        let deadline = timeout.map(|d| Instant::now() + d);
        // same discipline as Channel::acquire: the hook takes the state
        // lock before notifying so a cancel cannot be missed
        let _wake = cancel.map(|c| {
            let shared = self.clone();
            c.subscribe(move || {
                let _guard = shared.state.lock();
                shared.cond.notify_all();
            })
        });
        let mut state = self.state.lock();
        while state.live > 0 {
            if let Some(c) = cancel {
                if c.is_cancelled() {
                    self.initiate_shutdown_locked(&mut state);
                    return Err(Error::Interrupted);
                }
            }
            match deadline {
                Some(dl) => {
                    if self.cond.wait_until(&mut state, dl).timed_out() {
                        return Err(Error::Timeout(timeout.unwrap_or_default()));
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
        match &state.first_failure {
            Some(first) => {
                let mut failure = first.clone();
                failure.secondary = state.secondary.clone();
                Err(Error::TaskFailure(failure))
            }
            None => Ok(()),
        }
    }

    pub(crate) fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut state = self.state.lock();
            self.initiate_shutdown_locked(&mut state);
        }
        let grace = self.policy.lock().close_grace;
        match self.wait_done(Some(grace), None) {
            Err(Error::Timeout(_)) => {
                error!(
                    "executor {} close timed out after {:?}, detaching stuck workers",
                    self.name, grace
                );
                return;
            }
            Err(e) => debug!("executor {} closed with failure: {}", self.name, e),
            Ok(()) => debug!("executor {} closed", self.name),
        }
        let handles = {
            let mut state = self.state.lock();
            state.handles.drain(..).collect::<Vec<_>>()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// Supervised task group. Forks one worker per channel binding, applies the
/// configured recovery policy to uncaught failures, and joins every task on
/// `await_completion`/`close`.
pub struct TaskExecutor {
    shared: Arc<ExecShared>,
}

impl TaskExecutor {
    pub fn new<S: AsRef<str>>(name: S, settings: ExecutorSettings) -> Self {
        Self {
            shared: Arc::new(ExecShared {
                name: name.as_ref().to_owned(),
                created_at: Instant::now(),
                policy: Mutex::new(Policy {
                    handler: None,
                    max_restarts: settings.max_restarts,
                    restart_delay: settings.restart_delay,
                    close_grace: settings.close_grace,
                }),
                state: Mutex::new(GroupState {
                    phase: Phase::Open,
                    tasks: vec![],
                    live: 0,
                    channels: vec![],
                    first_failure: None,
                    secondary: vec![],
                    handles: vec![],
                }),
                cond: Condvar::new(),
                closed: AtomicBool::new(false),
                counter: Arc::new(ExecutorCounter::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn counter(&self) -> Arc<ExecutorCounter> {
        self.shared.counter.clone()
    }

    pub fn on_task_exception<F>(&self, handler: F) -> &Self
    where
        F: Fn(&TaskContext, &Error) -> Recovery + Send + Sync + 'static,
    {
        self.shared.policy.lock().handler = Some(Arc::new(handler));
        self
    }

    pub fn max_restarts(&self, max_restarts: u32) -> &Self {
        self.shared.policy.lock().max_restarts = max_restarts;
        self
    }

    pub fn restart_delay(&self, delay: Duration) -> &Self {
        self.shared.policy.lock().restart_delay = delay;
        self
    }

    /// Registers and starts one task bound to `channel`. Fails with
    /// `IllegalState` once group shutdown has begun.
    pub fn fork<T, F>(&self, channel: &Channel<T>, f: F) -> Result<&Self>
    where
        T: Send + 'static,
        F: Fn(&TaskChannel<T>) -> Result<()> + Send + Sync + 'static,
    {
        self.fork_inner(channel, Arc::new(f))?;
        Ok(self)
    }

    /// Forks one task per channel, all running the same function.
    pub fn fork_each<T, F>(&self, channels: &[Channel<T>], f: F) -> Result<&Self>
    where
        T: Send + 'static,
        F: Fn(&TaskChannel<T>) -> Result<()> + Send + Sync + 'static,
    {
        let f: Arc<dyn Fn(&TaskChannel<T>) -> Result<()> + Send + Sync> = Arc::new(f);
        for channel in channels {
            self.fork_inner(channel, f.clone())?;
        }
        Ok(self)
    }

    fn fork_inner<T: Send + 'static>(
        &self,
        channel: &Channel<T>,
        f: Arc<dyn Fn(&TaskChannel<T>) -> Result<()> + Send + Sync>,
    ) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.phase != Phase::Open {
            return Err(Error::IllegalState(format!(
                "fork on executor {} after shutdown began",
                shared.name
            )));
        }
        let index = state.tasks.len();
        let task_name = format!("{}-{}", shared.name, index);
        let cancel = CancelToken::new();
        state.tasks.push(TaskSlot {
            name: task_name.clone(),
            channel: channel.name().to_owned(),
            state: TaskState::Running,
            restarts: 0,
            cancel: cancel.clone(),
        });
        state.live += 1;
        let control = channel.control();
        if !state.channels.iter().any(|c| c.name() == control.name()) {
            state.channels.push(control);
        }
        shared.counter.forked.fetch_add(1, Ordering::Relaxed);

        let worker = Worker {
            shared: shared.clone(),
            index,
            ctx: TaskContext {
                name: task_name.clone(),
                index,
                channel: channel.name().to_owned(),
                restart_count: AtomicU32::new(0),
            },
            task_channel: TaskChannel {
                channel: channel.clone(),
                cancel,
            },
            f,
        };
        match thread::Builder::new()
            .name(task_name)
            .spawn(move || worker.run())
        {
            Ok(handle) => {
                state.handles.push(handle);
                Ok(())
            }
            Err(e) => {
                state.tasks.pop();
                state.live -= 1;
                Err(Error::IllegalState(format!(
                    "failed to spawn task thread: {}",
                    e
                )))
            }
        }
    }

    /// Schedules a shutdown request at `delay` past group creation without
    /// blocking the caller.
    pub fn shutdown_after(&self, delay: Duration) -> &Self {
        let shared = self.shared.clone();
        let deadline = shared.created_at + delay;
        let name = format!("{}-timer", shared.name);
        let spawned = thread::Builder::new().name(name).spawn(move || {
            let mut state = shared.state.lock();
            while state.phase == Phase::Open {
                if shared.cond.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
            if state.phase == Phase::Open {
                info!("executor {} deadline reached", shared.name);
                shared.initiate_shutdown_locked(&mut state);
            }
        });
        match spawned {
            Ok(handle) => self.shared.state.lock().handles.push(handle),
            Err(e) => {
                error!("failed to spawn shutdown timer: {}, shutting down now", e);
                self.shutdown();
            }
        }
        self
    }

    /// Requests cooperative shutdown of every task in the group. Bound
    /// channels stop serving acquires and blocked workers wake.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        self.shared.initiate_shutdown_locked(&mut state);
    }

    /// Blocks until every task reached a terminal state. Returns `Ok` iff
    /// no task ended failed; otherwise the first unrecovered failure, with
    /// later ones attached. The timed variant fails with `Timeout` without
    /// killing tasks.
    pub fn await_completion(&self, timeout: Option<Duration>) -> Result<()> {
        self.shared.wait_done(timeout, None)
    }

    /// Like `await_completion`, but stops waiting when `cancel` fires. The
    /// group's shutdown is still requested in that case.
    pub fn await_completion_cancellable(&self, cancel: &CancelToken) -> Result<()> {
        self.shared.wait_done(None, Some(cancel))
    }

    /// Initiates shutdown and performs an implicit, bounded join.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn tasks(&self) -> Vec<TaskReport> {
        self.shared
            .state
            .lock()
            .tasks
            .iter()
            .map(|t| TaskReport {
                name: t.name.clone(),
                channel: t.channel.clone(),
                state: t.state,
                restarts: t.restarts,
            })
            .collect()
    }

    pub(crate) fn shared(&self) -> Arc<ExecShared> {
        self.shared.clone()
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.shared.close();
    }
}

struct Worker<T> {
    shared: Arc<ExecShared>,
    index: usize,
    ctx: TaskContext,
    task_channel: TaskChannel<T>,
    f: Arc<dyn Fn(&TaskChannel<T>) -> Result<()> + Send + Sync>,
}

impl<T: Send + 'static> Worker<T> {
    fn run(self) {
        let Worker {
            shared,
            index,
            ctx,
            task_channel,
            f,
        } = self;
        debug!("task {} started on channel {}", ctx.name, ctx.channel);
        let mut restarts: u32 = 0;
        let terminal = loop {
            let outcome = catch_unwind(AssertUnwindSafe(|| f(&task_channel)));
            let reason = match outcome {
                Ok(Ok(())) => break TaskState::Completed,
                Ok(Err(e)) if e.is_shutdown() => break TaskState::Completed,
                Ok(Err(e)) => e.to_string(),
                Err(payload) => panic_message(payload),
            };

            let (handler, max_restarts, restart_delay) = {
                let policy = shared.policy.lock();
                (
                    policy.handler.clone(),
                    policy.max_restarts,
                    policy.restart_delay,
                )
            };
            let shutting_down = shared.state.lock().phase != Phase::Open;
            let error = Error::TaskFailure(TaskFailure {
                task: ctx.name.clone(),
                channel: ctx.channel.clone(),
                restarts,
                reason: reason.clone(),
                secondary: vec![],
            });
            let mut decision = if shutting_down {
                Recovery::Fail
            } else {
                match &handler {
                    Some(handler) => handler(&ctx, &error),
                    None => Recovery::ShutdownGroup,
                }
            };
            if matches!(decision, Recovery::Restart | Recovery::RestartDelayed)
                && restarts >= max_restarts
            {
                warn!(
                    "task {} exhausted {} restarts, escalating to group shutdown",
                    ctx.name, max_restarts
                );
                decision = Recovery::ShutdownGroup;
            }

            let failure = TaskFailure {
                task: ctx.name.clone(),
                channel: ctx.channel.clone(),
                restarts,
                reason: reason.clone(),
                secondary: vec![],
            };
            match decision {
                Recovery::Fail => {
                    warn!("task {} failed: {}", ctx.name, reason);
                    shared.record_failure(failure, false);
                    break TaskState::Failed;
                }
                Recovery::ShutdownGroup => {
                    error!(
                        "task {} failed, shutting down group {}: {}",
                        ctx.name, shared.name, reason
                    );
                    shared.record_failure(failure, true);
                    break TaskState::Failed;
                }
                Recovery::Restart | Recovery::RestartDelayed => {
                    if decision == Recovery::RestartDelayed {
                        shared.set_task(index, TaskState::Restarting, restarts);
                        if !shared.wait_restart_delay(restart_delay) {
                            // group went down while waiting, nothing to
                            // restart into
                            break TaskState::Completed;
                        }
                    }
                    restarts += 1;
                    ctx.restart_count.store(restarts, Ordering::Relaxed);
                    shared.counter.restarts.fetch_add(1, Ordering::Relaxed);
                    shared.set_task(index, TaskState::Running, restarts);
                    warn!(
                        "task {} restarting ({}/{}): {}",
                        ctx.name, restarts, max_restarts, reason
                    );
                }
            }
        };
        shared.finish_task(index, terminal, restarts);
        debug!("task {} terminal: {:?}", ctx.name, terminal);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::channel::{ChannelMode, ChannelSettings};

    fn stream_channel(capacity: usize) -> Channel<u64> {
        Channel::new(
            "exec-test",
            ChannelSettings {
                capacity,
                mode: ChannelMode::Stream,
            },
        )
    }

    // Scenario A: 4 tasks cycling on a capacity-4 channel, deadline
    // shutdown, clean join, acquire/release totals match
    #[test]
    fn deadline_shutdown_joins_cleanly() {
        let channel = stream_channel(4);
        let injector = channel.injector();
        let producer = thread::spawn(move || {
            let mut i = 0u64;
            loop {
                match injector.send(i, Some(Duration::from_millis(10))) {
                    Ok(()) => i += 1,
                    Err(Error::Timeout(_)) => continue,
                    Err(_) => break,
                }
            }
        });

        let executor = TaskExecutor::new("scenario-a", ExecutorSettings::default());
        for _ in 0..4 {
            executor
                .fork(&channel, |ch| {
                    while ch.is_active() {
                        match ch.acquire() {
                            Ok(loan) => ch.release(loan)?,
                            Err(e) if e.is_shutdown() => break,
                            Err(e) => return Err(e),
                        }
                    }
                    Ok(())
                })
                .unwrap();
        }
        executor.shutdown_after(Duration::from_millis(100));
        executor.await_completion(None).unwrap();
        channel.close();
        producer.join().unwrap();

        let counter = channel.counter();
        let acquired = counter.acquired.load(Ordering::Relaxed);
        let released = counter.released.load(Ordering::Relaxed);
        assert!(acquired > 0);
        assert_eq!(acquired, released);
        assert_eq!(counter.in_flight.load(Ordering::Relaxed), 0);
        for task in executor.tasks() {
            assert_eq!(task.state, TaskState::Completed);
        }
    }

    // Scenario B: always-failing task under RestartDelayed with
    // max_restarts = 3 makes exactly 3 restart attempts then shuts the
    // group down with one aggregated failure
    #[test]
    fn restart_policy_exhaustion_shuts_down_group() {
        let channel = stream_channel(4);
        let executor = TaskExecutor::new("scenario-b", ExecutorSettings::default());
        executor
            .on_task_exception(|_ctx, _err| Recovery::RestartDelayed)
            .max_restarts(3)
            .restart_delay(Duration::from_millis(5));

        executor
            .fork(&channel, |_ch| {
                Err(Error::IllegalState("synthetic failure".to_owned()))
            })
            .unwrap();

        let err = executor.await_completion(None).unwrap_err();
        match err {
            Error::TaskFailure(failure) => {
                assert_eq!(failure.restarts, 3);
                assert!(failure.reason.contains("synthetic failure"));
                assert!(failure.secondary.is_empty());
            }
            other => panic!("expected task failure, got {}", other),
        }

        let tasks = executor.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].state, TaskState::Failed);
        assert_eq!(tasks[0].restarts, 3);
        assert_eq!(executor.counter().restarts.load(Ordering::Relaxed), 3);
    }

    // Default policy: any uncaught failure shuts the whole group down
    #[test]
    fn default_policy_is_shutdown_group() {
        let channel = stream_channel(4);
        let executor = TaskExecutor::new("default-policy", ExecutorSettings::default());

        executor
            .fork(&channel, |ch| {
                while ch.is_active() {
                    match ch.acquire() {
                        Ok(loan) => ch.release(loan)?,
                        Err(e) if e.is_shutdown() => break,
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            })
            .unwrap();
        executor
            .fork(&channel, |_ch| {
                Err(Error::IllegalState("worker blew up".to_owned()))
            })
            .unwrap();

        let err = executor.await_completion(Some(Duration::from_secs(5))).unwrap_err();
        assert!(matches!(err, Error::TaskFailure(_)));

        let tasks = executor.tasks();
        assert_eq!(tasks[0].state, TaskState::Completed);
        assert_eq!(tasks[1].state, TaskState::Failed);
    }

    #[test]
    fn recovered_task_completes_normally() {
        let channel = stream_channel(4);
        channel.injector().send(7, None).unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let executor = TaskExecutor::new("recovering", ExecutorSettings::default());
        executor
            .on_task_exception(|_ctx, _err| Recovery::Restart)
            .max_restarts(2);

        let seen = attempts.clone();
        executor
            .fork(&channel, move |ch| {
                if seen.fetch_add(1, Ordering::Relaxed) == 0 {
                    return Err(Error::IllegalState("first attempt fails".to_owned()));
                }
                let loan = ch.acquire()?;
                ch.release(loan)?;
                Ok(())
            })
            .unwrap();

        executor.await_completion(Some(Duration::from_secs(5))).unwrap();
        let tasks = executor.tasks();
        assert_eq!(tasks[0].state, TaskState::Completed);
        assert_eq!(tasks[0].restarts, 1);
    }

    #[test]
    fn panic_is_a_task_failure() {
        let channel = stream_channel(4);
        let executor = TaskExecutor::new("panicking", ExecutorSettings::default());
        executor.on_task_exception(|_ctx, _err| Recovery::Fail);

        executor
            .fork(&channel, |_ch| -> Result<()> { panic!("boom at frame 3") })
            .unwrap();

        let err = executor.await_completion(Some(Duration::from_secs(5))).unwrap_err();
        match err {
            Error::TaskFailure(failure) => assert!(failure.reason.contains("boom at frame 3")),
            other => panic!("expected task failure, got {}", other),
        }
    }

    // §4.2: fork after shutdown began is a programming error
    #[test]
    fn fork_after_shutdown_is_illegal_state() {
        let channel = stream_channel(4);
        let executor = TaskExecutor::new("terminal", ExecutorSettings::default());
        executor.shutdown();
        let result = executor.fork(&channel, |_ch| Ok(()));
        assert!(matches!(result, Err(Error::IllegalState(_))));
    }

    #[test]
    fn timed_await_expires_without_killing_tasks() {
        let channel = stream_channel(4);
        let executor = TaskExecutor::new("timed", ExecutorSettings::default());
        executor
            .fork(&channel, |ch| {
                while ch.is_active() {
                    match ch.acquire() {
                        Ok(loan) => ch.release(loan)?,
                        Err(e) if e.is_shutdown() => break,
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            })
            .unwrap();

        assert!(matches!(
            executor.await_completion(Some(Duration::from_millis(50))),
            Err(Error::Timeout(_))
        ));
        // the worker is still alive and joins cleanly after shutdown
        executor.shutdown();
        executor.await_completion(Some(Duration::from_secs(5))).unwrap();
    }

    #[test]
    fn cancelled_await_requests_shutdown() {
        let channel = stream_channel(4);
        let executor = TaskExecutor::new("interruptible", ExecutorSettings::default());
        executor
            .fork(&channel, |ch| {
                while ch.is_active() {
                    match ch.acquire() {
                        Ok(loan) => ch.release(loan)?,
                        Err(e) if e.is_shutdown() => break,
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            })
            .unwrap();

        let cancel = CancelToken::new();
        let waiter = {
            let cancel = cancel.clone();
            let shared = executor.shared();
            thread::spawn(move || shared.wait_done(None, Some(&cancel)))
        };
        thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        assert!(matches!(waiter.join().unwrap(), Err(Error::Interrupted)));

        // shutdown was requested on the way out
        assert!(matches!(
            executor.fork(&channel, |_ch| Ok(())),
            Err(Error::IllegalState(_))
        ));
        executor.await_completion(Some(Duration::from_secs(5))).unwrap();
    }

    // P5: close twice, no additional effect, implicit join happened
    #[test]
    fn close_is_idempotent_and_joins() {
        let channel = stream_channel(4);
        let executor = TaskExecutor::new("closer", ExecutorSettings::default());
        executor
            .fork(&channel, |ch| {
                while ch.is_active() {
                    match ch.acquire() {
                        Ok(loan) => ch.release(loan)?,
                        Err(e) if e.is_shutdown() => break,
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            })
            .unwrap();

        executor.close();
        executor.close();
        for task in executor.tasks() {
            assert_eq!(task.state, TaskState::Completed);
        }
    }

    #[test]
    fn fork_each_starts_one_task_per_channel() {
        let channels: Vec<_> = (0..3)
            .map(|i| {
                Channel::<u64>::new(
                    format!("fan-{}", i),
                    ChannelSettings {
                        capacity: 4,
                        mode: ChannelMode::Stream,
                    },
                )
            })
            .collect();
        let executor = TaskExecutor::new("fan-out", ExecutorSettings::default());
        executor
            .fork_each(&channels, |ch| {
                while ch.is_active() {
                    match ch.acquire() {
                        Ok(loan) => ch.release(loan)?,
                        Err(e) if e.is_shutdown() => break,
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(executor.tasks().len(), 3);
        executor.shutdown();
        executor.await_completion(Some(Duration::from_secs(5))).unwrap();
    }
}
