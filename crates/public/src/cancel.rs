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
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;

type WakeHook = Box<dyn Fn() + Send + Sync>;

/// Cooperative cancellation signal shared between a supervisor and the
/// blocking calls it may need to wake.
///
/// Blocking primitives register a wake hook for the duration of a wait.
/// `cancel` flips the flag before running hooks, so a waiter that rechecks
/// the flag after being woken always observes the cancellation. A hook that
/// takes the waiter's lock before notifying cannot race with a waiter that
/// checked the flag and is about to block.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    hooks: Mutex<Vec<(u64, WakeHook)>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let hooks = self.inner.hooks.lock();
        for (_, hook) in hooks.iter() {
            hook();
        }
    }

    /// Registers a wake hook until the returned subscription is dropped.
    /// Callers must check `is_cancelled` after subscribing to close the
    /// window between a cancel and the registration.
    pub fn subscribe<F>(&self, hook: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.hooks.lock().push((id, Box::new(hook)));
        Subscription {
            inner: self.inner.clone(),
            id,
        }
    }
}

pub struct Subscription {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.hooks.lock().retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    use parking_lot::{Condvar, Mutex};

    use super::*;

    #[test]
    fn cancel_is_sticky_and_idempotent() {
        let fired = Arc::new(AtomicUsize::new(0));
        let token = CancelToken::new();
        let f = fired.clone();
        let _sub = token.subscribe(move || {
            f.fetch_add(1, Ordering::Relaxed);
        });

        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unsubscribed_hook_does_not_fire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let token = CancelToken::new();
        let f = fired.clone();
        let sub = token.subscribe(move || {
            f.fetch_add(1, Ordering::Relaxed);
        });
        drop(sub);
        token.cancel();
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn hook_wakes_a_blocked_waiter() {
        let pair = Arc::new((Mutex::new(()), Condvar::new()));
        let token = CancelToken::new();

        let waiter = {
            let pair = pair.clone();
            let token = token.clone();
            thread::spawn(move || {
                let hook_pair = pair.clone();
                let _sub = token.subscribe(move || {
                    let _guard = hook_pair.0.lock();
                    hook_pair.1.notify_all();
                });
                let mut guard = pair.0.lock();
                while !token.is_cancelled() {
                    pair.1.wait(&mut guard);
                }
            })
        };

        thread::sleep(Duration::from_millis(20));
        token.cancel();
        waiter.join().unwrap();
    }
}
