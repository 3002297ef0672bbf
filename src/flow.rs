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

use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};

use ahash::RandomState;
use parking_lot::RwLock;

const DEFAULT_SHARDS: usize = 16;

/// Keyed state shared by many tasks, sharded to keep lock contention per
/// flow, not global. Removal is an explicit transition (`evict`), state is
/// never dropped implicitly.
pub struct FlowTable<K, V> {
    shards: Vec<RwLock<HashMap<K, V, RandomState>>>,
    hasher: RandomState,
}

impl<K: Hash + Eq, V> Default for FlowTable<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

impl<K: Hash + Eq, V> FlowTable<K, V> {
    pub fn new(shards: usize) -> Self {
        let shards = shards.next_power_of_two();
        Self {
            shards: (0..shards)
                .map(|_| RwLock::new(HashMap::with_hasher(RandomState::new())))
                .collect(),
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, key: &K) -> &RwLock<HashMap<K, V, RandomState>> {
        let h = self.hasher.hash_one(key) as usize;
        &self.shards[h & (self.shards.len() - 1)]
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard(&key).write().insert(key, value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.shard(key).read().contains_key(key)
    }

    /// Runs `f` on the value under the shard lock, creating it first with
    /// `init` if the key is new.
    pub fn with_or_insert<F, I, R>(&self, key: K, init: I, f: F) -> R
    where
        I: FnOnce(&K) -> V,
        F: FnOnce(&mut V) -> R,
    {
        let shard = self.shard(&key);
        let mut guard = shard.write();
        f(guard.entry(key).or_insert_with_key(|k| init(k)))
    }

    /// Reads the value under the shard lock, if present.
    pub fn with<F, R>(&self, key: &K, f: F) -> Option<R>
    where
        F: FnOnce(&mut V) -> R,
    {
        self.shard(key).write().get_mut(key).map(f)
    }

    /// Explicit terminal transition: removes and returns the state.
    pub fn evict(&self, key: &K) -> Option<V> {
        self.shard(key).write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn insert_access_evict() {
        let table: FlowTable<u64, u64> = FlowTable::new(4);
        assert!(table.insert(1, 10).is_none());
        assert!(table.contains(&1));
        assert_eq!(table.with(&1, |v| *v += 1), Some(()));
        assert_eq!(table.evict(&1), Some(11));
        assert_eq!(table.evict(&1), None);
        assert!(table.is_empty());
    }

    #[test]
    fn with_or_insert_creates_once() {
        let table: FlowTable<&'static str, u64> = FlowTable::new(4);
        for _ in 0..5 {
            table.with_or_insert("flow", |_| 0, |v| *v += 1);
        }
        assert_eq!(table.with(&"flow", |v| *v), Some(5));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn concurrent_counters_per_key() {
        let table: Arc<FlowTable<u64, u64>> = Arc::new(FlowTable::new(8));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || {
                    for key in 0..64u64 {
                        table.with_or_insert(key, |_| 0, |v| *v += 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.len(), 64);
        for key in 0..64 {
            assert_eq!(table.with(&key, |v| *v), Some(4));
        }
    }
}
