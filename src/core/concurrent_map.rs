/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Sharded map with an atomic test-and-set primitive.
//!
//! Keys are spread over a fixed number of shards by hash; only the owning
//! shard's mutex is held while the caller's callback runs, so callbacks must
//! stay short and never block.

use ahash::{AHashMap, RandomState};
use std::hash::BuildHasher;
use std::sync::Mutex;

/// Outcome of a test-and-set callback.
///
/// `new_value` is written back when `want_update` is true; `None` removes
/// the entry. `passed` is returned to the caller unchanged.
pub struct TestAndSet<V> {
    pub new_value: Option<V>,
    pub want_update: bool,
    pub passed: bool,
}

pub struct ConcurrentMap<V> {
    shards: Box<[Mutex<AHashMap<Box<str>, V>>]>,
    hasher: RandomState,
}

impl<V> ConcurrentMap<V> {
    pub fn new(shard_count: usize) -> Self {
        assert!(shard_count > 0, "shard count must be positive");
        let shards = (0..shard_count)
            .map(|_| Mutex::new(AHashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            hasher: RandomState::new(),
        }
    }

    #[inline]
    fn shard(&self, key: &str) -> &Mutex<AHashMap<Box<str>, V>> {
        let idx = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[idx]
    }

    /// Atomically observe the current value for `key` and apply the
    /// callback's decision. Returns the callback's `passed` flag.
    pub fn test_and_set<F>(&self, key: &str, f: F) -> bool
    where
        F: FnOnce(Option<&V>) -> TestAndSet<V>,
    {
        let mut shard = self.shard(key).lock().expect("shard mutex poisoned");
        let decision = f(shard.get(key));
        if decision.want_update {
            match decision.new_value {
                Some(v) => {
                    shard.insert(Box::from(key), v);
                }
                None => {
                    shard.remove(key);
                }
            }
        }
        decision.passed
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("shard mutex poisoned").len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_and_set_inserts_and_removes() {
        let m: ConcurrentMap<u32> = ConcurrentMap::new(64);

        let passed = m.test_and_set("k", |v| {
            assert!(v.is_none());
            TestAndSet {
                new_value: Some(1),
                want_update: true,
                passed: true,
            }
        });
        assert!(passed);
        assert_eq!(m.len(), 1);

        // none + update removes the entry
        m.test_and_set("k", |v| {
            assert_eq!(v, Some(&1));
            TestAndSet {
                new_value: None,
                want_update: true,
                passed: true,
            }
        });
        assert_eq!(m.len(), 0);
    }

    #[test]
    fn failed_decision_leaves_value_untouched() {
        let m: ConcurrentMap<u32> = ConcurrentMap::new(8);
        m.test_and_set("k", |_| TestAndSet {
            new_value: Some(7),
            want_update: true,
            passed: true,
        });

        let passed = m.test_and_set("k", |_| TestAndSet {
            new_value: None,
            want_update: false,
            passed: false,
        });
        assert!(!passed);
        m.test_and_set("k", |v| {
            assert_eq!(v, Some(&7));
            TestAndSet {
                new_value: None,
                want_update: false,
                passed: true,
            }
        });
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let m: Arc<ConcurrentMap<u64>> = Arc::new(ConcurrentMap::new(64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = m.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..1000 {
                    let key = format!("key-{}", i % 16);
                    m.test_and_set(&key, |v| TestAndSet {
                        new_value: Some(v.copied().unwrap_or(0) + 1),
                        want_update: true,
                        passed: true,
                    });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut total = 0;
        for i in 0..16 {
            let key = format!("key-{}", i);
            m.test_and_set(&key, |v| {
                total += v.copied().unwrap_or(0);
                TestAndSet {
                    new_value: None,
                    want_update: false,
                    passed: true,
                }
            });
        }
        assert_eq!(total, 8 * 1000);
    }
}
