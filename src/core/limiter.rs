/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Admission controllers gating entry into the pipeline.
//!
//! [`ConcurrentLimiter`] is a global FIFO token pool; waiters queue in
//! arrival order and must race acquisition against their query's
//! cancellation. [`ClientQueryLimiter`] bounds in-flight queries per client
//! address over a sharded counter map.

use crate::core::concurrent_map::{ConcurrentMap, TestAndSet};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const CLIENT_MAP_SHARDS: usize = 64;

/// Global FIFO admission gate.
///
/// tokio's semaphore hands out permits in request order, so no waiter can
/// starve. Dropping the permit releases the token.
pub struct ConcurrentLimiter {
    sem: Arc<Semaphore>,
}

impl ConcurrentLimiter {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "limiter capacity must be positive");
        Self {
            sem: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Wait for a token. Callers select this against their cancellation
    /// token; a dropped future leaves the FIFO queue cleanly.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.sem
            .clone()
            .acquire_owned()
            .await
            .expect("limiter semaphore closed")
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}

/// Bounds concurrent queries per client.
///
/// The key is the textual form of the client address; the count for a key is
/// dropped from the map as soon as it reaches zero.
pub struct ClientQueryLimiter {
    max_queries: usize,
    m: ConcurrentMap<usize>,
}

impl ClientQueryLimiter {
    pub fn new(max_queries: usize) -> Self {
        assert!(max_queries > 0, "per-client limit must be positive");
        Self {
            max_queries,
            m: ConcurrentMap::new(CLIENT_MAP_SHARDS),
        }
    }

    /// Try to admit one more query for `key`. Returns false when the client
    /// is already at its limit.
    pub fn acquire(&self, key: &str) -> bool {
        self.m.test_and_set(key, |v| {
            let n = v.copied().unwrap_or(0);
            if n >= self.max_queries {
                return TestAndSet {
                    new_value: None,
                    want_update: false,
                    passed: false,
                };
            }
            TestAndSet {
                new_value: Some(n + 1),
                want_update: true,
                passed: true,
            }
        })
    }

    /// Release one query for `key`. Calling this without a matching
    /// successful `acquire` is a programmer error.
    pub fn done(&self, key: &str) {
        self.m.test_and_set(key, |v| {
            let n = match v {
                Some(n) => *n,
                None => panic!("ClientQueryLimiter::done: no entry for key {}", key),
            };
            if n == 0 {
                panic!("ClientQueryLimiter::done: counter underflow for key {}", key);
            }
            let n = n - 1;
            TestAndSet {
                new_value: if n == 0 { None } else { Some(n) },
                want_update: true,
                passed: true,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn client_limiter_refuses_at_limit_and_recovers() {
        let l = ClientQueryLimiter::new(2);
        assert!(l.acquire("10.0.0.1:53"));
        assert!(l.acquire("10.0.0.1:53"));
        assert!(!l.acquire("10.0.0.1:53"));
        // a different client key is counted independently
        assert!(l.acquire("10.0.0.2:53"));

        l.done("10.0.0.1:53");
        assert!(l.acquire("10.0.0.1:53"));
    }

    #[test]
    #[should_panic(expected = "no entry for key")]
    fn client_limiter_done_without_acquire_panics() {
        let l = ClientQueryLimiter::new(1);
        l.done("203.0.113.9:4242");
    }

    #[tokio::test]
    async fn concurrent_limiter_caps_held_tokens() {
        let l = Arc::new(ConcurrentLimiter::new(2));
        let a = l.acquire().await;
        let _b = l.acquire().await;
        assert_eq!(l.available(), 0);

        let l2 = l.clone();
        let waiter = tokio::spawn(async move { l2.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(a);
        let _c = waiter.await.unwrap();
        assert_eq!(l.available(), 0);
    }

    #[tokio::test]
    async fn concurrent_limiter_is_fifo() {
        let l = Arc::new(ConcurrentLimiter::new(1));
        let first = l.acquire().await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut waiters = Vec::new();
        for i in 0..3 {
            let l = l.clone();
            let order = order.clone();
            waiters.push(tokio::spawn(async move {
                let permit = l.acquire().await;
                order.lock().unwrap().push(i);
                drop(permit);
            }));
            // let the waiter enqueue before spawning the next one
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(first);
        for w in waiters {
            w.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
