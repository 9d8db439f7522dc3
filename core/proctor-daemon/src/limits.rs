//! Connection admission.
//!
//! Request connections and streaming connections draw from separate pools so
//! long-lived relay sockets cannot starve one-shot calls.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct ConnectionLimiter {
    name: &'static str,
    max: usize,
    active: AtomicUsize,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimiterSnapshot {
    pub active: usize,
    pub max: usize,
    pub rejected_connections: u64,
}

impl ConnectionLimiter {
    pub fn new(name: &'static str, max: usize) -> Arc<Self> {
        Arc::new(Self {
            name,
            max: max.max(1),
            active: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Takes a slot, or `None` when the pool is full. The slot is released
    /// when the returned permit drops.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionPermit> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.max {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(pool = self.name, max = self.max, "Connection limit reached");
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(ConnectionPermit {
                        limiter: Arc::clone(self),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        LimiterSnapshot {
            active: self.active.load(Ordering::Acquire),
            max: self.max,
            rejected_connections: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct ConnectionPermit {
    limiter: Arc<ConnectionLimiter>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.limiter.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_over_capacity_and_releases_on_drop() {
        let limiter = ConnectionLimiter::new("requests", 2);
        let first = limiter.try_acquire().expect("first");
        let _second = limiter.try_acquire().expect("second");
        assert!(limiter.try_acquire().is_none());
        assert_eq!(limiter.snapshot().rejected_connections, 1);

        drop(first);
        assert_eq!(limiter.snapshot().active, 1);
        assert!(limiter.try_acquire().is_some());
    }
}
