//! Named mutual exclusion bound to hold streams.
//!
//! Each name maps to an entry whose `tokio` mutex *is* the exported lock:
//! the serving task keeps the owned guard for as long as the client's
//! stream stays open. Entries are held weakly by the registry and vanish
//! once the last holder or waiter drops its strong reference.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tonic::{Status, Streaming};
use tracing::{debug, info, warn};

use super::hold::{watch_hold, CloseReason};
use crate::proto::{HoldEvent, LockHoldRequest, LockOpen};

struct LockEntry {
    mutex: Arc<tokio::sync::Mutex<()>>,
}

impl LockEntry {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            mutex: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    fn is_held(&self) -> bool {
        self.mutex.try_lock().is_err()
    }
}

#[derive(Default)]
struct LockCounters {
    requests: AtomicU64,
    already_locked: AtomicU64,
    try_failed: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    timeout: AtomicU64,
    unexpected: AtomicU64,
    failed: AtomicU64,
    failed_timeout: AtomicU64,
    exceptions: AtomicU64,
}

/// Point-in-time view of the registry counters and gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStatsSnapshot {
    pub requests: u64,
    pub already_locked: u64,
    pub waiting: usize,
    pub active: usize,
    pub try_failed: u64,
    pub acquired: u64,
    pub released: u64,
    pub timeout: u64,
    pub unexpected: u64,
    pub failed: u64,
    pub failed_timeout: u64,
    pub exceptions: u64,
}

impl fmt::Display for LockStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} requests, {} already_locked, {} waiting, {} active, \
             {} try_failed, {} acquired, {} released, {} timeout, {} unexpected, \
             {} failed, {} failed_timeout, {} exceptions",
            self.requests,
            self.already_locked,
            self.waiting,
            self.active,
            self.try_failed,
            self.acquired,
            self.released,
            self.timeout,
            self.unexpected,
            self.failed,
            self.failed_timeout,
            self.exceptions,
        )
    }
}

pub struct LockRegistry {
    locks: Mutex<HashMap<String, Weak<LockEntry>>>,
    waiting: AtomicUsize,
    counters: LockCounters,
    heartbeat_timeout: Duration,
    closing: watch::Sender<bool>,
}

impl LockRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Arc<Self> {
        let (closing, _) = watch::channel(false);
        Arc::new(Self {
            locks: Mutex::new(HashMap::new()),
            waiting: AtomicUsize::new(0),
            counters: LockCounters::default(),
            heartbeat_timeout,
            closing,
        })
    }

    /// Stop serving: every open hold stream ends as a release, letting
    /// connections drain during shutdown.
    pub fn close(&self) {
        self.closing.send_replace(true);
    }

    pub(crate) fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Find or create the entry for a name. Dead weak slots are purged on
    /// the way so the map stays proportional to live entries.
    fn entry(&self, name: &str) -> Arc<LockEntry> {
        let mut locks = self.locks.lock();
        if let Some(entry) = locks.get(name).and_then(Weak::upgrade) {
            return entry;
        }
        locks.retain(|_, weak| weak.strong_count() > 0);
        let entry = LockEntry::new();
        locks.insert(name.to_owned(), Arc::downgrade(&entry));
        entry
    }

    pub fn is_locked(&self, name: &str) -> bool {
        let entry = self.locks.lock().get(name).and_then(Weak::upgrade);
        match entry {
            Some(entry) => entry.is_held(),
            None => false,
        }
    }

    pub fn stats(&self) -> LockStatsSnapshot {
        let active = {
            let locks = self.locks.lock();
            locks.values().filter(|weak| weak.strong_count() > 0).count()
        };
        let c = &self.counters;
        LockStatsSnapshot {
            requests: c.requests.load(Ordering::Relaxed),
            already_locked: c.already_locked.load(Ordering::Relaxed),
            waiting: self.waiting.load(Ordering::Relaxed),
            active,
            try_failed: c.try_failed.load(Ordering::Relaxed),
            acquired: c.acquired.load(Ordering::Relaxed),
            released: c.released.load(Ordering::Relaxed),
            timeout: c.timeout.load(Ordering::Relaxed),
            unexpected: c.unexpected.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            failed_timeout: c.failed_timeout.load(Ordering::Relaxed),
            exceptions: c.exceptions.load(Ordering::Relaxed),
        }
    }

    /// Serve one hold stream to completion. Spawned per call by the
    /// service layer after it has read the open frame.
    pub(crate) async fn serve(
        self: Arc<Self>,
        open: LockOpen,
        mut inbound: Streaming<LockHoldRequest>,
        tx: mpsc::Sender<Result<HoldEvent, Status>>,
    ) {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let mut closing = self.closing.subscribe();
        let name = open.name;
        let entry = self.entry(&name);

        if entry.is_held() {
            self.counters.already_locked.fetch_add(1, Ordering::Relaxed);
        }
        debug!(name = %name, "trying to acquire");

        let guard = if open.nowait {
            // The probe above is advisory; a competing holder can win the
            // mutex between it and here. Never enter the wait queue on a
            // nowait stream.
            match entry.mutex.clone().try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => {
                    self.counters.try_failed.fetch_add(1, Ordering::Relaxed);
                    let _ = tx.send(Ok(HoldEvent::granted(false))).await;
                    return;
                }
            }
        } else {
            self.waiting.fetch_add(1, Ordering::Relaxed);
            let waited = tokio::select! {
                guard = entry.mutex.clone().lock_owned() => Ok(guard),
                reason = watch_hold(&mut inbound, &tx, &mut closing, self.heartbeat_timeout) => {
                    Err(reason)
                }
            };
            self.waiting.fetch_sub(1, Ordering::Relaxed);

            match waited {
                Ok(guard) => guard,
                Err(CloseReason::Timeout) => {
                    self.counters.failed_timeout.fetch_add(1, Ordering::Relaxed);
                    warn!(name = %name, "timed out before getting lock");
                    return;
                }
                Err(CloseReason::Misuse) => {
                    self.counters.exceptions.fetch_add(1, Ordering::Relaxed);
                    warn!(name = %name, "unexpected frame while waiting for lock");
                    let _ = tx
                        .send(Err(Status::invalid_argument(
                            "open frame on an already open stream",
                        )))
                        .await;
                    return;
                }
                Err(_) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(name = %name, "released before getting lock");
                    return;
                }
            }
        };

        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        debug!(name = %name, "acquired");

        if tx.send(Ok(HoldEvent::granted(true))).await.is_err() {
            // Client vanished between acquire and grant; the guard drop
            // below is the release.
            self.counters.released.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let reason = watch_hold(&mut inbound, &tx, &mut closing, self.heartbeat_timeout).await;
        match reason {
            CloseReason::Released => {
                self.counters.released.fetch_add(1, Ordering::Relaxed);
                debug!(name = %name, "released");
            }
            CloseReason::Timeout => {
                self.counters.timeout.fetch_add(1, Ordering::Relaxed);
                info!(name = %name, "timed out");
            }
            CloseReason::Unexpected => {
                self.counters.unexpected.fetch_add(1, Ordering::Relaxed);
                warn!(name = %name, "released with transport error");
            }
            CloseReason::Misuse => {
                self.counters.exceptions.fetch_add(1, Ordering::Relaxed);
                warn!(name = %name, "unexpected frame while holding lock");
                let _ = tx
                    .send(Err(Status::invalid_argument(
                        "open frame on an already open stream",
                    )))
                    .await;
            }
        }

        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn absent_name_reports_unlocked() {
        let registry = LockRegistry::new(Duration::from_secs(10));
        assert!(!registry.is_locked("nope"));
    }

    #[tokio::test]
    async fn held_guard_is_visible_and_entry_reclaimed() {
        let registry = LockRegistry::new(Duration::from_secs(10));

        let entry = registry.entry("jobs/nightly");
        let guard = entry.mutex.clone().lock_owned().await;
        assert!(registry.is_locked("jobs/nightly"));
        assert_eq!(registry.stats().active, 1);

        drop(guard);
        assert!(!registry.is_locked("jobs/nightly"));

        // Last strong reference gone: the weak slot must not resurrect.
        drop(entry);
        assert!(!registry.is_locked("jobs/nightly"));
        assert_eq!(registry.stats().active, 0);
    }

    #[tokio::test]
    async fn same_name_returns_same_entry_while_alive() {
        let registry = LockRegistry::new(Duration::from_secs(10));
        let first = registry.entry("x");
        let second = registry.entry("x");
        assert!(Arc::ptr_eq(&first, &second));

        drop(first);
        drop(second);
        let third = registry.entry("x");
        let _hold = third.mutex.clone().lock_owned().await;
        assert!(registry.is_locked("x"));
    }
}
