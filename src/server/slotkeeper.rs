//! Capped concurrent slots per named object, shared by workers.
//!
//! An object is created on first sight and lives for the process
//! lifetime. A slot exists while at least one worker token references
//! it; the token is held by a [`WorkerHold`] guard owned by the serving
//! task, so any way the hold stream ends releases it. Mutation,
//! serialisation and publication happen under the per-object lock, which
//! keeps the replicated per-object snapshots in mutation order.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tonic::{Status, Streaming};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::hold::{watch_hold, CloseReason};
use super::replicator::{Replicator, SyncAction};
use crate::proto::{HoldEvent, ObjectSnapshot, SlotHoldRequest, SlotOpen};

struct SlotObject {
    id: String,
    max_slots: u32,
    slots: Mutex<HashMap<String, SlotEntry>>,
}

#[derive(Default)]
struct SlotEntry {
    workers: HashSet<Uuid>,
}

#[derive(Default)]
struct SlotCounters {
    requests: AtomicU64,
    full: AtomicU64,
    created_slots: AtomicU64,
    created_workers: AtomicU64,
    empty: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    timeout: AtomicU64,
    unexpected: AtomicU64,
}

/// Point-in-time view of the registry counters and gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStatsSnapshot {
    pub objects: usize,
    pub slots: usize,
    pub workers: usize,
    pub requests: u64,
    pub created_slots: u64,
    pub created_workers: u64,
    pub full: u64,
    pub empty: u64,
    pub acquired: u64,
    pub released: u64,
    pub timeout: u64,
    pub unexpected: u64,
}

impl fmt::Display for SlotStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} objects, {} slots, {} workers, {} requests, \
             {} created slots, {} created workers, {} full, {} empty, \
             {} acquired, {} released, {} timeout, {} unexpected",
            self.objects,
            self.slots,
            self.workers,
            self.requests,
            self.created_slots,
            self.created_workers,
            self.full,
            self.empty,
            self.acquired,
            self.released,
            self.timeout,
            self.unexpected,
        )
    }
}

pub struct SlotRegistry {
    objects: Mutex<HashMap<String, Arc<SlotObject>>>,
    replicator: Replicator<ObjectSnapshot>,
    counters: SlotCounters,
    heartbeat_timeout: Duration,
    closing: watch::Sender<bool>,
}

/// One worker token inside a slot. Dropping it removes the token,
/// reclaims the slot if it emptied, and publishes the object snapshot.
pub(crate) struct WorkerHold {
    registry: Arc<SlotRegistry>,
    object: Arc<SlotObject>,
    slot_id: String,
    token: Uuid,
}

impl Drop for WorkerHold {
    fn drop(&mut self) {
        self.registry.release(&self.object, &self.slot_id, self.token);
    }
}

impl SlotRegistry {
    pub fn new(heartbeat_timeout: Duration, sync_queue_depth: usize) -> Arc<Self> {
        let (closing, _) = watch::channel(false);
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            replicator: Replicator::new(sync_queue_depth),
            counters: SlotCounters::default(),
            heartbeat_timeout,
            closing,
        })
    }

    /// Stop serving: open acquire streams end as releases and every sync
    /// subscriber queue is closed, letting connections drain during
    /// shutdown.
    pub fn close(&self) {
        self.closing.send_replace(true);
        self.replicator.close();
    }

    pub(crate) fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    pub(crate) fn subscribe(
        &self,
        instance_id: &str,
    ) -> mpsc::Receiver<(u64, SyncAction<ObjectSnapshot>)> {
        self.replicator.subscribe(instance_id)
    }

    fn object(&self, open: &SlotOpen) -> Arc<SlotObject> {
        let mut objects = self.objects.lock();
        match objects.get(&open.object_id) {
            Some(object) => object.clone(),
            None => {
                let object = Arc::new(SlotObject {
                    id: open.object_id.clone(),
                    max_slots: open.max_slots,
                    slots: Mutex::new(HashMap::new()),
                });
                objects.insert(open.object_id.clone(), object.clone());
                self.counters.created_slots.fetch_add(1, Ordering::Relaxed);
                object
            }
        }
    }

    fn snapshot(object: &SlotObject, slots: &HashMap<String, SlotEntry>) -> ObjectSnapshot {
        ObjectSnapshot {
            id: object.id.clone(),
            max_slots: object.max_slots,
            slots: slots.len() as u32,
            workers: slots.values().map(|entry| entry.workers.len() as u32).sum(),
        }
    }

    /// Register a worker in `(object_id, slot_id)`, or deny when the
    /// object is at its slot cap. The requested `max_slots` only matters
    /// the first time an object id is seen.
    pub(crate) fn try_acquire(self: &Arc<Self>, open: &SlotOpen) -> Option<WorkerHold> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let object = self.object(open);

        let token = Uuid::new_v4();
        {
            let mut slots = object.slots.lock();
            if !slots.contains_key(&open.slot_id) {
                if object.max_slots > 0 && slots.len() as u32 >= object.max_slots {
                    drop(slots);
                    self.counters.full.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                self.counters.created_workers.fetch_add(1, Ordering::Relaxed);
            }
            slots
                .entry(open.slot_id.clone())
                .or_default()
                .workers
                .insert(token);
            self.replicator
                .publish(&object.id, Self::snapshot(&object, &slots));
        }

        Some(WorkerHold {
            registry: self.clone(),
            object,
            slot_id: open.slot_id.clone(),
            token,
        })
    }

    fn release(&self, object: &SlotObject, slot_id: &str, token: Uuid) {
        let mut slots = object.slots.lock();
        let emptied = match slots.get_mut(slot_id) {
            Some(entry) => {
                entry.workers.remove(&token);
                entry.workers.is_empty()
            }
            None => false,
        };
        if emptied {
            slots.remove(slot_id);
            self.counters.empty.fetch_add(1, Ordering::Relaxed);
        }
        self.replicator
            .publish(&object.id, Self::snapshot(object, &slots));
    }

    pub fn stats(&self) -> SlotStatsSnapshot {
        let (objects, slots, workers) = {
            let table = self.objects.lock();
            let mut slots = 0;
            let mut workers = 0;
            for object in table.values() {
                let entries = object.slots.lock();
                slots += entries.len();
                workers += entries.values().map(|entry| entry.workers.len()).sum::<usize>();
            }
            (table.len(), slots, workers)
        };
        let c = &self.counters;
        SlotStatsSnapshot {
            objects,
            slots,
            workers,
            requests: c.requests.load(Ordering::Relaxed),
            created_slots: c.created_slots.load(Ordering::Relaxed),
            created_workers: c.created_workers.load(Ordering::Relaxed),
            full: c.full.load(Ordering::Relaxed),
            empty: c.empty.load(Ordering::Relaxed),
            acquired: c.acquired.load(Ordering::Relaxed),
            released: c.released.load(Ordering::Relaxed),
            timeout: c.timeout.load(Ordering::Relaxed),
            unexpected: c.unexpected.load(Ordering::Relaxed),
        }
    }

    /// Serve one acquire stream to completion. Spawned per call by the
    /// service layer after it has read the open frame.
    pub(crate) async fn serve(
        self: Arc<Self>,
        open: SlotOpen,
        mut inbound: Streaming<SlotHoldRequest>,
        tx: mpsc::Sender<Result<HoldEvent, Status>>,
    ) {
        let mut closing = self.closing.subscribe();
        let hold = match self.try_acquire(&open) {
            Some(hold) => hold,
            None => {
                let _ = tx.send(Ok(HoldEvent::granted(false))).await;
                return;
            }
        };

        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        debug!(object = %open.object_id, slot = %open.slot_id, "acquired");

        if tx.send(Ok(HoldEvent::granted(true))).await.is_err() {
            self.counters.released.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let reason = watch_hold(&mut inbound, &tx, &mut closing, self.heartbeat_timeout).await;
        match reason {
            CloseReason::Released => {
                self.counters.released.fetch_add(1, Ordering::Relaxed);
                debug!(object = %open.object_id, slot = %open.slot_id, "released");
            }
            CloseReason::Timeout => {
                self.counters.timeout.fetch_add(1, Ordering::Relaxed);
                info!(object = %open.object_id, slot = %open.slot_id, "timed out");
            }
            CloseReason::Unexpected | CloseReason::Misuse => {
                self.counters.unexpected.fetch_add(1, Ordering::Relaxed);
                warn!(object = %open.object_id, slot = %open.slot_id, "released without close");
            }
        }

        drop(hold);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(object_id: &str, max_slots: u32, slot_id: &str) -> SlotOpen {
        SlotOpen {
            object_id: object_id.to_owned(),
            max_slots,
            slot_id: slot_id.to_owned(),
        }
    }

    fn registry() -> Arc<SlotRegistry> {
        SlotRegistry::new(Duration::from_secs(10), 64)
    }

    #[test]
    fn cap_denies_third_slot_until_one_frees() {
        let registry = registry();
        let first = registry.try_acquire(&open("job", 2, "slot-1"));
        let second = registry.try_acquire(&open("job", 2, "slot-2"));
        assert!(first.is_some() && second.is_some());

        assert!(registry.try_acquire(&open("job", 2, "slot-3")).is_none());
        assert_eq!(registry.stats().full, 1);

        drop(second);
        let third = registry.try_acquire(&open("job", 2, "slot-3"));
        assert!(third.is_some());
    }

    #[test]
    fn workers_share_a_slot() {
        let registry = registry();
        let a = registry.try_acquire(&open("job", 2, "slot-1"));
        let b = registry.try_acquire(&open("job", 2, "slot-1"));
        assert!(a.is_some() && b.is_some());

        let stats = registry.stats();
        assert_eq!((stats.slots, stats.workers), (1, 2));

        drop(a);
        let stats = registry.stats();
        assert_eq!((stats.slots, stats.workers), (1, 1));

        drop(b);
        let stats = registry.stats();
        assert_eq!((stats.slots, stats.workers), (0, 0));
        assert_eq!(stats.empty, 1);
    }

    #[test]
    fn zero_max_slots_is_unbounded() {
        let registry = registry();
        let holds: Vec<_> = (0..32)
            .map(|i| registry.try_acquire(&open("free-for-all", 0, &format!("slot-{i}"))))
            .collect();
        assert!(holds.iter().all(Option::is_some));
        assert_eq!(registry.stats().slots, 32);
    }

    #[test]
    fn recorded_max_slots_is_authoritative() {
        let registry = registry();
        let _a = registry.try_acquire(&open("job", 1, "slot-1"));
        // A later caller lying about the cap does not widen it.
        assert!(registry.try_acquire(&open("job", 5, "slot-2")).is_none());
    }

    #[test]
    fn objects_survive_their_last_worker() {
        let registry = registry();
        let hold = registry.try_acquire(&open("job", 2, "slot-1"));
        drop(hold);
        let stats = registry.stats();
        assert_eq!(stats.objects, 1);
        assert_eq!((stats.slots, stats.workers), (0, 0));
    }

    #[tokio::test]
    async fn every_mutation_publishes_a_snapshot() {
        let registry = registry();
        let mut rx = registry.subscribe("test-viewer");

        let hold = registry.try_acquire(&open("job", 2, "slot-1"));
        drop(hold);

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        assert_eq!(events.len(), 3); // init, acquire update, release update
        match &events[1] {
            (2, SyncAction::Update(snapshot)) => {
                assert_eq!((snapshot.slots, snapshot.workers), (1, 1));
            }
            other => panic!("expected acquire update, got {other:?}"),
        }
        match &events[2] {
            (3, SyncAction::Update(snapshot)) => {
                assert_eq!((snapshot.slots, snapshot.workers), (0, 0));
            }
            other => panic!("expected release update, got {other:?}"),
        }
    }
}
