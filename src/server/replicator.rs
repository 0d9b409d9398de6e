//! Snapshot-plus-delta fan-out to sync subscribers.
//!
//! One mutex guards the last-published snapshot per id, the subscriber
//! set, and every per-subscriber queue. Keeping the init source inside
//! the replicator means attaching never has to reach back into registry
//! or per-object locks, and the attach ordering is exact: a publish
//! either lands in the snapshot a new subscriber is initialised with or
//! is enqueued behind its init.
//!
//! Sequence ids are assigned at enqueue time, under the mutex, so a
//! subscriber observes them strictly in publish order. Queues are
//! bounded; a subscriber that falls a full queue behind is dropped and
//! has to reconnect and re-init.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SyncAction<T> {
    Init(Vec<T>),
    Update(T),
    Delete(String),
}

struct Subscriber<T> {
    instance_id: String,
    next_seq: u64,
    tx: mpsc::Sender<(u64, SyncAction<T>)>,
}

impl<T> Subscriber<T> {
    /// Enqueue one action with the next sequence id. Returns false when
    /// the subscriber should be dropped (detached or lagging).
    fn push(&mut self, action: SyncAction<T>) -> bool {
        let seq = self.next_seq;
        self.next_seq += 1;
        match self.tx.try_send((seq, action)) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => {
                debug!(instance = %self.instance_id, "sync subscriber detached");
                false
            }
            Err(TrySendError::Full(_)) => {
                warn!(instance = %self.instance_id, "sync subscriber lagging, dropping");
                false
            }
        }
    }
}

struct Inner<T> {
    state: HashMap<String, T>,
    subscribers: Vec<Subscriber<T>>,
    closed: bool,
}

pub(crate) struct Replicator<T> {
    inner: Mutex<Inner<T>>,
    queue_depth: usize,
}

impl<T: Clone> Replicator<T> {
    pub(crate) fn new(queue_depth: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: HashMap::new(),
                subscribers: Vec::new(),
                closed: false,
            }),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Record the latest snapshot for `id` and fan it out.
    pub(crate) fn publish(&self, id: &str, snapshot: T) {
        let mut inner = self.inner.lock();
        inner.state.insert(id.to_owned(), snapshot.clone());
        inner
            .subscribers
            .retain_mut(|sub| sub.push(SyncAction::Update(snapshot.clone())));
    }

    /// Forget `id` and tell every subscriber to do the same.
    pub(crate) fn delete(&self, id: &str) {
        let mut inner = self.inner.lock();
        if inner.state.remove(id).is_none() {
            return;
        }
        inner
            .subscribers
            .retain_mut(|sub| sub.push(SyncAction::Delete(id.to_owned())));
    }

    /// Attach a subscriber: its queue starts with `(1, init)` carrying
    /// the full current state, then receives every later publish in
    /// order.
    pub(crate) fn subscribe(&self, instance_id: &str) -> mpsc::Receiver<(u64, SyncAction<T>)> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let mut inner = self.inner.lock();
        if inner.closed {
            // The sender drops here; the subscriber sees an immediate
            // end of stream.
            return rx;
        }
        let snapshot: Vec<T> = inner.state.values().cloned().collect();
        let mut subscriber = Subscriber {
            instance_id: instance_id.to_owned(),
            next_seq: 1,
            tx,
        };
        // Cannot fail: the queue is empty and has capacity >= 1.
        subscriber.push(SyncAction::Init(snapshot));
        inner.subscribers.push(subscriber);
        rx
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Drop every subscriber queue and refuse new ones; their streams
    /// end and can drain.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn drain(rx: &mut mpsc::Receiver<(u64, SyncAction<u32>)>) -> Vec<(u64, SyncAction<u32>)> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn init_reflects_prior_publishes() {
        let replicator = Replicator::new(16);
        replicator.publish("a", 1);
        replicator.publish("b", 2);
        replicator.publish("a", 3);

        let mut rx = replicator.subscribe("viewer-1");
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        let (seq, action) = &events[0];
        assert_eq!(*seq, 1);
        match action {
            SyncAction::Init(snapshot) => {
                let mut values = snapshot.clone();
                values.sort_unstable();
                assert_eq!(values, vec![2, 3]);
            }
            other => panic!("expected init, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sequence_increments_by_one_per_event() {
        let replicator = Replicator::new(16);
        let mut rx = replicator.subscribe("viewer-1");

        replicator.publish("a", 1);
        replicator.publish("a", 2);
        replicator.delete("a");

        let seqs: Vec<u64> = drain(&mut rx).into_iter().map(|(seq, _)| seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn delete_of_unknown_id_emits_nothing() {
        let replicator = Replicator::<u32>::new(16);
        let mut rx = replicator.subscribe("viewer-1");
        replicator.delete("ghost");
        assert_eq!(drain(&mut rx).len(), 1); // just the init
    }

    #[tokio::test]
    async fn lagging_subscriber_is_dropped() {
        let replicator = Replicator::new(2);
        let rx = replicator.subscribe("slowpoke");
        assert_eq!(replicator.subscriber_count(), 1);

        // Queue holds the init plus one update; the next publish overflows.
        replicator.publish("a", 1);
        replicator.publish("a", 2);
        assert_eq!(replicator.subscriber_count(), 0);
        drop(rx);
    }

    #[tokio::test]
    async fn detached_subscriber_is_pruned_on_next_publish() {
        let replicator = Replicator::new(16);
        let rx = replicator.subscribe("gone");
        drop(rx);
        replicator.publish("a", 1);
        assert_eq!(replicator.subscriber_count(), 0);
    }

    proptest! {
        /// Replaying init plus every later update/delete reproduces the
        /// master state exactly, no matter when the subscriber attached.
        #[test]
        fn prop_init_plus_deltas_tracks_state(
            ops in proptest::collection::vec(("[a-d]", any::<u32>(), any::<bool>()), 1..40),
            attach_at in 0usize..40,
        ) {
            let replicator = Replicator::new(256);
            let attach_at = attach_at.min(ops.len());
            let mut rx = None;
            let mut master: HashMap<String, u32> = HashMap::new();

            for (i, (id, value, is_delete)) in ops.iter().enumerate() {
                if i == attach_at {
                    rx = Some(replicator.subscribe("prop"));
                }
                if *is_delete {
                    master.remove(id.as_str());
                    replicator.delete(id);
                } else {
                    master.insert(id.clone(), *value);
                    replicator.publish(id, (id.clone(), *value));
                }
            }
            let mut rx = match rx {
                Some(rx) => rx,
                None => replicator.subscribe("prop"),
            };

            let mut mirror: HashMap<String, u32> = HashMap::new();
            let mut expected_seq = 1;
            while let Ok((seq, action)) = rx.try_recv() {
                prop_assert_eq!(seq, expected_seq);
                match action {
                    SyncAction::Init(snapshot) => {
                        prop_assert_eq!(seq, 1);
                        mirror = snapshot.into_iter().collect();
                    }
                    SyncAction::Update((id, value)) => {
                        mirror.insert(id, value);
                    }
                    SyncAction::Delete(id) => {
                        mirror.remove(&id);
                    }
                }
                expected_seq += 1;
            }
            prop_assert!(expected_seq >= 2);
            prop_assert_eq!(mirror, master);
        }
    }
}
