//! Viewer-side replication: a local mirror of every slot object's
//! occupancy, kept live by a background sync task.
//!
//! The task opens the sync stream, requires `(1, init)` first, applies
//! deltas with strict sequence checking, and on any fault (connect
//! failure, transport error, gap, unexpected action, stream end) drops
//! the session, marks the mirror stale and reconnects after a short
//! delay. The mirror tolerates arbitrary server restarts; it is `live`
//! again once a fresh init has been fully applied.

use std::collections::{hash_map::Entry, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::HoldfastError;
use crate::proto::slot_keeper_client::SlotKeeperClient;
use crate::proto::{sync_event, ObjectSnapshot, SyncRequest};

/// Base delay before a failed sync session is retried; a little jitter
/// is added so a restarted server is not hit by every viewer at once.
const RESYNC_DELAY_MS: u64 = 100;

struct MirrorEntry {
    data: ObjectSnapshot,
    updated: Arc<Notify>,
}

pub(crate) struct MirrorShared {
    objects: Mutex<HashMap<String, MirrorEntry>>,
    live: watch::Sender<bool>,
}

impl MirrorShared {
    fn new() -> Arc<Self> {
        let (live, _) = watch::channel(false);
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            live,
        })
    }

    fn upsert(table: &mut HashMap<String, MirrorEntry>, snapshot: ObjectSnapshot) {
        match table.entry(snapshot.id.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.data = snapshot;
                entry.updated.notify_waiters();
            }
            Entry::Vacant(vacant) => {
                vacant
                    .insert(MirrorEntry {
                        data: snapshot,
                        updated: Arc::new(Notify::new()),
                    })
                    .updated
                    .notify_waiters();
            }
        }
    }

    fn apply_init(&self, objects: Vec<ObjectSnapshot>) {
        let mut table = self.objects.lock();
        let mut missing: HashSet<String> = table.keys().cloned().collect();
        for snapshot in objects {
            missing.remove(&snapshot.id);
            Self::upsert(&mut table, snapshot);
        }
        // Ids we knew that the master no longer does did not survive a
        // master restart; drop them.
        for id in missing {
            if let Some(entry) = table.remove(&id) {
                entry.updated.notify_waiters();
            }
        }
    }

    fn apply_update(&self, snapshot: ObjectSnapshot) {
        let mut table = self.objects.lock();
        Self::upsert(&mut table, snapshot);
    }

    fn apply_delete(&self, id: &str) {
        let mut table = self.objects.lock();
        if let Some(entry) = table.remove(id) {
            entry.updated.notify_waiters();
        }
    }

    pub(crate) fn get(&self, id: &str) -> Option<ObjectSnapshot> {
        self.objects.lock().get(id).map(|entry| entry.data.clone())
    }

    /// Notification handle for an object, creating a zero-occupancy
    /// placeholder if the id is not mirrored yet so waiters always have
    /// a stable handle.
    pub(crate) fn update_notify(&self, id: &str, max_slots: u32) -> Arc<Notify> {
        let mut table = self.objects.lock();
        let entry = table.entry(id.to_owned()).or_insert_with(|| MirrorEntry {
            data: ObjectSnapshot {
                id: id.to_owned(),
                max_slots,
                slots: 0,
                workers: 0,
            },
            updated: Arc::new(Notify::new()),
        });
        entry.updated.clone()
    }
}

/// Handle to the background sync task. Dropping it stops the task.
pub struct SlotMirror {
    shared: Arc<MirrorShared>,
    instance_id: String,
    task: JoinHandle<()>,
}

impl SlotMirror {
    pub(crate) fn spawn(config: ClientConfig, instance_id: String) -> Self {
        let shared = MirrorShared::new();
        let task = tokio::spawn(run(shared.clone(), config, instance_id.clone()));
        Self {
            shared,
            instance_id,
            task,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Resolves once the current sync session has applied a full init
    /// snapshot. Blocks across reconnects until the server is reachable.
    pub async fn wait_live(&self) {
        let mut rx = self.shared.live.subscribe();
        let _ = rx.wait_for(|live| *live).await;
    }

    pub fn is_live(&self) -> bool {
        *self.shared.live.subscribe().borrow()
    }

    /// Current mirrored occupancy for an object, if known.
    pub fn snapshot(&self, id: &str) -> Option<ObjectSnapshot> {
        self.shared.get(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.shared.objects.lock().keys().cloned().collect()
    }

    /// Ensure a mirror entry exists for `id`, warning when the recorded
    /// cap differs from the requested one (the recorded value wins).
    pub(crate) fn ensure_entry(&self, id: &str, max_slots: u32) {
        let mut table = self.shared.objects.lock();
        match table.get(id) {
            Some(entry) if entry.data.max_slots != max_slots => {
                warn!(
                    id = %id,
                    recorded = entry.data.max_slots,
                    requested = max_slots,
                    "max_slots differs from recorded value"
                );
            }
            Some(_) => {}
            None => {
                table.insert(
                    id.to_owned(),
                    MirrorEntry {
                        data: ObjectSnapshot {
                            id: id.to_owned(),
                            max_slots,
                            slots: 0,
                            workers: 0,
                        },
                        updated: Arc::new(Notify::new()),
                    },
                );
            }
        }
    }

    pub(crate) fn shared(&self) -> Arc<MirrorShared> {
        self.shared.clone()
    }

    /// Stop the sync task. The mirror keeps its last state but will not
    /// update again.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for SlotMirror {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(shared: Arc<MirrorShared>, config: ClientConfig, instance_id: String) {
    loop {
        shared.live.send_replace(false);
        match sync_session(&shared, &config, &instance_id).await {
            // The session future only returns through an error.
            Err(HoldfastError::StreamEnded) => {
                warn!(instance = %instance_id, "sync stream ended, resyncing");
            }
            Err(error) => {
                warn!(instance = %instance_id, error = %error, "sync stream failed, resyncing");
            }
            Ok(()) => {}
        }
        let jitter = rand::thread_rng().gen_range(0..RESYNC_DELAY_MS / 2);
        tokio::time::sleep(Duration::from_millis(RESYNC_DELAY_MS + jitter)).await;
    }
}

async fn sync_session(
    shared: &MirrorShared,
    config: &ClientConfig,
    instance_id: &str,
) -> Result<(), HoldfastError> {
    let channel = config.connect().await?;
    let mut client = SlotKeeperClient::new(channel);
    let mut stream = client
        .sync(SyncRequest {
            instance_id: instance_id.to_owned(),
        })
        .await?
        .into_inner();

    let mut next_seq = 1u64;
    let mut live = false;
    while let Some(event) = stream.message().await? {
        if event.seq != next_seq {
            return Err(HoldfastError::OutOfSync {
                expected: next_seq,
                got: event.seq,
            });
        }
        next_seq += 1;

        match event.event {
            Some(sync_event::Event::Init(snapshot)) if !live => {
                shared.apply_init(snapshot.objects);
                live = true;
                shared.live.send_replace(true);
                debug!(instance = %instance_id, "sync live");
            }
            Some(sync_event::Event::Update(snapshot)) if live => shared.apply_update(snapshot),
            Some(sync_event::Event::Deleted(id)) if live => shared.apply_delete(&id),
            Some(sync_event::Event::Init(_)) => {
                return Err(HoldfastError::Protocol("init on a live stream".to_string()));
            }
            Some(_) => {
                return Err(HoldfastError::Protocol(
                    "update before the init snapshot".to_string(),
                ));
            }
            None => {
                return Err(HoldfastError::Protocol("empty sync event".to_string()));
            }
        }
    }
    Err(HoldfastError::StreamEnded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str, max_slots: u32, slots: u32, workers: u32) -> ObjectSnapshot {
        ObjectSnapshot {
            id: id.to_owned(),
            max_slots,
            slots,
            workers,
        }
    }

    #[test]
    fn init_replaces_and_prunes() {
        let shared = MirrorShared::new();
        shared.apply_update(snapshot("stale", 1, 1, 1));
        shared.apply_update(snapshot("kept", 2, 1, 1));

        shared.apply_init(vec![snapshot("kept", 2, 2, 3), snapshot("fresh", 4, 0, 0)]);

        assert!(shared.get("stale").is_none());
        assert_eq!(shared.get("kept").map(|s| (s.slots, s.workers)), Some((2, 3)));
        assert!(shared.get("fresh").is_some());
    }

    #[test]
    fn update_is_an_upsert() {
        let shared = MirrorShared::new();
        shared.apply_update(snapshot("a", 2, 1, 1));
        shared.apply_update(snapshot("a", 2, 1, 2));
        assert_eq!(shared.get("a").map(|s| s.workers), Some(2));

        shared.apply_delete("a");
        assert!(shared.get("a").is_none());
    }

    #[test]
    fn update_notify_inserts_placeholder() {
        let shared = MirrorShared::new();
        let _notify = shared.update_notify("new", 3);
        let data = shared.get("new").expect("placeholder inserted");
        assert_eq!((data.max_slots, data.slots, data.workers), (3, 0, 0));
    }

    #[tokio::test]
    async fn waiters_are_woken_by_updates() {
        let shared = MirrorShared::new();
        let notify = shared.update_notify("a", 2);

        let mut notified = std::pin::pin!(notify.notified());
        notified.as_mut().enable();
        shared.apply_update(snapshot("a", 2, 1, 1));

        tokio::time::timeout(Duration::from_secs(1), notified)
            .await
            .expect("update should wake the waiter");
    }

    #[tokio::test]
    async fn notify_handle_stays_stable_across_updates() {
        let shared = MirrorShared::new();
        let notify = shared.update_notify("a", 2);
        shared.apply_update(snapshot("a", 2, 1, 1));

        // The entry already existed; the same Notify must be kept.
        let mut notified = std::pin::pin!(notify.notified());
        notified.as_mut().enable();
        shared.apply_update(snapshot("a", 2, 0, 0));
        tokio::time::timeout(Duration::from_secs(1), notified)
            .await
            .expect("existing entry keeps its notify handle");
    }
}
