//! Client bindings: scoped acquire handles for locks and slots.
//!
//! A hold handle owns the request sender, the response stream and a
//! spawned keepalive ping task. Dropping the handle stops the pings and
//! closes the stream, which is how the server learns about the release;
//! every exit path, including panics unwinding past the handle, releases
//! the resource.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::task::JoinHandle;
use tonic::transport::Channel;
use tonic::Streaming;
use tracing::debug;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::HoldfastError;
use crate::mirror::{MirrorShared, SlotMirror};
use crate::proto::lock_client::LockClient as LockGrpc;
use crate::proto::slot_keeper_client::SlotKeeperClient as SlotKeeperGrpc;
use crate::proto::{
    hold_event, HoldEvent, IsLockedRequest, LockHoldRequest, Ping, SlotHoldRequest,
};

/// How long a slot handle waits for its own acquire/release to show up
/// in the mirror before giving up (non-fatally).
const UPDATE_WAIT: Duration = Duration::from_secs(2);

/// One open hold stream: outbound requests, inbound events, and the
/// keepalive task feeding the server's heartbeat deadline.
struct HoldStream<Req> {
    tx: futures_channel::mpsc::UnboundedSender<Req>,
    inbound: Streaming<HoldEvent>,
    ping_task: JoinHandle<()>,
    echo_seq: u64,
}

impl<Req> Drop for HoldStream<Req> {
    fn drop(&mut self) {
        self.ping_task.abort();
    }
}

impl<Req> HoldStream<Req> {
    async fn first_granted(&mut self) -> Result<bool, HoldfastError> {
        match self.inbound.message().await? {
            Some(HoldEvent {
                event: Some(hold_event::Event::Granted(granted)),
            }) => Ok(granted),
            Some(_) => Err(HoldfastError::Protocol(
                "expected a grant event".to_string(),
            )),
            None => Err(HoldfastError::StreamEnded),
        }
    }

    /// Round-trip one echo ping. Distinguishes "server still there" from
    /// "stream quietly gone" without waiting for the heartbeat to lapse.
    async fn idle(&mut self, make_ping: fn(Ping) -> Req) -> Result<(), HoldfastError> {
        self.echo_seq += 1;
        self.tx
            .unbounded_send(make_ping(Ping {
                id: self.echo_seq,
                echo: true,
            }))
            .map_err(|e| HoldfastError::SendError(e.into_send_error()))?;
        match self.inbound.message().await? {
            Some(_) => Ok(()),
            None => Err(HoldfastError::HoldTimeout(
                "stream closed while idling".to_string(),
            )),
        }
    }
}

fn spawn_ping<Req: Send + 'static>(
    tx: futures_channel::mpsc::UnboundedSender<Req>,
    interval: Duration,
    make_ping: fn(Ping) -> Req,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // Skip first immediate tick
        let mut id = 0u64;
        loop {
            ticker.tick().await;
            id = id.wrapping_add(1);
            if tx
                .unbounded_send(make_ping(Ping { id, echo: false }))
                .is_err()
            {
                break;
            }
        }
    })
}

/// Client for the named lock service.
#[derive(Clone)]
pub struct LockClient {
    channel: Channel,
    ping_interval: Duration,
}

impl LockClient {
    pub async fn connect(config: &ClientConfig) -> Result<Self, HoldfastError> {
        let channel = config.connect().await?;
        Ok(Self {
            channel,
            ping_interval: config.ping_interval(),
        })
    }

    /// Acquire `name`, waiting as long as it takes. The lock is held
    /// until the returned handle is released or dropped.
    ///
    /// Re-acquiring a name this client already holds is not supported
    /// and will simply block until the first hold ends.
    pub async fn lock(&self, name: &str) -> Result<LockHold, HoldfastError> {
        let (granted, stream) = self.open(name, false).await?;
        if !granted {
            // The server only denies on nowait streams.
            return Err(HoldfastError::Protocol(
                "blocking acquire was denied".to_string(),
            ));
        }
        debug!(name = %name, "lock acquired");
        Ok(LockHold {
            name: name.to_owned(),
            client: self.clone(),
            stream,
        })
    }

    /// Acquire `name` only if it is free right now.
    pub async fn try_lock(&self, name: &str) -> Result<Option<LockHold>, HoldfastError> {
        let (granted, stream) = self.open(name, true).await?;
        if !granted {
            return Ok(None);
        }
        debug!(name = %name, "lock acquired");
        Ok(Some(LockHold {
            name: name.to_owned(),
            client: self.clone(),
            stream,
        }))
    }

    pub async fn is_locked(&self, name: &str) -> Result<bool, HoldfastError> {
        let mut grpc = LockGrpc::new(self.channel.clone());
        let reply = grpc
            .is_locked(IsLockedRequest {
                name: name.to_owned(),
            })
            .await?;
        Ok(reply.into_inner().locked)
    }

    async fn open(
        &self,
        name: &str,
        nowait: bool,
    ) -> Result<(bool, HoldStream<LockHoldRequest>), HoldfastError> {
        let (mut tx, rx) = futures_channel::mpsc::unbounded();
        tx.send(LockHoldRequest::open(name, nowait)).await?;

        let mut grpc = LockGrpc::new(self.channel.clone());
        let inbound = grpc.hold(rx).await?.into_inner();
        let ping_task = spawn_ping(tx.clone(), self.ping_interval, LockHoldRequest::ping);
        let mut stream = HoldStream {
            tx,
            inbound,
            ping_task,
            echo_seq: 0,
        };
        let granted = stream.first_granted().await?;
        Ok((granted, stream))
    }
}

/// A held named lock. Dropping the handle releases it.
pub struct LockHold {
    name: String,
    client: LockClient,
    stream: HoldStream<LockHoldRequest>,
}

impl LockHold {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// One echo-ping round trip; errors mean the hold is gone.
    pub async fn idle(&mut self) -> Result<(), HoldfastError> {
        self.stream.idle(LockHoldRequest::ping).await
    }

    pub async fn is_locked(&self) -> Result<bool, HoldfastError> {
        self.client.is_locked(&self.name).await
    }

    /// Release and probe the server once so a follow-up `is_locked`
    /// reflects the release. The probe is best-effort.
    pub async fn release(self) {
        let LockHold {
            name,
            client,
            stream,
        } = self;
        drop(stream);
        let _ = tokio::time::timeout(Duration::from_secs(1), client.is_locked(&name)).await;
        debug!(name = %name, "lock released");
    }
}

impl fmt::Debug for LockHold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHold").field("name", &self.name).finish()
    }
}

/// Client for the slot keeper: acquire handles plus the live mirror of
/// every object's occupancy.
pub struct SlotClient {
    channel: Channel,
    ping_interval: Duration,
    mirror: SlotMirror,
}

impl SlotClient {
    /// Connect and start the background sync task. The mirror becomes
    /// usable once [`SlotClient::wait_live`] resolves.
    pub async fn connect(config: ClientConfig) -> Result<Self, HoldfastError> {
        let channel = config.connect().await?;
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let ping_interval = config.ping_interval();
        let mirror = SlotMirror::spawn(config, instance_id);
        Ok(Self {
            channel,
            ping_interval,
            mirror,
        })
    }

    pub fn mirror(&self) -> &SlotMirror {
        &self.mirror
    }

    pub async fn wait_live(&self) {
        self.mirror.wait_live().await;
    }

    /// Live-updating handle for one object. Unknown ids get a
    /// zero-occupancy placeholder; a cap that differs from the mirrored
    /// value is only warned about, the recorded value wins.
    pub async fn keeper(&self, id: &str, max_slots: u32) -> Keeper {
        self.mirror.wait_live().await;
        self.mirror.ensure_entry(id, max_slots);
        Keeper {
            id: id.to_owned(),
            max_slots,
            shared: self.mirror.shared(),
            channel: self.channel.clone(),
            ping_interval: self.ping_interval,
        }
    }
}

/// Mirrored view of one slot object, and the factory for its slots.
#[derive(Clone)]
pub struct Keeper {
    id: String,
    max_slots: u32,
    shared: Arc<MirrorShared>,
    channel: Channel,
    ping_interval: Duration,
}

impl Keeper {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn max_slots(&self) -> u32 {
        self.shared
            .get(&self.id)
            .map(|data| data.max_slots)
            .unwrap_or(self.max_slots)
    }

    /// Currently occupied slots, as replicated.
    pub fn slots(&self) -> u32 {
        self.shared.get(&self.id).map(|data| data.slots).unwrap_or(0)
    }

    /// Total workers across all slots, as replicated.
    pub fn workers(&self) -> u32 {
        self.shared
            .get(&self.id)
            .map(|data| data.workers)
            .unwrap_or(0)
    }

    pub fn slot(&self, slot_id: &str) -> Slot {
        Slot {
            keeper: self.clone(),
            slot_id: slot_id.to_owned(),
            stream: None,
        }
    }
}

impl fmt::Debug for Keeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Keeper<id={:?}, max={}, slots={}, workers={}>",
            self.id,
            self.max_slots(),
            self.slots(),
            self.workers()
        )
    }
}

/// Scoped acquire handle for one `(object, slot)` pair.
pub struct Slot {
    keeper: Keeper,
    slot_id: String,
    stream: Option<HoldStream<SlotHoldRequest>>,
}

impl Slot {
    pub fn slot_id(&self) -> &str {
        &self.slot_id
    }

    pub fn is_held(&self) -> bool {
        self.stream.is_some()
    }

    /// Try to take (or share) the slot. Returns false when the object is
    /// at its cap. On success, waits briefly for the acquisition to show
    /// up in the mirror so occupancy reads reflect it; missing that
    /// window is not an error.
    pub async fn acquire(&mut self) -> Result<bool, HoldfastError> {
        if self.stream.is_some() {
            return Err(HoldfastError::AlreadyHeld);
        }

        let notify = self
            .keeper
            .shared
            .update_notify(&self.keeper.id, self.keeper.max_slots);
        let mut notified = std::pin::pin!(notify.notified());
        notified.as_mut().enable();

        let (mut tx, rx) = futures_channel::mpsc::unbounded();
        tx.send(SlotHoldRequest::open(
            &self.keeper.id,
            self.keeper.max_slots,
            &self.slot_id,
        ))
        .await?;

        let mut grpc = SlotKeeperGrpc::new(self.keeper.channel.clone());
        let inbound = grpc.acquire(rx).await?.into_inner();
        let ping_task = spawn_ping(tx.clone(), self.keeper.ping_interval, SlotHoldRequest::ping);
        let mut stream = HoldStream {
            tx,
            inbound,
            ping_task,
            echo_seq: 0,
        };

        let granted = stream.first_granted().await?;
        if granted {
            debug!(object = %self.keeper.id, slot = %self.slot_id, "slot acquired");
            self.stream = Some(stream);
            let _ = tokio::time::timeout(UPDATE_WAIT, notified).await;
        }
        Ok(granted)
    }

    /// Release the slot and wait briefly for the mirrored release
    /// update. A no-op when nothing is held.
    pub async fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            let notify = self
                .keeper
                .shared
                .update_notify(&self.keeper.id, self.keeper.max_slots);
            let mut notified = std::pin::pin!(notify.notified());
            notified.as_mut().enable();
            drop(stream);
            let _ = tokio::time::timeout(UPDATE_WAIT, notified).await;
            debug!(object = %self.keeper.id, slot = %self.slot_id, "slot released");
        }
    }

    /// One echo-ping round trip; errors mean the hold is gone.
    pub async fn idle(&mut self) -> Result<(), HoldfastError> {
        match self.stream.as_mut() {
            Some(stream) => stream.idle(SlotHoldRequest::ping).await,
            None => Err(HoldfastError::NotHeld),
        }
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Slot<id={:?}/{:?}, held={}, slots={}, workers={}>",
            self.keeper.id,
            self.slot_id,
            self.is_held(),
            self.keeper.slots(),
            self.keeper.workers()
        )
    }
}
