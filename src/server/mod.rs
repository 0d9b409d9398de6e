//! The holdfast server: tonic service glue around the registries.

mod hold;
pub mod lock;
mod replicator;
pub mod slotkeeper;

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::error::HoldfastError;
use crate::proto::lock_server::{Lock, LockServer};
use crate::proto::slot_keeper_server::{SlotKeeper, SlotKeeperServer};
use crate::proto::{
    lock_hold_request, slot_hold_request, HoldEvent, IsLockedReply, IsLockedRequest,
    LockHoldRequest, SlotHoldRequest, SyncEvent, SyncRequest,
};
use self::replicator::SyncAction;

pub use lock::{LockRegistry, LockStatsSnapshot};
pub use slotkeeper::{SlotRegistry, SlotStatsSnapshot};

struct LockService {
    registry: Arc<LockRegistry>,
}

#[tonic::async_trait]
impl Lock for LockService {
    type HoldStream = ReceiverStream<Result<HoldEvent, Status>>;

    async fn hold(
        &self,
        request: Request<Streaming<LockHoldRequest>>,
    ) -> Result<Response<Self::HoldStream>, Status> {
        let mut inbound = request.into_inner();
        let open = hold::read_open(&mut inbound, self.registry.heartbeat_timeout(), |frame| {
            match frame.msg {
                Some(lock_hold_request::Msg::Open(open)) => Some(open),
                _ => None,
            }
        })
        .await?;

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(self.registry.clone().serve(open, inbound, tx));
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn is_locked(
        &self,
        request: Request<IsLockedRequest>,
    ) -> Result<Response<IsLockedReply>, Status> {
        let req = request.into_inner();
        Ok(Response::new(IsLockedReply {
            locked: self.registry.is_locked(&req.name),
        }))
    }
}

struct SlotKeeperService {
    registry: Arc<SlotRegistry>,
}

#[tonic::async_trait]
impl SlotKeeper for SlotKeeperService {
    type AcquireStream = ReceiverStream<Result<HoldEvent, Status>>;

    async fn acquire(
        &self,
        request: Request<Streaming<SlotHoldRequest>>,
    ) -> Result<Response<Self::AcquireStream>, Status> {
        let mut inbound = request.into_inner();
        let open = hold::read_open(&mut inbound, self.registry.heartbeat_timeout(), |frame| {
            match frame.msg {
                Some(slot_hold_request::Msg::Open(open)) => Some(open),
                _ => None,
            }
        })
        .await?;

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(self.registry.clone().serve(open, inbound, tx));
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type SyncStream = Pin<Box<dyn Stream<Item = Result<SyncEvent, Status>> + Send>>;

    async fn sync(
        &self,
        request: Request<SyncRequest>,
    ) -> Result<Response<Self::SyncStream>, Status> {
        let instance_id = request.into_inner().instance_id;
        info!(instance = %instance_id, "sync subscriber attached");
        let mut rx = self.registry.subscribe(&instance_id);
        let events = stream! {
            while let Some((seq, action)) = rx.recv().await {
                yield Ok::<SyncEvent, Status>(match action {
                    SyncAction::Init(objects) => SyncEvent::init(seq, objects),
                    SyncAction::Update(snapshot) => SyncEvent::update(seq, snapshot),
                    SyncAction::Delete(id) => SyncEvent::deleted(seq, id),
                });
            }
            // The replicator closed the queue: detached or lagging.
            debug!(instance = %instance_id, "sync subscriber queue closed");
        };
        Ok(Response::new(Box::pin(events)))
    }
}

/// A running server. Dropping the handle leaves the server running;
/// call [`ServerHandle::shutdown`] for a graceful stop.
pub struct ServerHandle {
    addr: SocketAddr,
    lock: Option<Arc<LockRegistry>>,
    slots: Option<Arc<SlotRegistry>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<Result<(), tonic::transport::Error>>,
}

impl ServerHandle {
    /// The bound address; useful when the config asked for port 0.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn lock_stats(&self) -> Option<LockStatsSnapshot> {
        self.lock.as_ref().map(|registry| registry.stats())
    }

    pub fn slot_stats(&self) -> Option<SlotStatsSnapshot> {
        self.slots.as_ref().map(|registry| registry.stats())
    }

    /// Stop serving. Open hold streams are ended (their release), sync
    /// subscribers are cut off, and the listener drains; a hard stop
    /// backs the drain in case a connection refuses to finish.
    pub async fn shutdown(mut self) -> Result<(), HoldfastError> {
        if let Some(registry) = &self.lock {
            registry.close();
        }
        if let Some(registry) = &self.slots {
            registry.close();
        }
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match tokio::time::timeout(Duration::from_secs(1), &mut self.task).await {
            Ok(Ok(result)) => result.map_err(HoldfastError::from),
            Ok(Err(_)) => Err(HoldfastError::ConnectionError(
                "server task failed".to_string(),
            )),
            Err(_) => {
                self.task.abort();
                // Wait for the cancellation so the listener is really
                // gone before the caller can rebind the address.
                let _ = self.task.await;
                Ok(())
            }
        }
    }
}

/// Bind and start serving in a background task.
pub async fn spawn(config: ServerConfig) -> Result<ServerHandle, HoldfastError> {
    if !config.enable_lock && !config.enable_slotkeeper {
        return Err(HoldfastError::Config(
            "enable at least one of lock or slotkeeper".to_string(),
        ));
    }

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    let addr = listener.local_addr()?;
    let heartbeat = config.heartbeat_timeout();

    let lock = config.enable_lock.then(|| LockRegistry::new(heartbeat));
    let slots = config
        .enable_slotkeeper
        .then(|| SlotRegistry::new(heartbeat, config.sync_queue_depth()));

    let lock_service = lock
        .clone()
        .map(|registry| LockServer::new(LockService { registry }));
    let slot_service = slots
        .clone()
        .map(|registry| SlotKeeperServer::new(SlotKeeperService { registry }));

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let incoming = TcpListenerStream::new(listener);
    let router = Server::builder()
        .http2_keepalive_interval(Some(Duration::from_secs(30)))
        .http2_keepalive_timeout(Some(Duration::from_secs(5)))
        .add_optional_service(lock_service)
        .add_optional_service(slot_service);

    let task = tokio::spawn(async move {
        router
            .serve_with_incoming_shutdown(incoming, async {
                let _ = shutdown_rx.await;
            })
            .await
    });
    info!(%addr, "holdfast server listening");

    Ok(ServerHandle {
        addr,
        lock,
        slots,
        shutdown: Some(shutdown_tx),
        task,
    })
}
