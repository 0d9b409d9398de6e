//! Shared machinery for stream-bound holds.
//!
//! A held resource lives exactly as long as its hold stream: the serving
//! task owns an RAII guard (the lock's mutex guard, the slot's worker
//! token) and [`watch_hold`] decides when the stream is over and why.
//! The guard drops on every exit path, so release runs exactly once no
//! matter how the stream ends.

use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tonic::{Code, Status, Streaming};

use crate::proto::{
    lock_hold_request, slot_hold_request, HoldEvent, LockHoldRequest, Ping, SlotHoldRequest,
};

/// Why a hold stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// Client half-closed or cancelled the call.
    Released,
    /// No inbound frame within the heartbeat timeout.
    Timeout,
    /// Transport error mid-stream.
    Unexpected,
    /// Protocol misuse, e.g. a second open frame.
    Misuse,
}

/// A frame on a hold stream after the open frame.
pub(crate) trait HoldFrame: Send + 'static {
    fn into_ping(self) -> Option<Ping>;
}

impl HoldFrame for LockHoldRequest {
    fn into_ping(self) -> Option<Ping> {
        match self.msg {
            Some(lock_hold_request::Msg::Ping(ping)) => Some(ping),
            _ => None,
        }
    }
}

impl HoldFrame for SlotHoldRequest {
    fn into_ping(self) -> Option<Ping> {
        match self.msg {
            Some(slot_hold_request::Msg::Ping(ping)) => Some(ping),
            _ => None,
        }
    }
}

/// Read the opening frame of a hold stream, bounded by the heartbeat
/// timeout so a silent caller cannot park a handler forever.
pub(crate) async fn read_open<F, T>(
    inbound: &mut Streaming<F>,
    heartbeat_timeout: Duration,
    extract: impl FnOnce(F) -> Option<T>,
) -> Result<T, Status> {
    let frame = tokio::time::timeout(heartbeat_timeout, inbound.message())
        .await
        .map_err(|_| Status::deadline_exceeded("no open frame within heartbeat timeout"))??
        .ok_or_else(|| Status::invalid_argument("stream closed before open frame"))?;

    extract(frame).ok_or_else(|| Status::invalid_argument("first frame must be an open frame"))
}

/// Watch a hold stream until it ends.
///
/// Re-arms the heartbeat deadline on every inbound frame, answers echo
/// pings with pongs, and classifies the terminal condition. Also resolves
/// when the outbound side closes (the client stopped reading) or the
/// registry is shutting down; both are treated as a release.
///
/// Pongs are sent without waiting: blocking on the outbound queue would
/// stop the loop from enforcing the deadline. A peer whose queue is full
/// is not draining its replies and is dropped, like a lagging sync
/// subscriber.
pub(crate) async fn watch_hold<F: HoldFrame>(
    inbound: &mut Streaming<F>,
    tx: &mpsc::Sender<Result<HoldEvent, Status>>,
    closing: &mut watch::Receiver<bool>,
    heartbeat_timeout: Duration,
) -> CloseReason {
    let mut deadline = Instant::now() + heartbeat_timeout;
    loop {
        tokio::select! {
            frame = inbound.message() => match frame {
                Ok(Some(frame)) => match frame.into_ping() {
                    Some(ping) => {
                        deadline = Instant::now() + heartbeat_timeout;
                        if ping.echo {
                            match tx.try_send(Ok(HoldEvent::pong(ping.id))) {
                                Ok(()) => {}
                                Err(TrySendError::Closed(_)) => return CloseReason::Released,
                                Err(TrySendError::Full(_)) => return CloseReason::Unexpected,
                            }
                        }
                    }
                    None => return CloseReason::Misuse,
                },
                Ok(None) => return CloseReason::Released,
                Err(status) => return classify_status(&status),
            },
            _ = tokio::time::sleep_until(deadline) => return CloseReason::Timeout,
            _ = tx.closed() => return CloseReason::Released,
            _ = closing.wait_for(|closing| *closing) => return CloseReason::Released,
        }
    }
}

fn classify_status(status: &Status) -> CloseReason {
    match status.code() {
        // A cancelled call is the client letting go of the stream.
        Code::Cancelled => CloseReason::Released,
        _ => CloseReason::Unexpected,
    }
}
