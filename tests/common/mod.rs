//! Shared setup for the integration suites: an in-process server on an
//! ephemeral port and clients with fast keepalive pings.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use holdfast::server::{self, ServerHandle};
use holdfast::{ClientConfig, ServerConfig};
use tokio::time::Instant;

pub async fn spawn_server(heartbeat: Duration) -> (ServerHandle, ClientConfig) {
    let addr: SocketAddr = "127.0.0.1:0".parse().expect("listen address");
    spawn_server_at(addr, heartbeat).await
}

pub async fn spawn_server_at(
    addr: SocketAddr,
    heartbeat: Duration,
) -> (ServerHandle, ClientConfig) {
    let config = ServerConfig::new(addr).with_heartbeat_timeout(heartbeat);
    let handle = server::spawn(config).await.expect("server should start");
    let client = ClientConfig::new(format!("http://{}", handle.addr()))
        .with_ping_interval(Duration::from_millis(100));
    (handle, client)
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
