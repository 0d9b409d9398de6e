use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tonic::transport::{Channel, Endpoint};
use url::Url;

use crate::error::HoldfastError;

/// Default interval between client keepalive pings on a hold stream.
pub const DEFAULT_PING_INTERVAL_MS: u64 = 3_000;

/// Default server-side heartbeat timeout before a silent holder is
/// released (mirrors the daemon's `--heartbeat-timeout` default).
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// The holdfast server endpoint URL, e.g. `http://127.0.0.1:47002`.
    pub endpoint: String,
    /// Identifies this process on sync subscriptions. Defaults to a random
    /// UUID per client.
    pub instance_id: Option<String>,
    /// Interval between keepalive pings on hold streams, in milliseconds.
    /// Must stay well below the server's heartbeat timeout. Default: 3000.
    pub ping_interval_ms: Option<u64>,
    /// gRPC channel options
    pub channel_options: ChannelOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Connect timeout in seconds. Default: 10
    pub connect_timeout_secs: Option<u64>,
    /// HTTP/2 keep-alive interval in seconds. Default: 30
    pub http2_keep_alive_interval_secs: Option<u64>,
    /// Keep-alive timeout in seconds. Default: 5
    pub keep_alive_timeout_secs: Option<u64>,
    /// Enable keep-alive while idle. Default: true
    pub keep_alive_while_idle: Option<bool>,
    /// Enable TCP no-delay. Default: true
    pub tcp_nodelay: Option<bool>,
    /// TCP keep-alive interval in seconds. Default: none
    pub tcp_keepalive_secs: Option<u64>,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            instance_id: None,
            ping_interval_ms: None,
            channel_options: ChannelOptions::default(),
        }
    }

    /// Sets the instance id reported on sync subscriptions.
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Sets the keepalive ping interval for hold streams.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    /// Sets custom channel options.
    pub fn with_channel_options(mut self, options: ChannelOptions) -> Self {
        self.channel_options = options;
        self
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.unwrap_or(DEFAULT_PING_INTERVAL_MS))
    }

    /// Build a tonic endpoint with all options applied.
    pub fn endpoint(&self) -> Result<Endpoint, HoldfastError> {
        // Validate up front so the caller gets a URL error rather than an
        // opaque transport error.
        Url::parse(&self.endpoint)?;

        let options = &self.channel_options;
        let mut endpoint = Endpoint::from_shared(self.endpoint.clone())
            .map_err(|e| HoldfastError::ConnectionError(format!("invalid endpoint: {e}")))?
            .connect_timeout(Duration::from_secs(
                options.connect_timeout_secs.unwrap_or(10),
            ))
            .http2_keep_alive_interval(Duration::from_secs(
                options.http2_keep_alive_interval_secs.unwrap_or(30),
            ))
            .keep_alive_timeout(Duration::from_secs(
                options.keep_alive_timeout_secs.unwrap_or(5),
            ))
            .keep_alive_while_idle(options.keep_alive_while_idle.unwrap_or(true))
            .tcp_nodelay(options.tcp_nodelay.unwrap_or(true));

        if let Some(tcp_keepalive_secs) = options.tcp_keepalive_secs {
            endpoint = endpoint.tcp_keepalive(Some(Duration::from_secs(tcp_keepalive_secs)));
        }

        Ok(endpoint)
    }

    pub async fn connect(&self) -> Result<Channel, HoldfastError> {
        let channel = self
            .endpoint()?
            .connect()
            .await
            .map_err(|e| HoldfastError::ConnectionError(format!("connection failed: {e}")))?;
        Ok(channel)
    }
}

/// Configuration for the holdfast server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address.
    pub addr: SocketAddr,
    /// Serve the named lock service.
    pub enable_lock: bool,
    /// Serve the slot keeper (and its sync stream).
    pub enable_slotkeeper: bool,
    /// Hold streams with no inbound frame for this long are released as
    /// timed out, in milliseconds. Default: 10000.
    pub heartbeat_timeout_ms: Option<u64>,
    /// Outbound queue depth per sync subscriber; a subscriber that falls
    /// this far behind is dropped and must resync. Default: 64.
    pub sync_queue_depth: Option<usize>,
}

impl ServerConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            enable_lock: true,
            enable_slotkeeper: true,
            heartbeat_timeout_ms: None,
            sync_queue_depth: None,
        }
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(
            self.heartbeat_timeout_ms
                .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT_MS),
        )
    }

    pub fn sync_queue_depth(&self) -> usize {
        self.sync_queue_depth.unwrap_or(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_rejects_garbage_url() {
        let config = ClientConfig::new("not a url");
        assert!(matches!(
            config.endpoint(),
            Err(HoldfastError::InvalidUrl(_))
        ));
    }

    #[test]
    fn endpoint_accepts_plain_http() {
        let config = ClientConfig::new("http://127.0.0.1:47002");
        assert!(config.endpoint().is_ok());
    }

    #[test]
    fn defaults() {
        let config = ClientConfig::new("http://127.0.0.1:47002");
        assert_eq!(config.ping_interval(), Duration::from_millis(3_000));

        let server = ServerConfig::new("127.0.0.1:47002".parse().unwrap());
        assert_eq!(server.heartbeat_timeout(), Duration::from_millis(10_000));
        assert_eq!(server.sync_queue_depth(), 64);
        assert!(server.enable_lock && server.enable_slotkeeper);
    }
}
