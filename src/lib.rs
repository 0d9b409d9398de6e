pub mod client;
pub mod config;
pub mod error;
pub mod mirror;
pub mod proto;
pub mod server;

pub use client::{Keeper, LockClient, LockHold, Slot, SlotClient};
pub use config::{ChannelOptions, ClientConfig, ServerConfig};
pub use error::HoldfastError;
pub use mirror::SlotMirror;
pub use server::{ServerHandle, LockStatsSnapshot, SlotStatsSnapshot};
