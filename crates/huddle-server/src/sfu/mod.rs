//! SFU coordination layer
//!
//! Voice rooms are routed through relay workers. This module owns everything
//! between the signaling socket and those workers: the worker allocator and
//! per-room router cache, the room membership registry, shared-browser
//! arbitration and the signaling coordinator that drives them.

mod allocator;
mod browser;
mod coordinator;
#[cfg(test)]
mod local;
mod registry;
mod relay;
mod rtc;
mod worker;

pub use allocator::WorkerAllocator;
pub use browser::{BrowserError, SharedBrowserSession};
pub use coordinator::{Coordinator, Peer};
pub use registry::{
    ConsumerRecord, PeerSession, ProducerRecord, RegistryError, RoomRegistry, RoomStats,
};
pub use relay::{
    ConsumerOptions, RelayError, RelayEvent, RelayWorker, RouterHandle, WorkerSpawner,
};
pub use rtc::RtcWorkerSpawner;

use huddle_protocol::RtpCodecCapability;
use serde::Deserialize;
use std::time::Duration;

/// Relay pool settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Number of relay workers in the pool
    pub workers: usize,
    /// Address the workers listen on
    pub listen_ip: String,
    /// Address advertised in ICE candidates when behind NAT
    pub announced_address: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// Applied to every new transport, best effort (bits per second)
    pub max_incoming_bitrate: Option<u32>,
    /// Highest per-transport incoming bitrate a worker accepts
    pub worker_bitrate_limit: u32,
    /// Codecs every router is created with
    pub codecs: Vec<RtpCodecCapability>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            listen_ip: "0.0.0.0".to_string(),
            announced_address: None,
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            max_incoming_bitrate: Some(1_500_000),
            worker_bitrate_limit: 10_000_000,
            codecs: vec![
                RtpCodecCapability::opus(),
                RtpCodecCapability::vp8(),
                RtpCodecCapability::h264(),
            ],
        }
    }
}

/// What happens to a room's router once the last member leaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum RoomLifetime {
    /// Keep the router for the process lifetime; rejoining is free
    #[default]
    KeepAlive,
    /// Close the router as soon as the room is empty
    DestroyWhenEmpty,
    /// Close the router after the room has stayed empty for `ttl_secs`
    Linger { ttl_secs: u64 },
}

impl RoomLifetime {
    /// How long an empty room keeps its router, `None` meaning forever
    pub fn grace_period(self) -> Option<Duration> {
        match self {
            RoomLifetime::KeepAlive => None,
            RoomLifetime::DestroyWhenEmpty => Some(Duration::ZERO),
            RoomLifetime::Linger { ttl_secs } => Some(Duration::from_secs(ttl_secs)),
        }
    }
}
