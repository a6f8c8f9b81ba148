//! Runtime configuration for the bridge.
//!
//! These types are what the library consumes; reading them from a file is
//! left to the binary.

use crate::supervisor::Platform;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`Bridge`](crate::Bridge).
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Platform the dedicated server build targets
    pub platform: Platform,

    /// Directory holding the server executable; also its working directory
    pub server_dir: PathBuf,

    /// How long a requested stop may take before it is forced
    pub stop_timeout: Duration,

    /// Deadline for calls into the in-engine script
    pub call_timeout: Duration,

    pub socket: SocketConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            platform: Platform::current(),
            server_dir: PathBuf::from("bds"),
            stop_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_millis(5000),
            socket: SocketConfig::default(),
        }
    }
}

/// How the relay reaches its peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMode {
    /// Accept inbound connections on `bind_address`.
    Listen { bind_address: SocketAddr },
    /// Keep a single outbound connection to `ws://host:port`.
    Connect { host: String, port: u16 },
    Disabled,
}

/// Which remote addresses may connect in listen mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowList {
    All,
    Only(HashSet<IpAddr>),
}

impl AllowList {
    pub fn permits(&self, addr: IpAddr) -> bool {
        match self {
            AllowList::All => true,
            AllowList::Only(allowed) => {
                // Dual-stack listeners report IPv4 peers as ::ffff:a.b.c.d
                let addr = match addr {
                    IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
                    v4 => v4,
                };
                allowed.contains(&addr)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub mode: SocketMode,

    /// Pause between attempts in connect mode
    pub reconnect_delay: Duration,

    pub allow: AllowList,
}

impl SocketConfig {
    pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(5000);
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            mode: SocketMode::Connect {
                host: "localhost".to_string(),
                port: 8080,
            },
            reconnect_delay: Self::DEFAULT_RECONNECT_DELAY,
            allow: AllowList::Only(HashSet::from([IpAddr::from([127, 0, 0, 1])])),
        }
    }
}
