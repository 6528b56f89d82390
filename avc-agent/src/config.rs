// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * config.rs - Config tree access and typed agent configuration.
 */

//! Configuration of the agent.
//!
//! The platform exposes a read-only, path-addressed config tree (see [ConfigTree]). The agent
//! reads it once at init into a typed [AgentConfig], which is otherwise assembled with an
//! [AgentConfigBuilder].
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use avc_agent::config::{AgentConfigBuilder, MemoryConfigTree, DataChannelTech};
//!
//! let mut tree = MemoryConfigTree::new();
//! tree.set("apps/avcService/avcClient/dataChannel/dedicated/tech", "ethernet");
//! tree.set("apps/avcService/avcClient/dataChannel/dedicated/name", "eth0");
//!
//! let config = AgentConfigBuilder::new()
//!     .nat_timeout(Duration::from_secs(5))
//!     .load_tree(&tree)?
//!     .build()?;
//!
//! assert_eq!(config.local_port, 56830);
//! assert_eq!(config.data_channel.unwrap().tech, DataChannelTech::Ethernet);
//! # Result::<(), avc_agent::error::ConfigError>::Ok(())
//! ```

use std::{
    collections::HashMap,
    path::PathBuf,
    time::{Duration, SystemTime},
};

use tracing::{debug, warn};

use crate::{error::ConfigError, keepalive::DEFAULT_NAT_TIMEOUT, transport::AddressFamily};

/// Default local UDP port of the agent.
pub const DEFAULT_LOCAL_PORT: u16 = 56830;
/// Default maximum CoAP payload per block.
pub const DEFAULT_MAX_COAP_PAYLOAD: usize = 1024;
/// Default root directory of the persistent store (`/avms` lives below it).
pub const DEFAULT_STORE_ROOT: &str = "/";
/// Default time after which an unanswered handshake counts as failed.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default number of retries of a temporarily failing name resolution.
pub const DEFAULT_RESOLVE_RETRIES: u32 = 5;
/// Default delay between name resolution retries.
pub const DEFAULT_RESOLVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Persisted last-resort wall-clock time, in seconds since the Unix epoch.
pub const CLOCK_TIMESTAMP_PATH: &str = "clockTime:/source/timeStamp";
/// Tech of the dedicated data channel, only `ethernet` is honored.
pub const DEDICATED_TECH_PATH: &str = "apps/avcService/avcClient/dataChannel/dedicated/tech";
/// Interface name of the dedicated data channel.
pub const DEDICATED_NAME_PATH: &str = "apps/avcService/avcClient/dataChannel/dedicated/name";

/// Read-only, path-addressed configuration store provided by the platform.
pub trait ConfigTree {
    /// Returns the string stored at `path`, or `None` if the node does not exist.
    fn get_string(&self, path: &str) -> Option<String>;

    /// Returns the integer stored at `path`, or `None` if the node does not exist.
    ///
    /// # Errors
    /// Returns a [ConfigError::InvalidValue] if the node exists but is not an integer.
    fn get_int(&self, path: &str) -> Result<Option<i64>, ConfigError> {
        self.get_string(path)
            .map(|value| {
                value.trim().parse::<i64>().map_err(|_e| ConfigError::InvalidValue {
                    path: path.to_string(),
                    value,
                })
            })
            .transpose()
    }
}

/// Config tree held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigTree {
    nodes: HashMap<String, String>,
}

impl MemoryConfigTree {
    pub fn new() -> MemoryConfigTree {
        MemoryConfigTree::default()
    }

    pub fn set(&mut self, path: impl Into<String>, value: impl Into<String>) {
        self.nodes.insert(path.into(), value.into());
    }
}

impl ConfigTree for MemoryConfigTree {
    fn get_string(&self, path: &str) -> Option<String> {
        self.nodes.get(path).cloned()
    }
}

/// Technology of a dedicated data channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DataChannelTech {
    Ethernet,
}

/// Dedicated data channel the agent should use instead of the default cellular connection.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct DataChannel {
    pub tech: DataChannelTech,
    pub name: String,
}

impl DataChannel {
    /// Reads the dedicated data channel from the config tree.
    ///
    /// Returns `None` if no channel is configured, the tech is not `ethernet`, or the interface
    /// name is missing.
    pub fn load(tree: &dyn ConfigTree) -> Option<DataChannel> {
        let tech = tree.get_string(DEDICATED_TECH_PATH)?;
        if tech != "ethernet" {
            warn!(%tech, "ignoring dedicated data channel with unsupported tech");
            return None;
        }
        let name = tree.get_string(DEDICATED_NAME_PATH).filter(|n| !n.is_empty())?;
        Some(DataChannel {
            tech: DataChannelTech::Ethernet,
            name,
        })
    }
}

/// Kind of wall-clock time source.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ClockSourceKind {
    /// Time protocol (RFC 868).
    Tp,
    /// Network time protocol.
    Ntp,
    /// GNSS time.
    Gps,
}

impl ClockSourceKind {
    fn node(&self) -> &'static str {
        match self {
            ClockSourceKind::Tp => "tp",
            ClockSourceKind::Ntp => "ntp",
            ClockSourceKind::Gps => "gps",
        }
    }
}

/// A configured clock source.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClockSource {
    pub kind: ClockSourceKind,
    pub priority: i64,
    /// Server name, not used by GPS.
    pub server: Option<String>,
}

impl ClockSource {
    /// Reads the clock sources configured under `clockTime:/source`.
    ///
    /// Sources without a priority node are disabled. The result is ordered by descending
    /// priority.
    pub fn load_all(tree: &dyn ConfigTree) -> Result<Vec<ClockSource>, ConfigError> {
        let mut sources = Vec::new();
        for kind in [ClockSourceKind::Tp, ClockSourceKind::Ntp, ClockSourceKind::Gps] {
            let base = format!("clockTime:/source/{}", kind.node());
            let Some(priority) = tree.get_int(&format!("{base}/priority"))? else {
                continue;
            };
            let server = tree.get_string(&format!("{base}/config/1")).filter(|s| !s.is_empty());
            sources.push(ClockSource { kind, priority, server });
        }
        sources.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(sources)
    }
}

/// Configuration of an agent instance.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Local UDP port.
    pub local_port: u16,
    /// Address family of the local socket.
    pub family: AddressFamily,
    /// Bind to the address of the active cellular profile instead of the wildcard address.
    pub bind_to_cellular_profile: bool,
    /// Inactivity after which the DTLS session is renegotiated.
    pub nat_timeout: Duration,
    /// Time after which an unanswered handshake is failed and retried.
    pub handshake_timeout: Duration,
    /// Retries of a name resolution answered with `EAI_AGAIN`.
    pub resolve_retries: u32,
    pub resolve_retry_delay: Duration,
    /// Maximum CoAP payload per block.
    pub max_coap_payload: usize,
    /// Directory below which the `/avms` tree is stored.
    pub store_root: PathBuf,
    /// Dedicated data channel, if configured.
    pub data_channel: Option<DataChannel>,
    /// Clock sources, by descending priority.
    pub clock_sources: Vec<ClockSource>,
    /// Persisted last-resort wall-clock time.
    pub last_resort_time: Option<SystemTime>,
}

impl AgentConfig {
    /// Size of the CoAP stream buffer.
    pub fn stream_max(&self) -> usize {
        12 * self.max_coap_payload
    }
}

/// Builder for [AgentConfig].
#[derive(Debug, Clone)]
pub struct AgentConfigBuilder {
    cfg: AgentConfig,
}

impl AgentConfigBuilder {
    pub fn new() -> AgentConfigBuilder {
        AgentConfigBuilder {
            cfg: AgentConfig {
                local_port: DEFAULT_LOCAL_PORT,
                family: AddressFamily::Unspec,
                bind_to_cellular_profile: false,
                nat_timeout: DEFAULT_NAT_TIMEOUT,
                handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
                resolve_retries: DEFAULT_RESOLVE_RETRIES,
                resolve_retry_delay: DEFAULT_RESOLVE_RETRY_DELAY,
                max_coap_payload: DEFAULT_MAX_COAP_PAYLOAD,
                store_root: PathBuf::from(DEFAULT_STORE_ROOT),
                data_channel: None,
                clock_sources: Vec::new(),
                last_resort_time: None,
            },
        }
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.cfg.local_port = port;
        self
    }

    pub fn family(mut self, family: AddressFamily) -> Self {
        self.cfg.family = family;
        self
    }

    pub fn bind_to_cellular_profile(mut self, bind: bool) -> Self {
        self.cfg.bind_to_cellular_profile = bind;
        self
    }

    pub fn nat_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.nat_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.handshake_timeout = timeout;
        self
    }

    /// Sets how often and after which delay a temporarily failing name resolution is retried.
    pub fn resolve_retry(mut self, retries: u32, delay: Duration) -> Self {
        self.cfg.resolve_retries = retries;
        self.cfg.resolve_retry_delay = delay;
        self
    }

    pub fn max_coap_payload(mut self, size: usize) -> Self {
        self.cfg.max_coap_payload = size;
        self
    }

    pub fn store_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cfg.store_root = root.into();
        self
    }

    pub fn data_channel(mut self, channel: Option<DataChannel>) -> Self {
        self.cfg.data_channel = channel;
        self
    }

    /// Reads the config tree values consumed by the agent: dedicated data channel, clock sources
    /// and the last-resort timestamp.
    ///
    /// # Errors
    /// Returns a [ConfigError] if an integer node holds something else.
    pub fn load_tree(mut self, tree: &dyn ConfigTree) -> Result<Self, ConfigError> {
        self.cfg.data_channel = DataChannel::load(tree);
        self.cfg.clock_sources = ClockSource::load_all(tree)?;
        self.cfg.last_resort_time = match tree.get_int(CLOCK_TIMESTAMP_PATH)? {
            Some(secs) if secs >= 0 => Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64)),
            Some(secs) => {
                return Err(ConfigError::InvalidValue {
                    path: CLOCK_TIMESTAMP_PATH.to_string(),
                    value: secs.to_string(),
                })
            },
            None => None,
        };
        debug!(
            data_channel = ?self.cfg.data_channel,
            clock_sources = self.cfg.clock_sources.len(),
            "config tree loaded"
        );
        Ok(self)
    }

    /// Validates and returns the configuration.
    ///
    /// # Errors
    /// Fails if the NAT or handshake timeout is below one second or the maximum CoAP payload is
    /// not a CoAP block size (a power of two from 16 to 1024).
    pub fn build(self) -> Result<AgentConfig, ConfigError> {
        if self.cfg.nat_timeout < Duration::from_secs(1) {
            return Err(ConfigError::ZeroNatTimeout);
        }
        if self.cfg.handshake_timeout < Duration::from_secs(1) {
            return Err(ConfigError::InvalidHandshakeTimeout(self.cfg.handshake_timeout));
        }
        let size = self.cfg.max_coap_payload;
        if !size.is_power_of_two() || !(16..=1024).contains(&size) {
            return Err(ConfigError::InvalidPayloadSize(size));
        }
        Ok(self.cfg)
    }
}

impl Default for AgentConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
