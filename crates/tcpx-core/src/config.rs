use crate::error::{EngineError, Result};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

/// How the supervisor picks a reactor for a freshly accepted socket.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShardPolicy {
    #[default]
    RoundRobin,
    /// Fewest live connections wins; ties go to the lowest reactor id.
    LeastLoaded,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineSettings {
    pub host: String,
    pub port: u16,
    pub accept_backlog: i32,
    /// Per-connection SO_RCVBUF in bytes. 0 keeps the kernel default.
    pub receive_buffer_length: usize,
    /// Per-connection SO_SNDBUF in bytes. 0 keeps the kernel default.
    pub send_buffer_length: usize,
    /// Defaults to the number of logical cores.
    pub reactor_count: Option<usize>,
    pub segment_length: u32,
    pub segment_count: u32,
    pub use_nagle: bool,
    pub use_fast_loopback: bool,
    pub max_outstanding_receive: u32,
    pub max_outstanding_send: u32,
    pub completion_queue_depth: u32,
    pub drain_batch: usize,
    pub poll_interval_ms: u64,
    pub pin_reactors: bool,
    pub shard_policy: ShardPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 11223,
            accept_backlog: libc::SOMAXCONN,
            receive_buffer_length: 0,
            send_buffer_length: 0,
            reactor_count: None,
            segment_length: 4096,
            segment_count: 1024,
            use_nagle: false,
            use_fast_loopback: true,
            max_outstanding_receive: 24,
            max_outstanding_send: 40,
            completion_queue_depth: 4096,
            drain_batch: 1024,
            poll_interval_ms: 50,
            pin_reactors: true,
            shard_policy: ShardPolicy::RoundRobin,
        }
    }
}

impl EngineSettings {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: EngineSettings = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(EngineError::SettingsRead)?;
        Self::from_toml_str(&text)
    }

    /// Reactor count after applying the core-count default.
    pub fn effective_reactor_count(&self) -> usize {
        self.reactor_count.unwrap_or_else(num_cpus::get)
    }

    /// Bytes of pinned memory one arena reserves.
    pub fn arena_bytes(&self) -> Option<usize> {
        (self.segment_length as usize).checked_mul(self.segment_count as usize)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| EngineError::InvalidSettings(format!("host `{}` is not an IP address", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(EngineError::InvalidSettings(msg));

        if self.segment_length == 0 {
            return invalid("segment_length must be greater than zero".into());
        }
        if self.segment_count == 0 {
            return invalid("segment_count must be greater than zero".into());
        }
        if self.arena_bytes().is_none() {
            return invalid("segment_length * segment_count overflows".into());
        }
        if self.drain_batch == 0 {
            return invalid("drain_batch must be greater than zero".into());
        }
        if self.max_outstanding_receive == 0 || self.max_outstanding_send == 0 {
            return invalid("outstanding operation limits must be greater than zero".into());
        }
        if self.completion_queue_depth == 0 {
            return invalid("completion_queue_depth must be greater than zero".into());
        }
        if self.accept_backlog <= 0 {
            return invalid("accept_backlog must be positive".into());
        }
        if let Some(count) = self.reactor_count {
            let cores = num_cpus::get();
            if count == 0 || count > cores {
                return invalid(format!("reactor_count {} outside 1..={}", count, cores));
            }
        }
        self.bind_addr()?;
        Ok(())
    }
}
