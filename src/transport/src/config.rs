use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How a blocked `wait_*` call learns about a new completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitMode {
    /// Sleep on the completion channel until the CQ raises a notification.
    Notify,
    /// Poll the CQ in a tight loop.
    Spin,
}

impl Default for WaitMode {
    fn default() -> Self {
        WaitMode::Notify
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(default)]
pub struct EndpointConfig {
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
    pub cq_depth: i32,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub resolve_timeout_ms: i32,
    pub listen_backlog: i32,
    pub wait_mode: WaitMode,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            send_buffer_size: 4_000_000,
            recv_buffer_size: 4_000_000,
            cq_depth: 1000,
            max_send_wr: 1000,
            max_recv_wr: 1000,
            resolve_timeout_ms: 60_000,
            listen_backlog: 10,
            wait_mode: WaitMode::Notify,
        }
    }
}

impl EndpointConfig {
    pub fn with_buffer_sizes(send_buffer_size: usize, recv_buffer_size: usize) -> Self {
        EndpointConfig {
            send_buffer_size,
            recv_buffer_size,
            ..Default::default()
        }
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.send_buffer_size == 0 || self.recv_buffer_size == 0 {
            return Err(Error::Config("buffer sizes must be non-zero".to_owned()));
        }
        if self.send_buffer_size > u32::MAX as usize || self.recv_buffer_size > u32::MAX as usize
        {
            return Err(Error::Config("buffer sizes must fit in 32 bits".to_owned()));
        }
        if self.cq_depth <= 0 || self.max_send_wr == 0 || self.max_recv_wr == 0 {
            return Err(Error::Config("queue depths must be positive".to_owned()));
        }
        if self.resolve_timeout_ms <= 0 {
            return Err(Error::Config("resolve timeout must be positive".to_owned()));
        }
        Ok(())
    }
}
