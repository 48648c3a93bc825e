//! Proxy configuration

use crate::bus::SharedBus;
use crate::command::{deadline, RemoteTarget, DEFAULT_CALL_TIMEOUT};
use crate::error::ProxyResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Call deadline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Deadline for ordinary remote calls in seconds
    pub call_timeout_secs: f64,
    /// Extra time granted to exposures beyond the exposure time
    pub exposure_buffer_secs: f64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: DEFAULT_CALL_TIMEOUT.as_secs_f64(),
            exposure_buffer_secs: 10.0,
        }
    }
}

impl ProxyConfig {
    /// Configured call deadline, or the default when the setting is unusable
    pub fn call_timeout(&self) -> Duration {
        deadline(self.call_timeout_secs).unwrap_or_else(|e| {
            tracing::warn!("{}, using {:?}", e, DEFAULT_CALL_TIMEOUT);
            DEFAULT_CALL_TIMEOUT
        })
    }

    /// Deadline for an exposure of `exptime` seconds
    pub fn exposure_timeout(&self, exptime: f64) -> ProxyResult<Duration> {
        deadline(exptime + self.exposure_buffer_secs)
    }

    /// Target for `actor` using the configured call deadline
    pub fn target(&self, actor: impl Into<String>, bus: SharedBus) -> RemoteTarget {
        RemoteTarget::new(actor, bus).with_timeout(self.call_timeout())
    }
}
