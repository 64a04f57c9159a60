//! NAL tunables

use crate::error::{NalError, Result};
use crate::fabric::DeviceId;
use crate::Nid;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NalConfig {
    /// Our node id
    pub nid: Nid,
    /// Fabric devices to drive, one scheduler thread each
    pub devices: Vec<DeviceId>,
    /// Descriptors available to callers that may block
    pub ntx: usize,
    /// Descriptors reserved for callers that must not block
    pub ntx_nblk: usize,
    /// Largest payload carried inside an IMMEDIATE message
    pub max_immediate: usize,
    /// Largest number of pages in one physical registration
    pub max_phys_regions: usize,
    pub timeout_secs: u32,
    pub keepalive_secs: u32,
    pub min_reconnect_interval_ms: u64,
    pub max_reconnect_interval_ms: u64,
    pub reaper_period_ms: u64,
    /// Connection checks per shortest timeout
    pub reaper_checks_per_timeout: u32,
    /// Consecutive recoverable protocol errors tolerated on a connection
    pub max_protocol_errors: u32,
    pub handshake_timeout_ms: u64,
}

impl Default for NalConfig {
    fn default() -> Self {
        Self {
            nid: 0,
            devices: vec![0],
            ntx: 256,
            ntx_nblk: 256,
            max_immediate: 2048,
            max_phys_regions: 256,
            timeout_secs: 30,
            keepalive_secs: 10,
            min_reconnect_interval_ms: 1000,
            max_reconnect_interval_ms: 60_000,
            reaper_period_ms: 1000,
            reaper_checks_per_timeout: 3,
            max_protocol_errors: 3,
            handshake_timeout_ms: 5000,
        }
    }
}

impl NalConfig {
    pub fn new(nid: Nid) -> Self {
        Self {
            nid,
            ..Self::default()
        }
    }

    pub fn with_devices(mut self, devices: Vec<DeviceId>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_pool(mut self, ntx: usize, ntx_nblk: usize) -> Self {
        self.ntx = ntx;
        self.ntx_nblk = ntx_nblk;
        self
    }

    pub fn with_timeouts(mut self, timeout_secs: u32, keepalive_secs: u32) -> Self {
        self.timeout_secs = timeout_secs;
        self.keepalive_secs = keepalive_secs;
        self
    }

    pub fn with_reconnect_interval(mut self, min: Duration, max: Duration) -> Self {
        self.min_reconnect_interval_ms = min.as_millis() as u64;
        self.max_reconnect_interval_ms = max.as_millis() as u64;
        self
    }

    pub fn with_reaper_period(mut self, period: Duration) -> Self {
        self.reaper_period_ms = period.as_millis() as u64;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(NalError::Config(msg.to_string()));

        if self.devices.is_empty() {
            return fail("at least one device required");
        }
        if self.ntx == 0 {
            return fail("ntx must be non-zero");
        }
        if self.timeout_secs == 0 || self.keepalive_secs == 0 {
            return fail("timeout and keepalive must be non-zero");
        }
        if self.max_phys_regions == 0 {
            return fail("max_phys_regions must be non-zero");
        }
        if self.min_reconnect_interval_ms == 0
            || self.min_reconnect_interval_ms > self.max_reconnect_interval_ms
        {
            return fail("reconnect interval must satisfy 0 < min <= max");
        }
        if self.reaper_checks_per_timeout == 0 {
            return fail("reaper_checks_per_timeout must be non-zero");
        }
        let mut devices = self.devices.clone();
        devices.sort_unstable();
        devices.dedup();
        if devices.len() != self.devices.len() {
            return fail("duplicate device");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs as u64)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs as u64)
    }

    pub fn min_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.min_reconnect_interval_ms)
    }

    pub fn max_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_interval_ms)
    }

    pub fn reaper_period(&self) -> Duration {
        Duration::from_millis(self.reaper_period_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = NalConfig::new(0x10);
        assert!(config.validate().is_ok());
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.max_immediate, 2048);
    }

    #[test]
    fn test_rejects_bad_reconnect_interval() {
        let config = NalConfig::new(1)
            .with_reconnect_interval(Duration::from_secs(10), Duration::from_secs(1));
        assert!(matches!(config.validate(), Err(NalError::Config(_))));
    }

    #[test]
    fn test_rejects_duplicate_device() {
        let config = NalConfig::new(1).with_devices(vec![0, 1, 0]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: NalConfig =
            serde_json::from_str(r#"{ "nid": 5, "timeout_secs": 4 }"#).unwrap();
        assert_eq!(config.nid, 5);
        assert_eq!(config.timeout_secs, 4);
        assert_eq!(config.keepalive_secs, 10);
        assert_eq!(config.devices, vec![0]);
    }
}
