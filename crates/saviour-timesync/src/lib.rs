//! PTP supervision.
//!
//! Each host runs two cooperating daemons: `ptp4l` speaks the wire
//! protocol against the grandmaster (or serves as it), and `phc2sys`
//! disciplines the system clock against the hardware clock. This crate
//! does not implement any of that; its contract is to drive the two
//! named systemd units, tail their journal for offset/freq scalars, and
//! restart `phc2sys` with capped exponential backoff when the clock
//! diverges.

pub mod parse;
pub mod policy;
pub mod service;
pub mod supervisor;

use thiserror::Error;

pub use policy::RestartPolicy;
pub use supervisor::{SupervisorConfig, TimesyncSupervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRole {
    /// Grandmaster: the controller serves time to the fleet.
    Master,
    /// Slave: a module disciplines its clock against the controller.
    Slave,
}

impl SyncRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Slave => "slave",
        }
    }
}

/// Which daemon a parsed sample came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDaemon {
    Ptp4l,
    Phc2sys,
}

/// One parsed log sample. `timestamp` is wall-clock epoch seconds and
/// is non-decreasing within the stored series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncSample {
    pub timestamp: f64,
    pub daemon: SyncDaemon,
    pub offset_ns: i64,
    pub freq_ppb: i64,
}

/// Readout returned by `TimesyncSupervisor::status()`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStatus {
    pub role_master: bool,
    pub running: bool,
    pub ptp4l_active: bool,
    pub phc2sys_active: bool,
    pub last_sync_time: Option<f64>,
    pub ptp4l_offset: Option<i64>,
    pub ptp4l_freq: Option<i64>,
    pub phc2sys_offset: Option<i64>,
    pub phc2sys_freq: Option<i64>,
}

impl SyncStatus {
    /// Readiness contract: sync is good when the system-clock offset is
    /// within threshold and both daemons have reported freq scalars.
    pub fn is_synchronized(&self, offset_threshold_us: i64) -> bool {
        let Some(offset_ns) = self.phc2sys_offset else {
            return false;
        };
        self.ptp4l_freq.is_some()
            && self.phc2sys_freq.is_some()
            && offset_ns.abs() <= offset_threshold_us.saturating_mul(1000)
    }
}

#[derive(Debug, Error)]
pub enum TimesyncError {
    #[error("required time-sync binary missing: {0}")]
    MissingBinary(String),
    #[error("network interface {0} does not exist")]
    NoInterface(String),
    #[error("systemctl {verb} {unit} failed: {detail}")]
    ServiceControl {
        verb: &'static str,
        unit: String,
        detail: String,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synchronized_requires_all_scalars() {
        let mut status = SyncStatus {
            phc2sys_offset: Some(3_000_000),
            ..Default::default()
        };
        // freq scalars still null
        assert!(!status.is_synchronized(5_000));

        status.ptp4l_freq = Some(1200);
        status.phc2sys_freq = Some(40);
        assert!(status.is_synchronized(5_000));

        // 6 ms offset exceeds the 5 ms threshold
        status.phc2sys_offset = Some(6_000_000);
        assert!(!status.is_synchronized(5_000));
    }
}
