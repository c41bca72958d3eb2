//! Module-side health: vital-sign sampling and the heartbeat publisher.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sysinfo::{Disks, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use saviour_protocol::health::HealthSample;
use saviour_protocol::status::StatusBody;
use saviour_timesync::SyncStatus;

use crate::ModuleState;

pub struct HealthSampler {
    system: Mutex<System>,
}

impl HealthSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// One sample of this host's vitals plus the given sync readout.
    pub fn sample(&self, recording_root: &Path, sync: &SyncStatus) -> HealthSample {
        let (cpu_usage, memory_usage) = {
            let mut system = self.system.lock().unwrap();
            system.refresh_cpu_usage();
            system.refresh_memory();
            let cpu = system.global_cpu_usage();
            let memory = if system.total_memory() > 0 {
                (system.used_memory() as f32 / system.total_memory() as f32) * 100.0
            } else {
                0.0
            };
            (cpu, memory)
        };

        HealthSample {
            timestamp: saviour_protocol::epoch_secs(),
            cpu_temp: read_cpu_temp(),
            cpu_usage: Some(cpu_usage),
            memory_usage: Some(memory_usage),
            uptime: Some(System::uptime()),
            disk_space: disk_free_percent(recording_root),
            ptp4l_offset: sync.ptp4l_offset,
            ptp4l_freq: sync.ptp4l_freq,
            phc2sys_offset: sync.phc2sys_offset,
            phc2sys_freq: sync.phc2sys_freq,
        }
    }
}

fn read_cpu_temp() -> Option<f32> {
    let raw = std::fs::read_to_string("/sys/class/thermal/thermal_zone0/temp").ok()?;
    let millidegrees: f32 = raw.trim().parse().ok()?;
    Some(millidegrees / 1000.0)
}

/// Free-space percent on the filesystem holding `path`.
pub fn disk_free_percent(path: &Path) -> Option<f32> {
    let disks = Disks::new_with_refreshed_list();
    let best = disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())?;
    if best.total_space() == 0 {
        return None;
    }
    Some((best.available_space() as f32 / best.total_space() as f32) * 100.0)
}

/// Free space in megabytes on the filesystem holding `path`; the
/// readiness suite compares this against `required_disk_space_mb`.
pub fn disk_free_mb(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    let best = disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())?;
    Some(best.available_space() / (1024 * 1024))
}

/// Heartbeat loop: publish a heartbeat status every interval until
/// cancelled.
pub async fn run_heartbeat(state: Arc<ModuleState>, cancel: CancellationToken) {
    let interval_secs = state
        .config
        .get_u64("health.heartbeat_interval")
        .unwrap_or(saviour_protocol::DEFAULT_HEARTBEAT_INTERVAL_SECS);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    info!(interval_secs, "heartbeat publisher started");

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => return,
        }
        let sync = state.timesync.status().await;
        let sample = state.health.sample(&state.recording_root(), &sync);
        let sent = state.publish_status(StatusBody::Heartbeat {
            health: sample,
            recording: state.recorder.is_recording(),
            streaming: false,
        });
        if !sent {
            debug!("heartbeat not sent (transport down)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_fills_vitals() {
        let sampler = HealthSampler::new();
        let sync = SyncStatus {
            phc2sys_offset: Some(-40),
            phc2sys_freq: Some(11),
            ..Default::default()
        };
        let sample = sampler.sample(Path::new("/"), &sync);
        assert!(sample.timestamp > 0.0);
        assert!(sample.cpu_usage.is_some());
        assert!(sample.memory_usage.is_some());
        assert_eq!(sample.phc2sys_offset, Some(-40));
        assert_eq!(sample.phc2sys_freq, Some(11));
    }

    #[test]
    fn test_disk_free_percent_root() {
        // Some filesystem always backs '/'.
        let percent = disk_free_percent(Path::new("/"));
        if let Some(p) = percent {
            assert!((0.0..=100.0).contains(&p));
        }
    }
}
