//! Controller-side health monitoring.
//!
//! One single-threaded loop owns `last_heartbeat` bookkeeping and the
//! online/offline decision for every module; no other task mutates
//! those fields, so the transitions it publishes for one id can never
//! reorder. The same loop scans the sync scalars each heartbeat and
//! issues `restart_ptp` to diverged modules under the capped
//! exponential backoff policy.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use saviour_protocol::envelope::CommandEnvelope;
use saviour_protocol::health::HealthSample;
use saviour_timesync::RestartPolicy;

use crate::events::{ControllerEvent, EventSender};
use crate::registry::Registry;

/// A heartbeat as handed over by the status intake loop.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub module_id: String,
    pub sample: HealthSample,
    pub recording: bool,
    pub streaming: bool,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub heartbeat_timeout: Duration,
    pub monitor_period: Duration,
    pub offset_threshold_us: i64,
    pub freq_threshold_ppb: i64,
    pub restart_base_delay: Duration,
    pub stabilisation_window: Duration,
    pub history_size: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(
                saviour_protocol::DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            ),
            monitor_period: Duration::from_secs(
                saviour_protocol::DEFAULT_HEARTBEAT_INTERVAL_SECS,
            ),
            offset_threshold_us: saviour_protocol::DEFAULT_OFFSET_THRESHOLD_US,
            freq_threshold_ppb: saviour_protocol::DEFAULT_FREQ_THRESHOLD_PPB,
            restart_base_delay: Duration::from_secs(saviour_protocol::DEFAULT_SYNC_BASE_DELAY_SECS),
            stabilisation_window: Duration::from_secs(
                saviour_protocol::DEFAULT_SYNC_STABILISATION_SECS,
            ),
            history_size: 100,
        }
    }
}

struct HealthEntry {
    /// Monotonic arrival time of the last heartbeat; None until the
    /// first one.
    last_seen: Option<Instant>,
    history: VecDeque<HealthSample>,
    sync_policy: RestartPolicy,
    recording: bool,
    streaming: bool,
}

/// Owned exclusively by the monitor task.
pub struct HealthMonitor {
    config: HealthConfig,
    entries: HashMap<String, HealthEntry>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    fn entry(&mut self, id: &str) -> &mut HealthEntry {
        let config = &self.config;
        self.entries
            .entry(id.to_string())
            .or_insert_with(|| HealthEntry {
                last_seen: None,
                history: VecDeque::new(),
                sync_policy: RestartPolicy::new(
                    config.restart_base_delay,
                    config.stabilisation_window,
                    saviour_protocol::SYNC_BACKOFF_ATTEMPT_CAP,
                ),
                recording: false,
                streaming: false,
            })
    }

    /// Track a module from discovery time, before any heartbeat.
    pub fn track(&mut self, id: &str) {
        let entry = self.entry(id);
        if entry.history.is_empty() {
            entry.history.push_back(HealthSample::unknown());
        }
    }

    /// Migrate bookkeeping across an id rename, keeping heartbeat and
    /// backoff state in one step.
    pub fn rename(&mut self, old: &str, new: &str) {
        if let Some(entry) = self.entries.remove(old) {
            self.entries.insert(new.to_string(), entry);
        }
    }

    pub fn forget(&mut self, id: &str) {
        self.entries.remove(id);
    }

    pub fn history(&self, id: &str) -> Vec<HealthSample> {
        self.entries
            .get(id)
            .map(|e| e.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Apply one heartbeat; returns true when the module's sync scalars
    /// are diverged badly enough that a restart is due now.
    fn on_heartbeat(&mut self, hb: &Heartbeat, now: Instant) -> bool {
        let offset_threshold_ns = self.config.offset_threshold_us.saturating_mul(1000);
        let freq_threshold = self.config.freq_threshold_ppb;
        let history_size = self.config.history_size;

        let entry = self.entry(&hb.module_id);
        entry.last_seen = Some(now);
        entry.recording = hb.recording;
        entry.streaming = hb.streaming;
        entry.history.push_back(hb.sample.clone());
        while entry.history.len() > history_size {
            entry.history.pop_front();
        }

        let diverged = [hb.sample.ptp4l_offset, hb.sample.phc2sys_offset]
            .iter()
            .flatten()
            .any(|o| o.abs() > offset_threshold_ns)
            || [hb.sample.ptp4l_freq, hb.sample.phc2sys_freq]
                .iter()
                .flatten()
                .any(|f| f.abs() > freq_threshold);
        entry.sync_policy.observe(diverged, now)
    }

    /// Modules whose last heartbeat is older than the timeout.
    fn timed_out(&self, now: Instant) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| {
                e.last_seen
                    .is_some_and(|seen| now.duration_since(seen) > self.config.heartbeat_timeout)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Monitor loop. Consumes heartbeats from the intake, drives
/// online/offline transitions through the registry, and requests PTP
/// restarts over the command channel.
pub async fn run(
    mut monitor: HealthMonitor,
    state: std::sync::Arc<crate::ControllerState>,
    mut heartbeats: mpsc::Receiver<Heartbeat>,
    cancel: CancellationToken,
) {
    let registry: &Registry = &state.registry;
    let events: &EventSender = &state.events;
    let mut events_rx = events.subscribe();
    let mut sweep = tokio::time::interval(monitor.config.monitor_period);
    info!(
        timeout_secs = monitor.config.heartbeat_timeout.as_secs(),
        period_secs = monitor.config.monitor_period.as_secs(),
        "health monitor started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            hb = heartbeats.recv() => {
                let Some(hb) = hb else { return };
                let id = hb.module_id.clone();
                if !registry.contains(&id) {
                    debug!(module = %id, "heartbeat from unknown module ignored");
                    continue;
                }
                let restart_due = monitor.on_heartbeat(&hb, Instant::now());
                let _ = registry.record_heartbeat(&id, hb.sample.timestamp);

                let was_offline = registry.get(&id).is_some_and(|r| !r.online);
                if was_offline {
                    if registry.mark_online(&id, true).unwrap_or(false) {
                        info!(module = %id, "module back online");
                        let _ = events.send(ControllerEvent::ModuleOnline { id: id.clone() });
                    }
                }

                if restart_due {
                    warn!(module = %id, "sync divergence persists, commanding PTP restart");
                    state.send_command(&id, &CommandEnvelope::new("restart_ptp"));
                }
            }

            _ = sweep.tick() => {
                let now = Instant::now();
                for id in monitor.timed_out(now) {
                    let still_online = registry.get(&id).is_some_and(|r| r.online);
                    if still_online {
                        warn!(module = %id, "heartbeat timeout, marking offline");
                        if registry.mark_online(&id, false).unwrap_or(false) {
                            let _ = events.send(ControllerEvent::ModuleOffline { id });
                        }
                    }
                }
            }

            event = events_rx.recv() => {
                match event {
                    Ok(ControllerEvent::ModuleAdded { id }) => monitor.track(&id),
                    Ok(ControllerEvent::IdChanged { old, new }) => monitor.rename(&old, &new),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "health monitor lagged on event channel");
                    }
                    Err(_) => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(id: &str, offset: Option<i64>) -> Heartbeat {
        Heartbeat {
            module_id: id.to_string(),
            sample: HealthSample {
                timestamp: 100.0,
                phc2sys_offset: offset,
                phc2sys_freq: offset.map(|_| 10),
                ptp4l_offset: Some(0),
                ptp4l_freq: Some(0),
                ..Default::default()
            },
            recording: false,
            streaming: false,
        }
    }

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthConfig::default())
    }

    #[test]
    fn test_track_seeds_null_sample() {
        let mut m = monitor();
        m.track("cam_1");
        let history = m.history("cam_1");
        assert_eq!(history.len(), 1);
        assert!(history[0].cpu_temp.is_none());
    }

    #[test]
    fn test_timeout_detection_window() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.on_heartbeat(&heartbeat("cam_1", Some(0)), t0);

        // Within the timeout nothing trips.
        assert!(m.timed_out(t0 + Duration::from_secs(89)).is_empty());
        // Past it, the module is reported.
        assert_eq!(
            m.timed_out(t0 + Duration::from_secs(91)),
            vec!["cam_1".to_string()]
        );
    }

    #[test]
    fn test_never_heartbeated_module_not_timed_out() {
        let mut m = monitor();
        m.track("cam_1");
        assert!(m.timed_out(Instant::now() + Duration::from_secs(600)).is_empty());
    }

    #[test]
    fn test_sync_divergence_backoff_schedule() {
        let mut m = monitor();
        let t0 = Instant::now();
        // 6 ms offset exceeds the 5 ms threshold.
        let bad = heartbeat("cam_1", Some(6_000_000));

        assert!(m.on_heartbeat(&bad, t0));
        // Attempt 1 done; next waits base * 2^1 = 120 s.
        assert!(!m.on_heartbeat(&bad, t0 + Duration::from_secs(60)));
        assert!(m.on_heartbeat(&bad, t0 + Duration::from_secs(121)));
    }

    #[test]
    fn test_in_threshold_sample_never_restarts() {
        let mut m = monitor();
        let t0 = Instant::now();
        assert!(!m.on_heartbeat(&heartbeat("cam_1", Some(1_000)), t0));
    }

    #[test]
    fn test_rename_migrates_state() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.on_heartbeat(&heartbeat("camera_dc67", Some(0)), t0);
        m.rename("camera_dc67", "camera_aa11");
        assert!(m.history("camera_dc67").is_empty());
        assert_eq!(m.history("camera_aa11").len(), 1);
        // Timeout bookkeeping moved with it.
        assert_eq!(
            m.timed_out(t0 + Duration::from_secs(120)),
            vec!["camera_aa11".to_string()]
        );
    }

    #[test]
    fn test_history_is_bounded() {
        let mut m = HealthMonitor::new(HealthConfig {
            history_size: 5,
            ..Default::default()
        });
        let t0 = Instant::now();
        for i in 0..10 {
            m.on_heartbeat(&heartbeat("cam_1", Some(i)), t0 + Duration::from_secs(i as u64));
        }
        assert_eq!(m.history("cam_1").len(), 5);
    }
}
