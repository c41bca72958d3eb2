//! The supervisor: owns the two units, the journal tail, the sample
//! buffer and the restart policy.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::parse::parse_line;
use crate::policy::RestartPolicy;
use crate::service;
use crate::{SyncDaemon, SyncRole, SyncSample, SyncStatus, TimesyncError};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub role: SyncRole,
    pub interface: String,
    /// |phc2sys offset| above this (microseconds) counts as diverged.
    pub offset_threshold_us: i64,
    /// |freq correction| above this (ppb) counts as diverged.
    pub freq_threshold_ppb: i64,
    pub base_delay: Duration,
    pub stabilisation_window: Duration,
    pub attempt_cap: u32,
    /// Parsed samples retained for history queries.
    pub history_size: usize,
}

impl SupervisorConfig {
    pub fn new(role: SyncRole, interface: impl Into<String>) -> Self {
        Self {
            role,
            interface: interface.into(),
            offset_threshold_us: 5_000,
            freq_threshold_ppb: 100_000,
            base_delay: Duration::from_secs(60),
            stabilisation_window: Duration::from_secs(60),
            attempt_cap: 5,
            history_size: 1000,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    running: bool,
    last_sync_time: Option<f64>,
    ptp4l_offset: Option<i64>,
    ptp4l_freq: Option<i64>,
    phc2sys_offset: Option<i64>,
    phc2sys_freq: Option<i64>,
    history: VecDeque<SyncSample>,
}

pub struct TimesyncSupervisor {
    config: SupervisorConfig,
    inner: Arc<Mutex<Inner>>,
    policy: Arc<Mutex<RestartPolicy>>,
    cancel: CancellationToken,
}

impl TimesyncSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let policy = RestartPolicy::new(
            config.base_delay,
            config.stabilisation_window,
            config.attempt_cap,
        );
        Self {
            config,
            inner: Arc::new(Mutex::new(Inner::default())),
            policy: Arc::new(Mutex::new(policy)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn role(&self) -> SyncRole {
        self.config.role
    }

    /// Check prerequisites, silence the competing NTP daemon, start
    /// both units and spawn the journal tail plus the divergence watch.
    pub async fn start(&self) -> Result<(), TimesyncError> {
        service::check_prerequisites(&self.config.interface).await?;
        service::disable_timesyncd().await;
        service::start_unit(service::PTP4L_UNIT).await?;
        service::start_unit(service::PHC2SYS_UNIT).await?;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.running = true;
        }
        info!(role = self.config.role.as_str(), "time-sync services started");

        self.spawn_journal_tail();
        self.spawn_divergence_watch();
        Ok(())
    }

    /// Stop both units and hand the clock back to the NTP daemon.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Err(e) = service::stop_unit(service::PHC2SYS_UNIT).await {
            warn!(error = %e, "stopping phc2sys failed");
        }
        if let Err(e) = service::stop_unit(service::PTP4L_UNIT).await {
            warn!(error = %e, "stopping ptp4l failed");
        }
        service::enable_timesyncd().await;
        self.inner.lock().unwrap().running = false;
    }

    /// Operator- or controller-requested restart of both units. Resets
    /// nothing in the backoff policy; a commanded restart is not a
    /// divergence observation.
    pub async fn restart(&self) -> Result<(), TimesyncError> {
        service::restart_unit(service::PTP4L_UNIT).await?;
        service::restart_unit(service::PHC2SYS_UNIT).await?;
        Ok(())
    }

    pub async fn status(&self) -> SyncStatus {
        let ptp4l_active = service::is_unit_active(service::PTP4L_UNIT).await;
        let phc2sys_active = service::is_unit_active(service::PHC2SYS_UNIT).await;
        let inner = self.inner.lock().unwrap();
        SyncStatus {
            role_master: self.config.role == SyncRole::Master,
            running: inner.running,
            ptp4l_active,
            phc2sys_active,
            last_sync_time: inner.last_sync_time,
            ptp4l_offset: inner.ptp4l_offset,
            ptp4l_freq: inner.ptp4l_freq,
            phc2sys_offset: inner.phc2sys_offset,
            phc2sys_freq: inner.phc2sys_freq,
        }
    }

    /// Most recent samples, oldest first.
    pub fn history(&self, limit: usize) -> Vec<SyncSample> {
        let inner = self.inner.lock().unwrap();
        inner
            .history
            .iter()
            .rev()
            .take(limit)
            .rev()
            .copied()
            .collect()
    }

    fn spawn_journal_tail(&self) {
        let inner = Arc::clone(&self.inner);
        let history_size = self.config.history_size;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let mut child = match service::tail_journal() {
                    Ok(child) => child,
                    Err(e) => {
                        warn!(error = %e, "journal tail failed to start, retrying");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };
                let Some(stdout) = child.stdout.take() else {
                    continue;
                };
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    tokio::select! {
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => record_line(&inner, history_size, &line),
                            Ok(None) | Err(_) => break,
                        },
                        _ = cancel.cancelled() => return,
                    }
                }
                warn!("journal tail ended, restarting");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        });
    }

    fn spawn_divergence_watch(&self) {
        let inner = Arc::clone(&self.inner);
        let policy = Arc::clone(&self.policy);
        let offset_threshold_ns = self.config.offset_threshold_us.saturating_mul(1000);
        let freq_threshold = self.config.freq_threshold_ppb;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = cancel.cancelled() => return,
                }
                let diverged = {
                    let inner = inner.lock().unwrap();
                    match (inner.phc2sys_offset, inner.phc2sys_freq) {
                        (Some(offset), Some(freq)) => {
                            offset.abs() > offset_threshold_ns || freq.abs() > freq_threshold
                        }
                        // No readings yet: nothing to judge.
                        _ => false,
                    }
                };
                let restart_due = policy.lock().unwrap().observe(diverged, Instant::now());
                if restart_due {
                    warn!("clock divergence persists, restarting phc2sys");
                    if let Err(e) = service::restart_unit(service::PHC2SYS_UNIT).await {
                        warn!(error = %e, "phc2sys restart failed");
                    }
                }
            }
        });
    }
}

fn record_line(inner: &Mutex<Inner>, history_size: usize, line: &str) {
    let Some(parsed) = parse_line(line) else {
        return;
    };
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    let mut inner = inner.lock().unwrap();
    // Series timestamps are taken at parse time on one thread, so they
    // are non-decreasing; clamp regardless so a clock step back cannot
    // violate that.
    let stamp = inner
        .history
        .back()
        .map(|s| s.timestamp.max(now))
        .unwrap_or(now);
    match parsed.daemon {
        SyncDaemon::Ptp4l => {
            inner.ptp4l_offset = Some(parsed.offset_ns);
            inner.ptp4l_freq = Some(parsed.freq_ppb);
        }
        SyncDaemon::Phc2sys => {
            inner.phc2sys_offset = Some(parsed.offset_ns);
            inner.phc2sys_freq = Some(parsed.freq_ppb);
        }
    }
    inner.last_sync_time = Some(stamp);
    inner.history.push_back(SyncSample {
        timestamp: stamp,
        daemon: parsed.daemon,
        offset_ns: parsed.offset_ns,
        freq_ppb: parsed.freq_ppb,
    });
    while inner.history.len() > history_size {
        inner.history.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SupervisorConfig {
        SupervisorConfig::new(SyncRole::Slave, "eth0")
    }

    #[test]
    fn test_record_line_updates_latest_and_history() {
        let inner = Mutex::new(Inner::default());
        record_line(
            &inner,
            10,
            "ptp4l[1.0]: master offset -100 s2 freq +200 path delay 50",
        );
        record_line(
            &inner,
            10,
            "phc2sys[1.1]: CLOCK_REALTIME phc offset -40 s2 freq +12 delay 900",
        );
        let guard = inner.lock().unwrap();
        assert_eq!(guard.ptp4l_offset, Some(-100));
        assert_eq!(guard.phc2sys_freq, Some(12));
        assert_eq!(guard.history.len(), 2);
    }

    #[test]
    fn test_history_is_bounded_and_monotonic() {
        let inner = Mutex::new(Inner::default());
        for i in 0..20 {
            record_line(
                &inner,
                8,
                &format!("ptp4l[{i}.0]: master offset {i} s2 freq +1 path delay 1"),
            );
        }
        let guard = inner.lock().unwrap();
        assert_eq!(guard.history.len(), 8);
        let stamps: Vec<f64> = guard.history.iter().map(|s| s.timestamp).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_history_readout_order() {
        let sup = TimesyncSupervisor::new(test_config());
        record_line(
            &sup.inner,
            1000,
            "ptp4l[1.0]: master offset 1 s2 freq +1 path delay 1",
        );
        record_line(
            &sup.inner,
            1000,
            "ptp4l[2.0]: master offset 2 s2 freq +2 path delay 1",
        );
        let history = sup.history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].offset_ns, 1);
        assert_eq!(history[1].offset_ns, 2);
    }
}
