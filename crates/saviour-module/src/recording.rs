//! Module-side recording: a session is a sequence of segments.
//!
//! Three cooperating loops run while recording: the device writer
//! (owned by the capture backend), the segment monitor that decides
//! rollover, and the health-metadata writer appending a CSV row every
//! few seconds. Segment state is guarded by one internal lock; only
//! the monitor closes segments, only the device produces bytes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use saviour_config::ConfigStore;
use saviour_protocol::health::HealthSample;
use saviour_protocol::status::{CommandError, StatusBody};
use saviour_timesync::TimesyncSupervisor;

use crate::device::CaptureDevice;
use crate::export::ExportRequest;
use crate::health::HealthSampler;
use crate::readiness::Lifecycle;
use crate::transport::StatusPublisher;

/// `<session>_(<index>)_(<YYYYMMDD_HHMMSS>)`
pub fn segment_stem(session: &str, index: u32, stamp: &str) -> String {
    format!("{session}_({index})_({stamp})")
}

struct Segment {
    index: u32,
    /// Artifact path prefix inside `pending/`, without extension.
    stem: String,
    media: PathBuf,
    started: Instant,
}

struct Active {
    session_name: String,
    segment: Segment,
    /// Stops the monitor, health-writer and auto-stop loops.
    loops: CancellationToken,
}

pub struct Recorder {
    config: Arc<ConfigStore>,
    device: Arc<AsyncMutex<Box<dyn CaptureDevice>>>,
    timesync: Arc<TimesyncSupervisor>,
    health: Arc<HealthSampler>,
    status: Arc<StatusPublisher>,
    lifecycle: Arc<Lifecycle>,
    export_tx: mpsc::Sender<ExportRequest>,
    active: Arc<AsyncMutex<Option<Active>>>,
    recording: AtomicBool,
    last_session: Mutex<Option<String>>,
}

impl Recorder {
    pub fn new(
        config: Arc<ConfigStore>,
        device: Arc<AsyncMutex<Box<dyn CaptureDevice>>>,
        timesync: Arc<TimesyncSupervisor>,
        health: Arc<HealthSampler>,
        status: Arc<StatusPublisher>,
        lifecycle: Arc<Lifecycle>,
        export_tx: mpsc::Sender<ExportRequest>,
    ) -> Self {
        Self {
            config,
            device,
            timesync,
            health,
            status,
            lifecycle,
            export_tx,
            active: Arc::new(AsyncMutex::new(None)),
            recording: AtomicBool::new(false),
            last_session: Mutex::new(None),
        }
    }

    pub fn recording_root(&self) -> PathBuf {
        self.config
            .get_str("recording.folder")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/saviour/recordings"))
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.recording_root().join("pending")
    }

    pub fn to_export_dir(&self) -> PathBuf {
        self.recording_root().join("to_export")
    }

    pub fn exported_dir(&self) -> PathBuf {
        self.recording_root().join("exported")
    }

    fn segment_length(&self) -> Duration {
        Duration::from_secs(
            self.config
                .get_u64("recording.segment_length_seconds")
                .unwrap_or(saviour_protocol::DEFAULT_SEGMENT_LENGTH_SECS),
        )
    }

    fn monitor_period(&self) -> Duration {
        Duration::from_millis(
            self.config
                .get_u64("recording.monitor_period_ms")
                .unwrap_or(500),
        )
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    pub fn last_session(&self) -> Option<String> {
        self.last_session.lock().unwrap().clone()
    }

    /// Open segment 0 and start the three loops. Exactly one session
    /// may be active.
    pub async fn start(
        self: &Arc<Self>,
        session_name: &str,
        duration_secs: Option<u64>,
    ) -> Result<(), CommandError> {
        let mut guard = self.active.lock().await;
        if guard.is_some() {
            return Err(CommandError::WrongState(
                "module is already recording".to_string(),
            ));
        }

        for dir in [self.pending_dir(), self.to_export_dir(), self.exported_dir()] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| CommandError::Resource(format!("cannot create {}: {e}", dir.display())))?;
        }

        let segment = self.open_segment(session_name, 0).await?;
        let loops = CancellationToken::new();
        *guard = Some(Active {
            session_name: session_name.to_string(),
            segment,
            loops: loops.clone(),
        });
        drop(guard);

        *self.last_session.lock().unwrap() = Some(session_name.to_string());
        self.recording.store(true, Ordering::Relaxed);
        info!(session = %session_name, duration = ?duration_secs, "recording started");

        self.spawn_segment_monitor(loops.clone());
        self.spawn_health_writer(loops.clone());
        if let Some(secs) = duration_secs {
            self.spawn_auto_stop(Duration::from_secs(secs), loops);
        }
        Ok(())
    }

    /// Close the final segment and stop all loops.
    pub async fn stop(&self) -> Result<(), CommandError> {
        let mut guard = self.active.lock().await;
        let Some(active) = guard.take() else {
            return Err(CommandError::WrongState(
                "module is not recording".to_string(),
            ));
        };
        active.loops.cancel();
        let result = self.close_segment(&active.session_name, &active.segment).await;
        self.recording.store(false, Ordering::Relaxed);
        info!(session = %active.session_name, "recording stopped");
        result.map_err(|e| CommandError::Failed(e.to_string()))
    }

    /// Append a timestamped event row to the open segment's event
    /// sidecar; device-specific modules call this for TTL edges,
    /// triggers and the like.
    pub async fn log_event(&self, label: &str) -> Result<(), CommandError> {
        let guard = self.active.lock().await;
        let Some(active) = guard.as_ref() else {
            return Err(CommandError::WrongState(
                "no open segment to log events to".to_string(),
            ));
        };
        let path = self
            .pending_dir()
            .join(format!("{}_events.csv", active.segment.stem));
        let line = format!("{:.6},{label}\n", saviour_protocol::epoch_secs());
        append(&path, &line).map_err(|e| CommandError::Resource(e.to_string()))
    }

    /// Artifacts across all three stages, newest staging first.
    pub fn list_recordings(&self) -> Vec<String> {
        let mut names = Vec::new();
        for dir in [self.pending_dir(), self.to_export_dir(), self.exported_dir()] {
            if let Ok(entries) = std::fs::read_dir(&dir) {
                for entry in entries.flatten() {
                    if entry.path().is_file() {
                        names.push(format!(
                            "{}/{}",
                            dir.file_name().unwrap_or_default().to_string_lossy(),
                            entry.file_name().to_string_lossy()
                        ));
                    }
                }
            }
        }
        names.sort();
        names
    }

    /// Delete uploaded local copies. Only `exported/` is eligible; the
    /// open segment and staged files are never cleared.
    pub fn clear_recordings(&self) -> Result<usize, CommandError> {
        let dir = self.exported_dir();
        let mut cleared = 0;
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                if entry.path().is_file() && std::fs::remove_file(entry.path()).is_ok() {
                    cleared += 1;
                }
            }
        }
        Ok(cleared)
    }

    async fn open_segment(&self, session: &str, index: u32) -> Result<Segment, CommandError> {
        let stamp = saviour_protocol::file_timestamp(chrono::Local::now());
        let stem = segment_stem(session, index, &stamp);
        let prefix = self.pending_dir().join(&stem);

        let media = {
            let mut device = self.device.lock().await;
            device
                .start_segment(&prefix)
                .map_err(|e| CommandError::Resource(format!("capture backend failed: {e}")))?
        };

        // Framework sidecars; the device owns its own (frame times).
        append(
            &self.pending_dir().join(format!("{stem}_events.csv")),
            "timestamp,event\n",
        )
        .map_err(|e| CommandError::Resource(e.to_string()))?;
        append(
            &self.pending_dir().join(format!("{stem}_health_metadata.csv")),
            &format!("{}\n", HealthSample::csv_header()),
        )
        .map_err(|e| CommandError::Resource(e.to_string()))?;

        Ok(Segment {
            index,
            stem,
            media,
            started: Instant::now(),
        })
    }

    /// Close one segment: flush the writer, run the format-fix pass,
    /// then move every artifact of the segment into `to_export/` in one
    /// step and hand it to the exporter as staged.
    async fn close_segment(&self, session: &str, segment: &Segment) -> anyhow::Result<()> {
        {
            let mut device = self.device.lock().await;
            device.stop_segment()?;
            device.fix_segment(&segment.media)?;
        }

        let pending = self.pending_dir();
        let to_export = self.to_export_dir();
        let mut moved = 0usize;
        for entry in std::fs::read_dir(&pending)?.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&segment.stem) {
                std::fs::rename(entry.path(), to_export.join(&name))?;
                moved += 1;
            }
        }
        info!(
            session,
            segment = segment.index,
            artifacts = moved,
            "segment closed and staged"
        );

        if self
            .export_tx
            .try_send(ExportRequest::Staged {
                session_name: session.to_string(),
            })
            .is_err()
        {
            // Exporter busy or gone; staged files are re-listed on the
            // next pass, nothing is lost.
            warn!("export queue full, staged segment awaits next pass");
        }
        Ok(())
    }

    /// Rollover check; called by the segment monitor.
    async fn try_rollover(&self) {
        let mut guard = self.active.lock().await;
        let Some(active) = guard.as_mut() else { return };
        if active.segment.started.elapsed() < self.segment_length() {
            return;
        }

        let session = active.session_name.clone();
        let next_index = active.segment.index + 1;
        if let Err(e) = self.close_segment(&session, &active.segment).await {
            error!(error = %e, "segment close failed");
        }
        match self.open_segment(&session, next_index).await {
            Ok(segment) => {
                info!(session = %session, segment = next_index, "segment rolled over");
                active.segment = segment;
            }
            Err(e) => {
                error!(error = %e, "could not open next segment, stopping recording");
                active.loops.cancel();
                *guard = None;
                drop(guard);
                self.recording.store(false, Ordering::Relaxed);
                // Failing to open a segment is a local resource fault.
                self.lifecycle.set_fault();
                self.status.publish(StatusBody::RecordingStopFailed {
                    error: format!("segment rollover failed: {e}"),
                });
            }
        }
    }

    fn spawn_segment_monitor(self: &Arc<Self>, loops: CancellationToken) {
        let recorder = Arc::clone(self);
        tokio::spawn(async move {
            let period = recorder.monitor_period();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => recorder.try_rollover().await,
                    _ = loops.cancelled() => return,
                }
            }
        });
    }

    fn spawn_health_writer(self: &Arc<Self>, loops: CancellationToken) {
        let recorder = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                saviour_protocol::HEALTH_METADATA_INTERVAL_SECS,
            ));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = loops.cancelled() => return,
                }
                let stem = {
                    let guard = recorder.active.lock().await;
                    match guard.as_ref() {
                        Some(active) => active.segment.stem.clone(),
                        None => return,
                    }
                };
                let sync = recorder.timesync.status().await;
                let sample = recorder.health.sample(&recorder.recording_root(), &sync);
                let row = sample.csv_row(true, false);
                let path = recorder
                    .pending_dir()
                    .join(format!("{stem}_health_metadata.csv"));
                if let Err(e) = append(&path, &format!("{row}\n")) {
                    warn!(error = %e, "health metadata append failed");
                }
            }
        });
    }

    fn spawn_auto_stop(self: &Arc<Self>, duration: Duration, loops: CancellationToken) {
        let recorder = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = loops.cancelled() => return,
            }
            info!(after = ?duration, "auto-stop timer elapsed");
            match recorder.stop().await {
                Ok(()) => {
                    recorder.lifecycle.set_not_ready();
                    recorder.status.publish(StatusBody::RecordingStopped { recording: false });
                }
                Err(e) => {
                    recorder.status.publish(StatusBody::RecordingStopFailed {
                        error: e.to_string(),
                    });
                }
            }
        });
    }
}

fn append(path: &Path, text: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(text.as_bytes())?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SyntheticDevice;
    use serde_json::json;

    fn build_recorder(dir: &tempfile::TempDir) -> (Arc<Recorder>, mpsc::Receiver<ExportRequest>) {
        let base = dir.path().join("base_config.json");
        std::fs::write(
            &base,
            serde_json::to_string(&json!({
                "recording": {
                    "folder": dir.path().join("recordings").to_string_lossy(),
                    "segment_length_seconds": 1,
                    "monitor_period_ms": 50,
                }
            }))
            .unwrap(),
        )
        .unwrap();
        let config = Arc::new(
            ConfigStore::load(&base, dir.path().join("active_config.json")).unwrap(),
        );
        let device: Arc<AsyncMutex<Box<dyn CaptureDevice>>> =
            Arc::new(AsyncMutex::new(Box::new(SyntheticDevice::new("camera"))));
        let timesync = Arc::new(TimesyncSupervisor::new(
            saviour_timesync::SupervisorConfig::new(saviour_timesync::SyncRole::Slave, "eth0"),
        ));
        let status = Arc::new(StatusPublisher::new("camera_dc67", Arc::clone(&config)));
        let (export_tx, export_rx) = mpsc::channel(16);
        let recorder = Arc::new(Recorder::new(
            config,
            device,
            timesync,
            Arc::new(HealthSampler::new()),
            status,
            Arc::new(Lifecycle::new()),
            export_tx,
        ));
        (recorder, export_rx)
    }

    #[test]
    fn test_segment_stem_format() {
        assert_eq!(
            segment_stem("sess_a_20260105_130459", 2, "20260105_130532"),
            "sess_a_20260105_130459_(2)_(20260105_130532)"
        );
    }

    #[tokio::test]
    async fn test_start_creates_layout_and_sidecars() {
        let dir = tempfile::TempDir::new().unwrap();
        let (recorder, _export_rx) = build_recorder(&dir);

        recorder.start("sess_a", None).await.unwrap();
        assert!(recorder.is_recording());
        assert!(recorder.pending_dir().is_dir());
        assert!(recorder.to_export_dir().is_dir());
        assert!(recorder.exported_dir().is_dir());

        let pending: Vec<String> = std::fs::read_dir(recorder.pending_dir())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert!(pending.iter().any(|n| n.ends_with(".raw")));
        assert!(pending.iter().any(|n| n.ends_with("_events.csv")));
        assert!(pending.iter().any(|n| n.ends_with("_health_metadata.csv")));

        recorder.stop().await.unwrap();
        assert!(!recorder.is_recording());
    }

    #[tokio::test]
    async fn test_double_start_is_wrong_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let (recorder, _export_rx) = build_recorder(&dir);
        recorder.start("s", None).await.unwrap();
        let err = recorder.start("s2", None).await.unwrap_err();
        assert!(matches!(err, CommandError::WrongState(_)));
        recorder.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_start_is_wrong_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let (recorder, _export_rx) = build_recorder(&dir);
        assert!(matches!(
            recorder.stop().await.unwrap_err(),
            CommandError::WrongState(_)
        ));
    }

    #[tokio::test]
    async fn test_stop_stages_segment_for_export() {
        let dir = tempfile::TempDir::new().unwrap();
        let (recorder, mut export_rx) = build_recorder(&dir);

        recorder.start("sess_b", None).await.unwrap();
        recorder.stop().await.unwrap();

        // pending/ drained into to_export/, exporter notified.
        assert_eq!(std::fs::read_dir(recorder.pending_dir()).unwrap().count(), 0);
        assert!(std::fs::read_dir(recorder.to_export_dir()).unwrap().count() >= 3);
        let request = export_rx.try_recv().unwrap();
        assert_eq!(
            request,
            ExportRequest::Staged {
                session_name: "sess_b".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_rollover_produces_new_segment() {
        let dir = tempfile::TempDir::new().unwrap();
        let (recorder, _export_rx) = build_recorder(&dir);

        // segment_length is 1 s with a 50 ms monitor period.
        recorder.start("roll", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1600)).await;
        recorder.stop().await.unwrap();

        let staged: Vec<String> = std::fs::read_dir(recorder.to_export_dir())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        // At least segment 0 and segment 1 media files exist.
        assert!(staged.iter().any(|n| n.contains("_(0)_") && n.ends_with(".raw")));
        assert!(staged.iter().any(|n| n.contains("_(1)_") && n.ends_with(".raw")));
        // Only the monitor closes segments: exactly one open segment at
        // any instant means pending/ is empty after the final close.
        assert_eq!(std::fs::read_dir(recorder.pending_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_auto_stop_fires() {
        let dir = tempfile::TempDir::new().unwrap();
        let (recorder, _export_rx) = build_recorder(&dir);

        recorder.start("auto", Some(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1400)).await;
        assert!(!recorder.is_recording());
    }

    #[tokio::test]
    async fn test_log_event_appends_to_open_segment() {
        let dir = tempfile::TempDir::new().unwrap();
        let (recorder, _export_rx) = build_recorder(&dir);

        recorder.start("ev", None).await.unwrap();
        recorder.log_event("ttl_rising").await.unwrap();
        recorder.stop().await.unwrap();

        let events_file = std::fs::read_dir(recorder.to_export_dir())
            .unwrap()
            .flatten()
            .find(|e| e.file_name().to_string_lossy().ends_with("_events.csv"))
            .unwrap();
        let text = std::fs::read_to_string(events_file.path()).unwrap();
        assert!(text.starts_with("timestamp,event"));
        assert!(text.contains("ttl_rising"));
    }
}
