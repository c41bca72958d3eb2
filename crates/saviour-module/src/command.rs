//! Command dispatch.
//!
//! One worker serializes all inbound commands; a handler may block
//! (readiness probes, device calls) but always produces exactly one
//! status response. Failures are encoded in the response type, never
//! raised across the transport boundary.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use saviour_protocol::envelope::CommandEnvelope;
use saviour_protocol::status::{CommandError, StatusBody};

use crate::export::ExportRequest;
use crate::readiness;
use crate::ModuleState;

/// Commands every module accepts; module types register their own on
/// top via the device hook.
pub const COMMANDS: &[&str] = &[
    "get_status",
    "start_recording",
    "stop_recording",
    "list_recordings",
    "clear_recordings",
    "export_recordings",
    "get_config",
    "set_config",
    "validate_readiness",
    "restart_ptp",
    "shutdown",
    "list_commands",
];

pub async fn run_worker(
    state: Arc<ModuleState>,
    mut commands: mpsc::Receiver<CommandEnvelope>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            envelope = commands.recv() => match envelope {
                Some(envelope) => envelope,
                None => return,
            },
            _ = cancel.cancelled() => return,
        };
        info!(cmd = %envelope.cmd, "handling command");
        let response = handle(&state, envelope).await;
        if !state.status.publish(response) {
            warn!("command response dropped, transport down");
        }
    }
}

pub async fn handle(state: &Arc<ModuleState>, envelope: CommandEnvelope) -> StatusBody {
    match envelope.cmd.as_str() {
        "get_status" => get_status(state).await,
        "start_recording" => start_recording(state, &envelope).await,
        "stop_recording" => stop_recording(state).await,
        "list_recordings" => StatusBody::ListRecordings {
            recordings: state.recorder.list_recordings(),
        },
        "clear_recordings" => match state.recorder.clear_recordings() {
            Ok(cleared) => StatusBody::ClearRecordings {
                result: "success".to_string(),
                cleared,
            },
            Err(e) => StatusBody::Error {
                error: e.to_string(),
            },
        },
        "export_recordings" => export_recordings(state).await,
        "get_config" => StatusBody::GetConfig {
            config: state.config.get_all(),
        },
        "set_config" => set_config(state, &envelope),
        "validate_readiness" => validate_readiness(state).await,
        "restart_ptp" => match state.timesync.restart().await {
            Ok(()) => StatusBody::RestartPtp {
                result: "success".to_string(),
            },
            Err(e) => StatusBody::RestartPtp {
                result: format!("error: {e}"),
            },
        },
        "shutdown" => {
            info!("shutdown commanded");
            state.shutdown.cancel();
            StatusBody::Shutdown {
                result: "shutting down".to_string(),
            }
        }
        "list_commands" => StatusBody::ListCommands {
            commands: COMMANDS.iter().map(|c| c.to_string()).collect(),
        },
        unknown => StatusBody::Error {
            error: CommandError::UnknownCommand(unknown.to_string()).to_string(),
        },
    }
}

async fn get_status(state: &ModuleState) -> StatusBody {
    let sync = state.timesync.status().await;
    let health = state.health.sample(&state.recorder.recording_root(), &sync);
    StatusBody::Status {
        status: state.lifecycle.status(),
        recording: state.recorder.is_recording(),
        streaming: false,
        health,
    }
}

async fn start_recording(state: &Arc<ModuleState>, envelope: &CommandEnvelope) -> StatusBody {
    let Some(session_name) = envelope.get_str("session_name") else {
        return StatusBody::RecordingStartFailed {
            error: "start_recording requires session_name".to_string(),
        };
    };
    // Recording is accepted only under a live READY verdict.
    if !state.lifecycle.is_ready() {
        return StatusBody::RecordingStartFailed {
            error: "module is not READY; issue validate_readiness first".to_string(),
        };
    }
    let duration = envelope.get_u64("duration");
    match state.recorder.start(session_name, duration).await {
        Ok(()) => {
            state.lifecycle.set_recording();
            StatusBody::RecordingStarted {
                recording: true,
                session_name: session_name.to_string(),
            }
        }
        Err(CommandError::Resource(e)) => {
            // Local resource failure is a FAULT sink.
            state.lifecycle.set_fault();
            StatusBody::RecordingStartFailed { error: e }
        }
        Err(e) => StatusBody::RecordingStartFailed {
            error: e.to_string(),
        },
    }
}

async fn stop_recording(state: &ModuleState) -> StatusBody {
    match state.recorder.stop().await {
        Ok(()) => {
            state.lifecycle.set_not_ready();
            StatusBody::RecordingStopped { recording: false }
        }
        Err(e) => StatusBody::RecordingStopFailed {
            error: e.to_string(),
        },
    }
}

async fn export_recordings(state: &ModuleState) -> StatusBody {
    let staged = state.exporter.staged_count();
    let session_name = state
        .recorder
        .last_session()
        .unwrap_or_else(|| "NO_SESSION".to_string());
    if state
        .export_tx
        .send(ExportRequest::Staged { session_name })
        .await
        .is_err()
    {
        return StatusBody::ExportRecordings {
            result: "error: export pipeline unavailable".to_string(),
            exported: 0,
        };
    }
    StatusBody::ExportRecordings {
        result: "queued".to_string(),
        exported: staged,
    }
}

/// Apply a config batch. The store emits one diff event; the config
/// watcher degrades readiness and runs the module-type configure hook.
fn set_config(state: &ModuleState, envelope: &CommandEnvelope) -> StatusBody {
    if envelope.params.is_empty() {
        return StatusBody::SetConfig {
            result: "error: set_config requires at least one key".to_string(),
            config: None,
        };
    }
    match state.config.set_all(&envelope.params) {
        Ok(changed) => {
            info!(?changed, "config updated");
            StatusBody::SetConfig {
                result: "success".to_string(),
                config: Some(state.config.get_all()),
            }
        }
        Err(e) => StatusBody::SetConfig {
            result: format!("error: {e}"),
            config: None,
        },
    }
}

async fn validate_readiness(state: &ModuleState) -> StatusBody {
    let offset_threshold_us = state
        .config
        .get_i64("ptp.offset_threshold_us")
        .unwrap_or(saviour_protocol::DEFAULT_OFFSET_THRESHOLD_US);
    let required_disk_mb = state
        .config
        .get_u64("recording.required_disk_space_mb")
        .unwrap_or(saviour_protocol::DEFAULT_REQUIRED_DISK_SPACE_MB);
    let ready_ttl = std::time::Duration::from_secs(
        state
            .config
            .get_u64("readiness.ready_ttl_seconds")
            .unwrap_or(saviour_protocol::DEFAULT_READY_TTL_SECS),
    );

    let sync_ok = state
        .timesync
        .status()
        .await
        .is_synchronized(offset_threshold_us);
    let probe = state.device.lock().await.probe();

    let verdict = readiness::validate(
        &state.recorder.recording_root(),
        required_disk_mb,
        sync_ok,
        state.recorder.is_recording(),
        probe,
    );
    if verdict.ready {
        state.lifecycle.set_ready(ready_ttl);
    } else {
        state.lifecycle.set_not_ready();
    }
    StatusBody::ValidateReadiness {
        ready: verdict.ready,
        message: verdict.message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saviour_protocol::status::ModuleStatus;

    fn build_state() -> (tempfile::TempDir, Arc<ModuleState>) {
        crate::test_support::state_with_root(None)
    }

    #[tokio::test]
    async fn test_unknown_command_is_error() {
        let (_dir, state) = build_state();
        let body = handle(&state, CommandEnvelope::new("frobnicate")).await;
        assert!(matches!(body, StatusBody::Error { error } if error.contains("frobnicate")));
    }

    #[tokio::test]
    async fn test_list_commands() {
        let (_dir, state) = build_state();
        let body = handle(&state, CommandEnvelope::new("list_commands")).await;
        let StatusBody::ListCommands { commands } = body else {
            panic!("wrong response type");
        };
        assert!(commands.contains(&"start_recording".to_string()));
        assert!(commands.contains(&"validate_readiness".to_string()));
    }

    #[tokio::test]
    async fn test_start_refused_when_not_ready() {
        let (_dir, state) = build_state();
        let envelope =
            CommandEnvelope::parse(r#"start_recording {"session_name": "s"}"#).unwrap();
        let body = handle(&state, envelope).await;
        assert!(
            matches!(body, StatusBody::RecordingStartFailed { error } if error.contains("READY"))
        );
    }

    #[tokio::test]
    async fn test_start_requires_session_name() {
        let (_dir, state) = build_state();
        state.lifecycle.set_ready(std::time::Duration::from_secs(120));
        let body = handle(&state, CommandEnvelope::new("start_recording")).await;
        assert!(
            matches!(body, StatusBody::RecordingStartFailed { error } if error.contains("session_name"))
        );
    }

    #[tokio::test]
    async fn test_record_then_stop_via_commands() {
        let (_dir, state) = build_state();
        state.lifecycle.set_ready(std::time::Duration::from_secs(120));

        let envelope =
            CommandEnvelope::parse(r#"start_recording {"session_name": "cmd_sess"}"#).unwrap();
        let body = handle(&state, envelope).await;
        assert!(matches!(body, StatusBody::RecordingStarted { recording: true, .. }));
        assert_eq!(state.lifecycle.status(), ModuleStatus::Recording);

        let body = handle(&state, CommandEnvelope::new("stop_recording")).await;
        assert!(matches!(body, StatusBody::RecordingStopped { recording: false }));
        assert_eq!(state.lifecycle.status(), ModuleStatus::NotReady);

        // A second stop is a wrong-state failure, reported not raised.
        let body = handle(&state, CommandEnvelope::new("stop_recording")).await;
        assert!(matches!(body, StatusBody::RecordingStopFailed { .. }));
    }

    #[tokio::test]
    async fn test_get_and_set_config() {
        let (_dir, state) = build_state();

        let body = handle(&state, CommandEnvelope::new("get_config")).await;
        let StatusBody::GetConfig { config } = body else {
            panic!("wrong response type");
        };
        assert!(config.get("recording").is_some());

        let envelope = CommandEnvelope::parse(r#"set_config {"camera.fps": 60}"#).unwrap();
        let body = handle(&state, envelope).await;
        assert!(matches!(body, StatusBody::SetConfig { ref result, .. } if result == "success"));
        assert_eq!(state.config.get("camera.fps"), Some(serde_json::json!(60)));
    }

    #[tokio::test]
    async fn test_set_config_read_only_rejected() {
        let (_dir, state) = build_state();
        let envelope =
            CommandEnvelope::parse(r#"set_config {"export._share_ip": "1.2.3.4"}"#).unwrap();
        let body = handle(&state, envelope).await;
        assert!(
            matches!(body, StatusBody::SetConfig { ref result, .. } if result.starts_with("error"))
        );
    }

    #[tokio::test]
    async fn test_list_and_clear_recordings() {
        let (_dir, state) = build_state();
        std::fs::create_dir_all(state.recorder.exported_dir()).unwrap();
        std::fs::write(state.recorder.exported_dir().join("old.raw"), "x").unwrap();

        let body = handle(&state, CommandEnvelope::new("list_recordings")).await;
        let StatusBody::ListRecordings { recordings } = body else {
            panic!("wrong response type");
        };
        assert_eq!(recordings, vec!["exported/old.raw".to_string()]);

        let body = handle(&state, CommandEnvelope::new("clear_recordings")).await;
        assert!(matches!(body, StatusBody::ClearRecordings { cleared: 1, .. }));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_agent() {
        let (_dir, state) = build_state();
        let body = handle(&state, CommandEnvelope::new("shutdown")).await;
        assert!(matches!(body, StatusBody::Shutdown { .. }));
        assert!(state.shutdown.is_cancelled());
    }
}
