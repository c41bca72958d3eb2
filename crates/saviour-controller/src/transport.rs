//! Status intake: the single dispatch loop draining the status
//! channel. Frames from one module arrive in publication order;
//! heartbeats are handed to the health monitor, everything else drives
//! the registry and session bookkeeping directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use saviour_protocol::status::{ModuleStatus, StatusBody, StatusMessage};
use saviour_transport::Collector;

use crate::events::ControllerEvent;
use crate::health::Heartbeat;
use crate::ControllerState;

pub async fn run_status_intake(
    state: Arc<ControllerState>,
    mut collector: Collector,
    heartbeats: mpsc::Sender<Heartbeat>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            frame = collector.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
            _ = cancel.cancelled() => return,
        };

        if !frame.topic.starts_with(saviour_protocol::STATUS_TOPIC_PREFIX) {
            debug!(topic = %frame.topic, "non-status frame on status channel ignored");
            continue;
        }
        let message = match StatusMessage::from_json(&frame.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(topic = %frame.topic, error = %e, "malformed status payload");
                continue;
            }
        };
        dispatch(&state, &heartbeats, message).await;
    }
}

async fn dispatch(
    state: &ControllerState,
    heartbeats: &mpsc::Sender<Heartbeat>,
    message: StatusMessage,
) {
    let id = message.module_id.clone();
    match message.body {
        StatusBody::Heartbeat {
            health,
            recording,
            streaming,
        } => {
            let hb = Heartbeat {
                module_id: id,
                sample: health,
                recording,
                streaming,
            };
            if heartbeats.send(hb).await.is_err() {
                warn!("health monitor gone, heartbeat dropped");
            }
        }

        StatusBody::ValidateReadiness { ready, message: reason } => {
            let expiry = ready
                .then(|| Instant::now() + Duration::from_secs(state.config.recording.ready_ttl_secs));
            if let Err(e) = state.registry.set_ready(&id, ready, &reason, expiry) {
                warn!(module = %id, error = %e, "readiness verdict for unknown module");
            }
            let _ = state.events.send(ControllerEvent::ReadinessReported {
                id,
                ready,
                message: reason,
            });
        }

        StatusBody::RecordingStarted { recording, session_name } => {
            if !recording {
                warn!(module = %id, "recording_started with recording=false");
                return;
            }
            state
                .sessions
                .on_member_started(&state.registry, &id, &session_name);
            let _ = state.events.send(ControllerEvent::RecordingStarted {
                id,
                session: session_name,
            });
        }

        StatusBody::RecordingStopped { recording } => {
            if recording {
                warn!(module = %id, "recording_stopped with recording=true");
                return;
            }
            state.sessions.on_member_stopped(&state.registry, &id);
            let _ = state.events.send(ControllerEvent::RecordingStopped { id });
        }

        StatusBody::RecordingStartFailed { error } => {
            state.sessions.on_member_failed(&id, &error);
            let _ = state
                .events
                .send(ControllerEvent::RecordingStartFailed { id, error });
        }

        StatusBody::RecordingStopFailed { error } => {
            warn!(module = %id, error = %error, "module failed to stop recording");
        }

        StatusBody::GetConfig { config } | StatusBody::SetConfig { config: Some(config), .. } => {
            // A config change invalidates any READY verdict; the module
            // re-validates on its side, the registry view degrades here.
            if state
                .registry
                .get(&id)
                .is_some_and(|r| r.status == ModuleStatus::Ready)
            {
                let _ = state.registry.set_status(&id, ModuleStatus::NotReady);
            }
            let _ = state.registry.set_config(&id, config);
        }

        StatusBody::SetConfig { result, config: None } => {
            debug!(module = %id, result = %result, "set_config acknowledged");
        }

        StatusBody::Status { status, .. } => {
            debug!(module = %id, status = %status, "status report");
        }

        StatusBody::Error { error } => {
            warn!(module = %id, error = %error, "module reported error");
        }

        StatusBody::ListRecordings { .. }
        | StatusBody::ClearRecordings { .. }
        | StatusBody::ExportRecordings { .. }
        | StatusBody::ListCommands { .. }
        | StatusBody::RestartPtp { .. }
        | StatusBody::Shutdown { .. } => {
            debug!(module = %id, "command acknowledgement");
        }
    }
}
