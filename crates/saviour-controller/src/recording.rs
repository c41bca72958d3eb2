//! Session coordination.
//!
//! A session is a best-effort fan-out, not a transaction: the start
//! command goes out once to the target selector, membership is resolved
//! at call time, and per-member progress is tracked from the
//! `recording_started` / `recording_stopped` status events that follow.
//! A member that fails to start or drops offline never stops the rest.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use saviour_protocol::envelope::CommandEnvelope;
use saviour_protocol::status::ModuleStatus;

use crate::registry::Registry;

#[derive(Debug, Error, PartialEq)]
pub enum RecordingError {
    #[error("selector {0} resolves to no online modules")]
    EmptyTarget(String),
    #[error("module {module} already belongs to active session {session}")]
    AlreadyInSession { module: String, session: String },
    #[error("no active session for target {0}")]
    NoActiveSession(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    /// Commanded to start, no status yet.
    Commanded,
    Recording,
    Stopped,
    Failed,
    /// Dropped offline mid-session; will not auto-resume.
    Lost,
}

#[derive(Debug, Clone)]
pub struct RecordingSession {
    pub session_name: String,
    pub target: String,
    pub members: HashMap<String, MemberState>,
    pub start_time: f64,
    pub end_time: Option<f64>,
    pub active: bool,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, RecordingSession>>,
    /// Operator-facing append-only record of started sessions.
    log_dir: PathBuf,
}

impl SessionManager {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            log_dir: log_dir.into(),
        }
    }

    /// Start a session: resolve the target, stamp the name, persist the
    /// record, and return the command to fan out. The caller publishes
    /// it; completion is tracked asynchronously per member.
    pub fn start(
        &self,
        registry: &Registry,
        target: &str,
        session_name: &str,
        duration_secs: Option<u64>,
    ) -> Result<(String, CommandEnvelope), RecordingError> {
        let members = registry.members(target);
        if members.is_empty() {
            return Err(RecordingError::EmptyTarget(target.to_string()));
        }

        let mut sessions = self.sessions.lock().unwrap();
        for session in sessions.values().filter(|s| s.active) {
            for id in &members {
                if session.members.contains_key(id) {
                    return Err(RecordingError::AlreadyInSession {
                        module: id.clone(),
                        session: session.session_name.clone(),
                    });
                }
            }
        }

        let stamp = saviour_protocol::file_timestamp(chrono::Local::now());
        let full_name = format!("{session_name}_{stamp}");

        let mut params = serde_json::Map::new();
        params.insert("session_name".to_string(), json!(full_name));
        if let Some(duration) = duration_secs {
            params.insert("duration".to_string(), json!(duration));
        }
        let command = CommandEnvelope::with_params("start_recording", params);

        let session = RecordingSession {
            session_name: full_name.clone(),
            target: target.to_string(),
            members: members
                .iter()
                .map(|id| (id.clone(), MemberState::Commanded))
                .collect(),
            start_time: saviour_protocol::epoch_secs(),
            end_time: None,
            active: true,
        };
        info!(
            session = %full_name,
            target,
            members = ?members,
            duration = ?duration_secs,
            "starting recording session"
        );
        self.append_session_log(&session);
        sessions.insert(full_name.clone(), session);

        Ok((full_name, command))
    }

    /// Stop the active session for `target`, returning the command to
    /// publish on the same selector.
    pub fn stop(&self, target: &str) -> Result<(String, CommandEnvelope), RecordingError> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .values_mut()
            .find(|s| s.active && s.target == target)
            .ok_or_else(|| RecordingError::NoActiveSession(target.to_string()))?;
        session.active = false;
        session.end_time = Some(saviour_protocol::epoch_secs());
        info!(session = %session.session_name, target, "stopping recording session");
        Ok((
            session.session_name.clone(),
            CommandEnvelope::new("stop_recording"),
        ))
    }

    /// A member reported `recording_started`.
    pub fn on_member_started(&self, registry: &Registry, module_id: &str, session_name: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(session) = sessions.get_mut(session_name) else {
            warn!(module = %module_id, session = %session_name, "recording_started for unknown session");
            return;
        };
        session.members.insert(module_id.to_string(), MemberState::Recording);
        drop(sessions);
        if let Err(e) = registry.set_status(module_id, ModuleStatus::Recording) {
            warn!(module = %module_id, error = %e, "cannot mark module RECORDING");
        }
    }

    /// A member reported `recording_stopped`. When the last member of
    /// an auto-stopping session reports in, the session closes itself.
    pub fn on_member_stopped(&self, registry: &Registry, module_id: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        // Active sessions take precedence over already-closed ones the
        // member may still be winding down in.
        let mut ordered: Vec<&mut RecordingSession> = sessions.values_mut().collect();
        ordered.sort_by_key(|s| !s.active);
        for session in ordered {
            if let Some(state) = session.members.get_mut(module_id) {
                if *state == MemberState::Recording || *state == MemberState::Commanded {
                    *state = MemberState::Stopped;
                    if session.active
                        && session
                            .members
                            .values()
                            .all(|s| !matches!(s, MemberState::Recording | MemberState::Commanded))
                    {
                        session.active = false;
                        session.end_time = Some(saviour_protocol::epoch_secs());
                        info!(session = %session.session_name, "all members stopped, session closed");
                    }
                    break;
                }
            }
        }
        drop(sessions);
        if registry
            .get(module_id)
            .is_some_and(|r| r.status == ModuleStatus::Recording)
        {
            let _ = registry.set_status(module_id, ModuleStatus::NotReady);
        }
    }

    /// A member reported `recording_start_failed`. The session stays
    /// active for the rest of its members.
    pub fn on_member_failed(&self, module_id: &str, error: &str) {
        warn!(module = %module_id, error, "member failed to start recording, session continues");
        let mut sessions = self.sessions.lock().unwrap();
        for session in sessions.values_mut().filter(|s| s.active) {
            if let Some(state) = session.members.get_mut(module_id) {
                if *state == MemberState::Commanded {
                    *state = MemberState::Failed;
                }
            }
        }
    }

    /// A member went offline. Mark it lost in any active session; its
    /// return as NOT_READY never resumes recording.
    pub fn on_member_offline(&self, module_id: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        for session in sessions.values_mut().filter(|s| s.active) {
            if let Some(state) = session.members.get_mut(module_id) {
                if matches!(state, MemberState::Recording | MemberState::Commanded) {
                    warn!(module = %module_id, session = %session.session_name,
                        "recording member went offline mid-session");
                    *state = MemberState::Lost;
                }
            }
        }
    }

    pub fn get(&self, session_name: &str) -> Option<RecordingSession> {
        self.sessions.lock().unwrap().get(session_name).cloned()
    }

    pub fn active_sessions(&self) -> Vec<RecordingSession> {
        let mut list: Vec<RecordingSession> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.session_name.cmp(&b.session_name));
        list
    }

    /// Every member id in every active session exists in the registry;
    /// checked from tests and the sweep loop.
    pub fn members_known(&self, registry: &Registry) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.active)
            .all(|s| s.members.keys().all(|id| registry.contains(id)))
    }

    fn append_session_log(&self, session: &RecordingSession) {
        if let Err(e) = std::fs::create_dir_all(&self.log_dir) {
            warn!(error = %e, "cannot create session log dir");
            return;
        }
        let path = self.log_dir.join("sessions.log");
        let mut members: Vec<&String> = session.members.keys().collect();
        members.sort();
        let line = format!(
            "{} target={} members={:?} started={:.0}\n",
            session.session_name, session.target, members, session.start_time
        );
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!(error = %e, path = %path.display(), "session log append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, last))
    }

    fn setup() -> (tempfile::TempDir, SessionManager, Registry) {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = SessionManager::new(dir.path());
        let registry = Registry::new();
        registry.reconcile_advertisement("cam_1", "a", "camera", ip(1), 5353);
        registry.reconcile_advertisement("cam_2", "b", "camera", ip(2), 5353);
        (dir, manager, registry)
    }

    #[test]
    fn test_start_resolves_members_and_stamps_name() {
        let (_dir, manager, registry) = setup();
        let (name, command) = manager.start(&registry, "all", "sess_a", Some(70)).unwrap();

        assert!(name.starts_with("sess_a_"));
        // suffix is _YYYYMMDD_HHMMSS
        assert_eq!(name.len(), "sess_a".len() + 1 + 15);
        assert_eq!(command.cmd, "start_recording");
        assert_eq!(command.get_str("session_name"), Some(name.as_str()));
        assert_eq!(command.get_u64("duration"), Some(70));

        let session = manager.get(&name).unwrap();
        assert!(session.active);
        assert_eq!(session.members.len(), 2);
        assert!(manager.members_known(&registry));
    }

    #[test]
    fn test_empty_target_rejected() {
        let (_dir, manager, registry) = setup();
        let err = manager.start(&registry, "no_such_group", "s", None).unwrap_err();
        assert!(matches!(err, RecordingError::EmptyTarget(_)));
    }

    #[test]
    fn test_member_in_two_sessions_rejected() {
        let (_dir, manager, registry) = setup();
        manager.start(&registry, "cam_1", "first", None).unwrap();
        let err = manager.start(&registry, "all", "second", None).unwrap_err();
        assert!(matches!(err, RecordingError::AlreadyInSession { .. }));
    }

    #[test]
    fn test_member_lifecycle_updates_registry() {
        let (_dir, manager, registry) = setup();
        let (name, _) = manager.start(&registry, "cam_1", "s", None).unwrap();

        // The module must pass validation before RECORDING is legal.
        registry.set_ready("cam_1", true, "ok", None).unwrap();
        manager.on_member_started(&registry, "cam_1", &name);
        assert_eq!(registry.get("cam_1").unwrap().status, ModuleStatus::Recording);
        assert_eq!(
            manager.get(&name).unwrap().members["cam_1"],
            MemberState::Recording
        );

        manager.on_member_stopped(&registry, "cam_1");
        assert_eq!(registry.get("cam_1").unwrap().status, ModuleStatus::NotReady);
        let session = manager.get(&name).unwrap();
        assert!(!session.active);
        assert!(session.end_time.is_some());
    }

    #[test]
    fn test_start_failure_leaves_session_active() {
        let (_dir, manager, registry) = setup();
        let (name, _) = manager.start(&registry, "all", "s", None).unwrap();

        manager.on_member_failed("cam_1", "no capture device");
        let session = manager.get(&name).unwrap();
        assert!(session.active);
        assert_eq!(session.members["cam_1"], MemberState::Failed);
        assert_eq!(session.members["cam_2"], MemberState::Commanded);
    }

    #[test]
    fn test_offline_member_marked_lost_session_continues() {
        let (_dir, manager, registry) = setup();
        let (name, _) = manager.start(&registry, "all", "s", None).unwrap();
        registry.set_ready("cam_2", true, "ok", None).unwrap();
        manager.on_member_started(&registry, "cam_2", &name);

        manager.on_member_offline("cam_2");
        let session = manager.get(&name).unwrap();
        assert!(session.active);
        assert_eq!(session.members["cam_2"], MemberState::Lost);
    }

    #[test]
    fn test_stop_by_target() {
        let (_dir, manager, registry) = setup();
        let (name, _) = manager.start(&registry, "all", "s", None).unwrap();
        let (stopped_name, command) = manager.stop("all").unwrap();
        assert_eq!(stopped_name, name);
        assert_eq!(command.cmd, "stop_recording");
        assert!(!manager.get(&name).unwrap().active);

        assert!(matches!(
            manager.stop("all").unwrap_err(),
            RecordingError::NoActiveSession(_)
        ));
    }

    #[test]
    fn test_session_log_written() {
        let (dir, manager, registry) = setup();
        manager.start(&registry, "all", "logged", None).unwrap();
        let text = std::fs::read_to_string(dir.path().join("sessions.log")).unwrap();
        assert!(text.contains("logged_"));
        assert!(text.contains("target=all"));
    }
}
