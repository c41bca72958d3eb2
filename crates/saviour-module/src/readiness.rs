//! The readiness engine and the module's local lifecycle state.
//!
//! Readiness runs a short suite of pre-recording checks on demand; the
//! first failure short-circuits and its message is the reported reason.
//! A passing verdict holds for `ready_ttl` seconds; recording is only
//! accepted while it holds.

use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::info;

use saviour_protocol::status::ModuleStatus;

/// A single check outcome.
pub type CheckResult = Result<(), String>;

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub ready: bool,
    pub message: String,
}

/// Locally-owned lifecycle: NOT_READY / READY (with expiry) /
/// RECORDING / FAULT. OFFLINE exists only in the controller's view.
pub struct Lifecycle {
    inner: Mutex<(ModuleStatus, Option<Instant>)>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((ModuleStatus::NotReady, None)),
        }
    }

    pub fn status(&self) -> ModuleStatus {
        let mut inner = self.inner.lock().unwrap();
        // Lazy decay of an expired READY verdict.
        if inner.0 == ModuleStatus::Ready {
            if let Some(expiry) = inner.1 {
                if Instant::now() >= expiry {
                    *inner = (ModuleStatus::NotReady, None);
                }
            }
        }
        inner.0
    }

    pub fn is_ready(&self) -> bool {
        self.status() == ModuleStatus::Ready
    }

    pub fn set_ready(&self, ttl: Duration) {
        *self.inner.lock().unwrap() = (ModuleStatus::Ready, Some(Instant::now() + ttl));
    }

    pub fn set_not_ready(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.0 != ModuleStatus::Fault {
            *inner = (ModuleStatus::NotReady, None);
        }
    }

    pub fn set_recording(&self) {
        *self.inner.lock().unwrap() = (ModuleStatus::Recording, None);
    }

    /// Unrecoverable local error; FAULT is a sink.
    pub fn set_fault(&self) {
        *self.inner.lock().unwrap() = (ModuleStatus::Fault, None);
    }
}

/// Run the standard suite in order; module-type-specific probes are
/// appended by the caller through `device_probe`.
pub fn validate(
    recording_root: &Path,
    required_disk_mb: u64,
    sync_ok: bool,
    recording: bool,
    device_probe: (bool, String),
) -> Verdict {
    let checks: Vec<(&str, CheckResult)> = vec![
        ("recording directory", check_recording_dir(recording_root)),
        ("disk space", check_disk_space(recording_root, required_disk_mb)),
        ("time sync", check_sync(sync_ok)),
        ("recording state", check_not_recording(recording)),
        ("device", check_device(device_probe)),
    ];

    for (name, result) in checks {
        if let Err(message) = result {
            info!(check = name, %message, "readiness check failed");
            return Verdict {
                ready: false,
                message,
            };
        }
    }
    Verdict {
        ready: true,
        message: "all checks passed".to_string(),
    }
}

fn check_recording_dir(root: &Path) -> CheckResult {
    std::fs::create_dir_all(root)
        .map_err(|e| format!("recording directory {} not creatable: {e}", root.display()))?;
    let probe = root.join(".write_probe");
    std::fs::write(&probe, b"probe")
        .map_err(|e| format!("recording directory {} not writable: {e}", root.display()))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

fn check_disk_space(root: &Path, required_mb: u64) -> CheckResult {
    if required_mb == 0 {
        return Ok(());
    }
    match crate::health::disk_free_mb(root) {
        Some(free_mb) if free_mb >= required_mb => Ok(()),
        Some(free_mb) => Err(format!(
            "insufficient disk space: {free_mb} MB free, {required_mb} MB required"
        )),
        None => Err("cannot determine free disk space".to_string()),
    }
}

fn check_sync(sync_ok: bool) -> CheckResult {
    if sync_ok {
        Ok(())
    } else {
        Err("time sync offset outside threshold or not yet reporting".to_string())
    }
}

fn check_not_recording(recording: bool) -> CheckResult {
    if recording {
        Err("module is currently recording".to_string())
    } else {
        Ok(())
    }
}

fn check_device(probe: (bool, String)) -> CheckResult {
    let (ok, message) = probe;
    if ok {
        Ok(())
    } else {
        Err(message)
    }
}
