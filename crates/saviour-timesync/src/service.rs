//! systemd unit control. The daemons run as managed services; the
//! supervisor never spawns them as raw children it has to poll.

use tokio::process::Command;
use tracing::{info, warn};

use crate::TimesyncError;

pub const PTP4L_UNIT: &str = "ptp4l";
pub const PHC2SYS_UNIT: &str = "phc2sys";
/// The NTP-style daemon that must not fight PTP for the system clock.
pub const TIMESYNCD_UNIT: &str = "systemd-timesyncd";

async fn systemctl(verb: &'static str, unit: &str) -> Result<(), TimesyncError> {
    let output = Command::new("systemctl")
        .arg(verb)
        .arg(unit)
        .output()
        .await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(TimesyncError::ServiceControl {
            verb,
            unit: unit.to_string(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

pub async fn start_unit(unit: &str) -> Result<(), TimesyncError> {
    info!(unit, "starting service");
    systemctl("start", unit).await
}

pub async fn stop_unit(unit: &str) -> Result<(), TimesyncError> {
    info!(unit, "stopping service");
    systemctl("stop", unit).await
}

pub async fn restart_unit(unit: &str) -> Result<(), TimesyncError> {
    info!(unit, "restarting service");
    systemctl("restart", unit).await
}

pub async fn is_unit_active(unit: &str) -> bool {
    match Command::new("systemctl")
        .arg("is-active")
        .arg("--quiet")
        .arg(unit)
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(_) => false,
    }
}

/// Stop and disable the competing NTP daemon. Failure to disable is
/// logged, not fatal: the unit may simply not be installed.
pub async fn disable_timesyncd() {
    if let Err(e) = systemctl("stop", TIMESYNCD_UNIT).await {
        warn!(error = %e, "could not stop {}", TIMESYNCD_UNIT);
    }
    if let Err(e) = systemctl("disable", TIMESYNCD_UNIT).await {
        warn!(error = %e, "could not disable {}", TIMESYNCD_UNIT);
    }
}

/// Re-enable the NTP daemon on shutdown so an unsupervised host keeps
/// roughly correct time.
pub async fn enable_timesyncd() {
    if let Err(e) = systemctl("enable", TIMESYNCD_UNIT).await {
        warn!(error = %e, "could not enable {}", TIMESYNCD_UNIT);
    }
    if let Err(e) = systemctl("start", TIMESYNCD_UNIT).await {
        warn!(error = %e, "could not start {}", TIMESYNCD_UNIT);
    }
}

/// Startup prerequisites: both daemon binaries installed and the PTP
/// interface present. A failure here terminates the agent with a
/// non-zero exit.
pub async fn check_prerequisites(interface: &str) -> Result<(), TimesyncError> {
    for binary in [PTP4L_UNIT, PHC2SYS_UNIT] {
        let found = Command::new("which")
            .arg(binary)
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !found {
            return Err(TimesyncError::MissingBinary(binary.to_string()));
        }
    }
    if !std::path::Path::new(&format!("/sys/class/net/{interface}")).exists() {
        return Err(TimesyncError::NoInterface(interface.to_string()));
    }
    Ok(())
}

/// Spawn `journalctl -f` following both units, returning the child so
/// the caller owns its lifetime. `-o cat` strips the syslog prefix;
/// the parsers tolerate it either way.
pub fn tail_journal() -> Result<tokio::process::Child, TimesyncError> {
    let child = Command::new("journalctl")
        .args(["-u", PTP4L_UNIT, "-u", PHC2SYS_UNIT, "-f", "-n", "0", "-o", "cat"])
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    Ok(child)
}
