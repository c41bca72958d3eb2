//! Export pipeline: atomic, rate-limited transfer of closed segments
//! to the shared store.
//!
//! One task owns the pipeline; it is the only mutator of `to_export/`
//! and `exported/`. Every pass re-lists `to_export/`, so a failed
//! upload (share outage, mid-copy crash) is retried on the next pass
//! with nothing lost. The two-phase rename means an observer on the
//! share never sees a partial file under its final name.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use saviour_config::ConfigStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportRequest {
    /// A segment was closed and staged; upload everything in
    /// `to_export/` under this session's folder on the share.
    Staged { session_name: String },
}

pub struct Exporter {
    config: Arc<ConfigStore>,
    module_id: String,
    /// Share IP the current traffic-shaping filter was installed for.
    shaped_for: Mutex<Option<String>>,
}

impl Exporter {
    pub fn new(config: Arc<ConfigStore>, module_id: impl Into<String>) -> Self {
        Self {
            config,
            module_id: module_id.into(),
            shaped_for: Mutex::new(None),
        }
    }

    fn module_name(&self) -> String {
        self.config
            .get_str("module.name")
            .unwrap_or_else(|| self.module_id.clone())
    }

    fn recording_root(&self) -> PathBuf {
        self.config
            .get_str("recording.folder")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/saviour/recordings"))
    }

    fn mount_point(&self) -> PathBuf {
        self.config
            .get_str("export._mount_point")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/mnt/export"))
    }

    fn mount_enabled(&self) -> bool {
        self.config.get_bool("export.mount_enabled").unwrap_or(true)
    }

    /// How many files currently await upload.
    pub fn staged_count(&self) -> usize {
        std::fs::read_dir(self.recording_root().join("to_export"))
            .map(|entries| entries.flatten().filter(|e| e.path().is_file()).count())
            .unwrap_or(0)
    }

    /// One export pass. Returns the number of files uploaded; files
    /// that could not be uploaded stay in `to_export/` for the next
    /// pass.
    pub async fn export_staged(&self, session_name: &str) -> anyhow::Result<usize> {
        let to_export = self.recording_root().join("to_export");
        let exported = self.recording_root().join("exported");
        std::fs::create_dir_all(&exported)?;

        let staged = list_staged(&to_export)?;
        if staged.is_empty() {
            return Ok(0);
        }

        if self.mount_enabled() {
            self.ensure_mounted().await?;
            if let Some(share_ip) = self.config.get_str("export._share_ip") {
                self.ensure_shaper(&share_ip).await;
            }
        }

        let dest = self
            .mount_point()
            .join(session_name)
            .join(self.module_name());
        std::fs::create_dir_all(&dest)?;

        let mut uploaded = Vec::new();
        for name in &staged {
            match upload_file(&to_export, &exported, &dest, name) {
                Ok(()) => {
                    info!(file = %name, dest = %dest.display(), "exported");
                    uploaded.push(name.clone());
                }
                Err(e) => {
                    warn!(file = %name, error = %e, "export failed, will retry next pass");
                }
            }
        }

        if self.config.get_bool("export.manifest_enabled").unwrap_or(false) && !uploaded.is_empty()
        {
            if let Err(e) = self.write_manifest(&dest, &exported, &uploaded, session_name) {
                warn!(error = %e, "manifest write failed");
            }
        }
        if let Err(e) = self.copy_config_once(dest.parent().unwrap_or(&dest)) {
            warn!(error = %e, "session config copy failed");
        }

        // Retention runs only after manifest and config are on the
        // share.
        if self.config.get_bool("export.delete_on_export").unwrap_or(true) {
            for name in &uploaded {
                if let Err(e) = std::fs::remove_file(exported.join(name)) {
                    warn!(file = %name, error = %e, "retention delete failed");
                }
            }
        }

        Ok(uploaded.len())
    }

    /// Manifest: every uploaded artifact with size and modification
    /// time, named `export_manifest_<stamp>.txt` in the session folder.
    fn write_manifest(
        &self,
        dest: &Path,
        local_dir: &Path,
        uploaded: &[String],
        session_name: &str,
    ) -> std::io::Result<()> {
        use std::io::Write;
        let stamp = saviour_protocol::file_timestamp(chrono::Local::now());
        let path = dest.join(format!("export_manifest_{stamp}.txt"));
        let mut file = std::fs::File::create(&path)?;
        writeln!(file, "Export Manifest - {stamp}")?;
        writeln!(file, "Module ID: {}", self.module_id)?;
        writeln!(file, "session_name: {session_name}")?;
        writeln!(file, "Files exported:")?;
        for name in uploaded {
            writeln!(file, "- {name}")?;
            if let Ok(meta) = std::fs::metadata(local_dir.join(name)) {
                writeln!(file, "  Size: {:.2} MB", meta.len() as f64 / (1024.0 * 1024.0))?;
                if let Ok(modified) = meta.modified() {
                    let dt: chrono::DateTime<chrono::Local> = modified.into();
                    writeln!(file, "  Modified: {}", dt.format("%Y-%m-%d %H:%M:%S"))?;
                }
            }
        }
        info!(path = %path.display(), "export manifest written");
        Ok(())
    }

    /// One-time copy of the effective config into the session folder;
    /// skipped when already present.
    fn copy_config_once(&self, session_dir: &Path) -> std::io::Result<()> {
        let target = session_dir.join(format!("{}_config.json", self.module_name()));
        if target.exists() {
            return Ok(());
        }
        let text = serde_json::to_string_pretty(&self.config.get_all())?;
        std::fs::write(target, text)
    }

    /// Mount the remote share under the fixed mount point if it is not
    /// already mounted.
    async fn ensure_mounted(&self) -> anyhow::Result<()> {
        let mount_point = self.mount_point();
        std::fs::create_dir_all(&mount_point)?;
        if is_mounted(&mount_point) {
            return Ok(());
        }

        let share_ip = self
            .config
            .get_str("export._share_ip")
            .unwrap_or_else(|| "10.0.0.1".to_string());
        let share_path = self
            .config
            .get_str("export._share_path")
            .unwrap_or_else(|| "controller_share".to_string());
        let username = self
            .config
            .get_str("export._share_username")
            .unwrap_or_else(|| "pi".to_string());
        let password = self
            .config
            .get_str("export._share_password")
            .unwrap_or_default();

        info!(share = %format!("//{share_ip}/{share_path}"), "mounting export share");
        let status = Command::new("mount")
            .arg("-t")
            .arg("cifs")
            .arg(format!("//{share_ip}/{share_path}"))
            .arg(&mount_point)
            .arg("-o")
            .arg(format!("username={username},password={password},rw"))
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("mount of //{share_ip}/{share_path} failed");
        }
        Ok(())
    }

    /// Install the HTB shaping filter for the share IP on the export
    /// port; reinstall when the destination changes. Protects the
    /// time-sync traffic class from upload bursts.
    async fn ensure_shaper(&self, share_ip: &str) {
        {
            let shaped = self.shaped_for.lock().unwrap();
            if shaped.as_deref() == Some(share_ip) {
                return;
            }
        }
        self.clear_shaper().await;

        let interface = self
            .config
            .get_str("network.interface")
            .unwrap_or_else(|| "eth0".to_string());
        let max_bitrate_mb = self.config.get_u64("export.max_bitrate_mb").unwrap_or(10);
        let max_burst_kb = self.config.get_u64("export.max_burst_kb").unwrap_or(30);

        info!(%share_ip, max_bitrate_mb, "applying export traffic shaping");
        run_tc(format!(
            "qdisc add dev {interface} root handle 1:0 htb default 10"
        ))
        .await;
        run_tc(format!(
            "class add dev {interface} parent 1:0 classid 1:1 htb \
             rate {max_bitrate_mb}mbit burst {max_burst_kb}k"
        ))
        .await;
        run_tc(format!(
            "filter add dev {interface} protocol ip parent 1:0 u32 \
             match ip dst {share_ip} match ip dport 445 0xffff flowid 1:1"
        ))
        .await;

        *self.shaped_for.lock().unwrap() = Some(share_ip.to_string());
    }

    pub async fn clear_shaper(&self) {
        let interface = self
            .config
            .get_str("network.interface")
            .unwrap_or_else(|| "eth0".to_string());
        let qdiscs = Command::new("tc")
            .args(["qdisc", "show", "dev", &interface])
            .output()
            .await;
        let has_htb = qdiscs
            .map(|o| String::from_utf8_lossy(&o.stdout).contains("htb"))
            .unwrap_or(false);
        if has_htb {
            run_tc(format!("qdisc del dev {interface} root")).await;
        }
        *self.shaped_for.lock().unwrap() = None;
    }
}

/// Staged files, recovering any `PENDING_` leftovers from an
/// interrupted pass back to their real names first.
fn list_staged(to_export: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(to_export)?.flatten() {
        if !entry.path().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(original) = name.strip_prefix("PENDING_") {
            let restored = to_export.join(original);
            std::fs::rename(entry.path(), &restored)?;
            names.push(original.to_string());
        } else {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// The two-phase upload. A crash between any two steps leaves either a
/// `PENDING_` file (recovered on the next pass) or a completed upload;
/// the share never regresses a final name back to `PENDING_`.
fn upload_file(
    to_export: &Path,
    exported: &Path,
    dest: &Path,
    name: &str,
) -> std::io::Result<()> {
    let pending_name = format!("PENDING_{name}");
    let src = to_export.join(name);
    let src_pending = to_export.join(&pending_name);
    let dest_pending = dest.join(&pending_name);
    let dest_final = dest.join(name);

    std::fs::rename(&src, &src_pending)?;
    if let Err(e) = std::fs::copy(&src_pending, &dest_pending) {
        // Put the local name back so the next pass retries cleanly.
        let _ = std::fs::rename(&src_pending, &src);
        return Err(e);
    }
    std::fs::rename(&dest_pending, &dest_final)?;
    std::fs::rename(&src_pending, &src)?;
    std::fs::rename(&src, exported.join(name))?;
    Ok(())
}

fn is_mounted(mount_point: &Path) -> bool {
    std::fs::read_to_string("/proc/mounts")
        .map(|mounts| {
            let needle = format!(" {} ", mount_point.display());
            mounts.lines().any(|line| line.contains(&needle))
        })
        .unwrap_or(false)
}

async fn run_tc(command_line: String) {
    let args: Vec<&str> = command_line.split_whitespace().collect();
    match Command::new("tc").args(&args).output().await {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            warn!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "tc command failed"
            );
        }
        Err(e) => warn!(error = %e, "tc not runnable"),
    }
}

/// Export task: serializes all passes through one loop.
pub async fn run(
    exporter: Arc<Exporter>,
    mut requests: mpsc::Receiver<ExportRequest>,
    cancel: CancellationToken,
) {
    info!("export pipeline started");
    loop {
        let request = tokio::select! {
            request = requests.recv() => match request {
                Some(request) => request,
                None => return,
            },
            _ = cancel.cancelled() => {
                exporter.clear_shaper().await;
                return;
            }
        };
        let ExportRequest::Staged { session_name } = request;
        match exporter.export_staged(&session_name).await {
            Ok(0) => {}
            Ok(count) => info!(count, session = %session_name, "export pass complete"),
            Err(e) => warn!(error = %e, session = %session_name, "export pass failed, files remain staged"),
        }
    }
}
