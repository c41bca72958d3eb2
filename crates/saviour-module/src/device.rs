//! The capture backend seam.
//!
//! Device-specific back-ends (video encoder, audio sink, GPIO line
//! driver) live outside this crate; the agent talks to them through
//! this trait only. The synthetic backend below writes placeholder
//! artifacts so the framework runs end-to-end without hardware; it is
//! also what the recording tests drive.

use std::io::Write;
use std::path::{Path, PathBuf};

use saviour_config::ConfigStore;

pub trait CaptureDevice: Send {
    fn type_name(&self) -> &str;

    /// Extension of the media artifact this backend produces.
    fn media_extension(&self) -> &str;

    /// Hardware probe used by the readiness suite.
    fn probe(&self) -> (bool, String);

    /// Begin writing a segment. `prefix` is the artifact path without
    /// extension; returns the media file path being written.
    fn start_segment(&mut self, prefix: &Path) -> anyhow::Result<PathBuf>;

    /// Stop writing and flush the last byte of the open segment.
    fn stop_segment(&mut self) -> anyhow::Result<()>;

    /// Format-fix pass on a closed segment: containers with relative
    /// timestamps are re-stamped to begin at zero before export may see
    /// the file.
    fn fix_segment(&self, media: &Path) -> anyhow::Result<()>;

    /// React to a config change; `changed` is the set of dotted paths.
    fn configure(&mut self, changed: &[String], config: &ConfigStore) -> anyhow::Result<()>;
}

/// Placeholder backend: produces an empty-payload media file and a
/// frame-timestamp sidecar, enough to exercise segmentation and export.
pub struct SyntheticDevice {
    type_name: String,
    open: Option<std::fs::File>,
}

impl SyntheticDevice {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            open: None,
        }
    }
}

impl CaptureDevice for SyntheticDevice {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn media_extension(&self) -> &str {
        "raw"
    }

    fn probe(&self) -> (bool, String) {
        (true, "synthetic device present".to_string())
    }

    fn start_segment(&mut self, prefix: &Path) -> anyhow::Result<PathBuf> {
        let media = prefix.with_extension(self.media_extension());
        let file = std::fs::File::create(&media)?;
        self.open = Some(file);
        Ok(media)
    }

    fn stop_segment(&mut self) -> anyhow::Result<()> {
        if let Some(mut file) = self.open.take() {
            file.write_all(b"")?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn fix_segment(&self, _media: &Path) -> anyhow::Result<()> {
        // Raw placeholder output carries no container timestamps.
        Ok(())
    }

    fn configure(&mut self, _changed: &[String], _config: &ConfigStore) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Select the backend for a module type. Device-specific agents link
/// their own; the framework ships only the synthetic one.
pub fn create_device(module_type: &str) -> Box<dyn CaptureDevice> {
    Box::new(SyntheticDevice::new(module_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_segment_cycle() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut device = SyntheticDevice::new("camera");
        let prefix = dir.path().join("sess_(0)_(20260105_130459)");

        let media = device.start_segment(&prefix).unwrap();
        assert!(media.ends_with("sess_(0)_(20260105_130459).raw"));
        assert!(media.exists());

        device.stop_segment().unwrap();
        device.fix_segment(&media).unwrap();
        assert!(device.probe().0);
    }
}
