//! Health sample carried by every heartbeat and appended to the
//! per-segment health metadata CSV.

use serde::{Deserialize, Serialize};

/// One sample of a module's vital signs. All fields are optional: a
/// record created at discovery time, before the first heartbeat, carries
/// nulls throughout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    /// Wall-clock seconds since the Unix epoch at sampling time.
    pub timestamp: f64,
    /// CPU temperature in degrees Celsius.
    pub cpu_temp: Option<f32>,
    /// CPU utilization percent across all cores.
    pub cpu_usage: Option<f32>,
    /// Memory utilization percent.
    pub memory_usage: Option<f32>,
    /// Seconds since host boot.
    pub uptime: Option<u64>,
    /// Free space percent on the recording filesystem.
    pub disk_space: Option<f32>,
    /// Last `ptp4l` master offset in nanoseconds.
    pub ptp4l_offset: Option<i64>,
    /// Last `ptp4l` frequency correction in parts per billion.
    pub ptp4l_freq: Option<i64>,
    /// Last `phc2sys` system offset in nanoseconds.
    pub phc2sys_offset: Option<i64>,
    /// Last `phc2sys` frequency correction in parts per billion.
    pub phc2sys_freq: Option<i64>,
}

impl HealthSample {
    /// The sample stored for a module that has never sent a heartbeat.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Column order of the `_health_metadata.csv` sidecar.
    pub const CSV_FIELDS: &'static [&'static str] = &[
        "timestamp",
        "cpu_temp",
        "cpu_usage",
        "memory_usage",
        "uptime",
        "disk_space",
        "ptp4l_offset",
        "ptp4l_freq",
        "phc2sys_offset",
        "phc2sys_freq",
        "recording",
        "streaming",
    ];

    pub fn csv_header() -> String {
        Self::CSV_FIELDS.join(",")
    }

    /// Render one CSV row. Missing fields are empty cells.
    pub fn csv_row(&self, recording: bool, streaming: bool) -> String {
        fn cell<T: ToString>(v: &Option<T>) -> String {
            v.as_ref().map(ToString::to_string).unwrap_or_default()
        }
        format!(
            "{:.3},{},{},{},{},{},{},{},{},{},{},{}",
            self.timestamp,
            cell(&self.cpu_temp),
            cell(&self.cpu_usage),
            cell(&self.memory_usage),
            cell(&self.uptime),
            cell(&self.disk_space),
            cell(&self.ptp4l_offset),
            cell(&self.ptp4l_freq),
            cell(&self.phc2sys_offset),
            cell(&self.phc2sys_freq),
            recording,
            streaming,
        )
    }
}
