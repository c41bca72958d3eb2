pub mod envelope;
pub mod health;
pub mod identity;
pub mod net;
pub mod status;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// mDNS service types for SAVIOUR discovery
pub const CONTROLLER_SERVICE_TYPE: &str = "_controller._tcp.local.";
pub const MODULE_SERVICE_TYPE: &str = "_module._tcp.local.";

/// Default ports
pub const DEFAULT_COMMAND_PORT: u16 = 5555;
pub const DEFAULT_STATUS_PORT: u16 = 5556;
pub const DEFAULT_SERVICE_PORT: u16 = 5353;

/// Heartbeat defaults
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 90;

/// Readiness defaults
pub const DEFAULT_READY_TTL_SECS: u64 = 120;
pub const DEFAULT_REQUIRED_DISK_SPACE_MB: u64 = 500;

/// Recording defaults
pub const DEFAULT_SEGMENT_LENGTH_SECS: u64 = 30;
pub const HEALTH_METADATA_INTERVAL_SECS: u64 = 5;

/// Time-sync thresholds
pub const DEFAULT_OFFSET_THRESHOLD_US: i64 = 5_000;
pub const DEFAULT_FREQ_THRESHOLD_PPB: i64 = 100_000;
pub const DEFAULT_SYNC_BASE_DELAY_SECS: u64 = 60;
pub const DEFAULT_SYNC_STABILISATION_SECS: u64 = 60;
pub const SYNC_BACKOFF_ATTEMPT_CAP: u32 = 5;

/// Address prefixes an agent may register itself under. Loopback and
/// link-local addresses are never advertised.
pub const PRIVATE_IP_PREFIXES: &[&str] = &["192.168.1.", "10.0.0."];

/// Topic for commands addressed to `selector` (a module id, a group
/// label, or the literal `all`).
pub fn command_topic(selector: &str) -> String {
    format!("cmd/{selector}")
}

/// Topic a module publishes its status messages on.
pub fn status_topic(module_id: &str) -> String {
    format!("status/{module_id}")
}

/// Prefix matching every status topic; the controller subscribes to this.
pub const STATUS_TOPIC_PREFIX: &str = "status/";

/// Wall-clock seconds since the Unix epoch, as the status envelope
/// carries them.
pub fn epoch_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// `YYYYMMDD_HHMMSS` stamp used in session names, segment prefixes and
/// export manifests.
pub fn file_timestamp(now: chrono::DateTime<chrono::Local>) -> String {
    now.format("%Y%m%d_%H%M%S").to_string()
}
