mod discovery;
mod events;
mod health;
mod recording;
mod registry;
mod transport;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use saviour_protocol::envelope::CommandEnvelope;
use saviour_timesync::{SupervisorConfig, SyncRole, TimesyncSupervisor};
use saviour_transport::{Collector, Frame, Publisher};

use crate::events::{ControllerEvent, EventSender};
use crate::health::{HealthConfig, HealthMonitor};
use crate::recording::{RecordingError, SessionManager};
use crate::registry::Registry;

#[derive(Parser, Debug)]
#[command(name = "saviour-controller", about = "SAVIOUR controller daemon")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/controller_config.json")]
    config: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControllerConfig {
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub timesync: TimesyncSection,
    #[serde(default)]
    pub recording: RecordingSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_command_port")]
    pub command_port: u16,
    #[serde(default = "default_status_port")]
    pub status_port: u16,
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_private_prefixes")]
    pub private_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_monitor_period")]
    pub monitor_period_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimesyncSection {
    #[serde(default = "default_offset_threshold")]
    pub offset_threshold_us: i64,
    #[serde(default = "default_freq_threshold")]
    pub freq_threshold_ppb: i64,
    #[serde(default = "default_sync_base_delay")]
    pub base_delay_secs: u64,
    #[serde(default = "default_sync_stabilisation")]
    pub stabilisation_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingSection {
    #[serde(default = "default_ready_ttl")]
    pub ready_ttl_secs: u64,
    #[serde(default = "default_session_log_dir")]
    pub session_log_dir: PathBuf,
}

fn default_command_port() -> u16 { saviour_protocol::DEFAULT_COMMAND_PORT }
fn default_status_port() -> u16 { saviour_protocol::DEFAULT_STATUS_PORT }
fn default_service_port() -> u16 { saviour_protocol::DEFAULT_SERVICE_PORT }
fn default_interface() -> String { "eth0".to_string() }
fn default_private_prefixes() -> Vec<String> {
    saviour_protocol::PRIVATE_IP_PREFIXES.iter().map(|p| p.to_string()).collect()
}
fn default_heartbeat_timeout() -> u64 { saviour_protocol::DEFAULT_HEARTBEAT_TIMEOUT_SECS }
fn default_monitor_period() -> u64 { saviour_protocol::DEFAULT_HEARTBEAT_INTERVAL_SECS }
fn default_offset_threshold() -> i64 { saviour_protocol::DEFAULT_OFFSET_THRESHOLD_US }
fn default_freq_threshold() -> i64 { saviour_protocol::DEFAULT_FREQ_THRESHOLD_PPB }
fn default_sync_base_delay() -> u64 { saviour_protocol::DEFAULT_SYNC_BASE_DELAY_SECS }
fn default_sync_stabilisation() -> u64 { saviour_protocol::DEFAULT_SYNC_STABILISATION_SECS }
fn default_ready_ttl() -> u64 { saviour_protocol::DEFAULT_READY_TTL_SECS }
fn default_session_log_dir() -> PathBuf { PathBuf::from("/var/lib/saviour/sessions") }

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            command_port: default_command_port(),
            status_port: default_status_port(),
            service_port: default_service_port(),
            interface: default_interface(),
            private_prefixes: default_private_prefixes(),
        }
    }
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            monitor_period_secs: default_monitor_period(),
        }
    }
}

impl Default for TimesyncSection {
    fn default() -> Self {
        Self {
            offset_threshold_us: default_offset_threshold(),
            freq_threshold_ppb: default_freq_threshold(),
            base_delay_secs: default_sync_base_delay(),
            stabilisation_secs: default_sync_stabilisation(),
        }
    }
}

impl Default for RecordingSection {
    fn default() -> Self {
        Self {
            ready_ttl_secs: default_ready_ttl(),
            session_log_dir: default_session_log_dir(),
        }
    }
}

/// Controller shared state
pub struct ControllerState {
    pub config: ControllerConfig,
    /// Stable controller identity: the hostname.
    pub controller_id: String,
    pub registry: Registry,
    pub sessions: SessionManager,
    pub events: EventSender,
    publisher: Publisher,
}

impl ControllerState {
    /// Publish one command on `cmd/<selector>`; group and `all` fan-out
    /// is a single publish, filtering is on the modules.
    pub fn send_command(&self, selector: &str, command: &CommandEnvelope) {
        let topic = saviour_protocol::command_topic(selector);
        self.publisher.publish(Frame::new(topic, command.encode()));
    }

    /// Start a recording session on `target`. Membership resolves now;
    /// completion is tracked from the status events that follow.
    pub fn start_recording(
        &self,
        target: &str,
        session_name: &str,
        duration_secs: Option<u64>,
    ) -> Result<String, RecordingError> {
        let (full_name, command) =
            self.sessions
                .start(&self.registry, target, session_name, duration_secs)?;
        self.send_command(target, &command);
        Ok(full_name)
    }

    pub fn stop_recording(&self, target: &str) -> Result<String, RecordingError> {
        let (session_name, command) = self.sessions.stop(target)?;
        self.send_command(target, &command);
        Ok(session_name)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config: ControllerConfig = if args.config.exists() {
        let text = tokio::fs::read_to_string(&args.config).await?;
        serde_json::from_str(&text)?
    } else {
        info!("no config file found, using defaults");
        ControllerConfig::default()
    };

    let controller_id = hostname();
    info!(controller_id = %controller_id, "SAVIOUR controller starting");

    // Startup gate: a usable private-range address.
    let ip = discovery::wait_for_private_ip(&config.network.private_prefixes).await;

    // Time sync in grandmaster mode; missing daemons are a fatal
    // startup error.
    let timesync = Arc::new(TimesyncSupervisor::new(SupervisorConfig {
        offset_threshold_us: config.timesync.offset_threshold_us,
        freq_threshold_ppb: config.timesync.freq_threshold_ppb,
        base_delay: Duration::from_secs(config.timesync.base_delay_secs),
        stabilisation_window: Duration::from_secs(config.timesync.stabilisation_secs),
        ..SupervisorConfig::new(SyncRole::Master, config.network.interface.clone())
    }));
    if let Err(e) = timesync.start().await {
        error!(error = %e, "time-sync startup prerequisites failed");
        std::process::exit(1);
    }

    // Bind both transport channels.
    let command_addr = SocketAddr::new(ip, config.network.command_port);
    let status_addr = SocketAddr::new(ip, config.network.status_port);
    let publisher = Publisher::bind(command_addr).await?;
    let collector = Collector::bind(status_addr).await?;

    let events = events::channel();
    let state = Arc::new(ControllerState {
        controller_id,
        registry: Registry::new(),
        sessions: SessionManager::new(config.recording.session_log_dir.clone()),
        events: events.clone(),
        publisher,
        config,
    });

    let cancel = CancellationToken::new();
    let (heartbeat_tx, heartbeat_rx) = mpsc::channel(256);

    // Spawn discovery
    let discovery_handle = {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = discovery::run(state, ip, cancel).await {
                error!("discovery error: {}", e);
            }
        })
    };

    // Spawn status intake
    let intake_handle = {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            transport::run_status_intake(state, collector, heartbeat_tx, cancel).await;
        })
    };

    // Spawn health monitor
    let health_handle = {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        let monitor = HealthMonitor::new(HealthConfig {
            heartbeat_timeout: Duration::from_secs(state.config.health.heartbeat_timeout_secs),
            monitor_period: Duration::from_secs(state.config.health.monitor_period_secs),
            offset_threshold_us: state.config.timesync.offset_threshold_us,
            freq_threshold_ppb: state.config.timesync.freq_threshold_ppb,
            restart_base_delay: Duration::from_secs(state.config.timesync.base_delay_secs),
            stabilisation_window: Duration::from_secs(state.config.timesync.stabilisation_secs),
            ..HealthConfig::default()
        });
        tokio::spawn(async move {
            health::run(monitor, state, heartbeat_rx, cancel).await;
        })
    };

    // Spawn ready-expiry sweep and offline-session bookkeeping
    let sweep_handle = {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        let mut events_rx = events.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {
                        for id in state.registry.expire_ready(std::time::Instant::now()) {
                            info!(module = %id, "READY verdict expired");
                        }
                    }
                    event = events_rx.recv() => match event {
                        Ok(ControllerEvent::ModuleOffline { id }) => {
                            state.sessions.on_member_offline(&id);
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "sweep loop lagged on event channel");
                        }
                        Err(_) => return,
                    }
                }
            }
        })
    };

    info!("controller running, waiting for modules via mDNS...");

    tokio::signal::ctrl_c().await?;
    info!("shutting down...");
    cancel.cancel();
    timesync.shutdown().await;

    discovery_handle.abort();
    intake_handle.abort();
    health_handle.abort();
    sweep_handle.abort();

    Ok(())
}

fn hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "controller".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use saviour_transport::Subscriber;

    async fn state_with_module(
        dir: &tempfile::TempDir,
    ) -> (Arc<ControllerState>, std::net::SocketAddr) {
        let publisher = Publisher::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = publisher.local_addr();
        let state = Arc::new(ControllerState {
            config: ControllerConfig::default(),
            controller_id: "testctl".to_string(),
            registry: Registry::new(),
            sessions: SessionManager::new(dir.path()),
            events: events::channel(),
            publisher,
        });
        state.registry.reconcile_advertisement(
            "cam_1",
            "cam",
            "camera",
            "10.0.0.2".parse().unwrap(),
            5353,
        );
        (state, addr)
    }

    #[tokio::test]
    async fn test_session_commands_fan_out_over_transport() {
        let dir = tempfile::TempDir::new().unwrap();
        let (state, addr) = state_with_module(&dir).await;

        let mut subscriber = Subscriber::connect(
            addr,
            vec!["cmd/cam_1".to_string(), "cmd/all".to_string()],
        )
        .await
        .unwrap();
        while state.publisher.peer_count() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let session = state.start_recording("all", "sess", Some(70)).unwrap();

        let frame = subscriber
            .recv_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .expect("start command delivered");
        assert_eq!(frame.topic, "cmd/all");
        let envelope = CommandEnvelope::parse(&frame.payload).unwrap();
        assert_eq!(envelope.cmd, "start_recording");
        assert_eq!(envelope.get_str("session_name"), Some(session.as_str()));
        assert_eq!(envelope.get_u64("duration"), Some(70));

        let stopped = state.stop_recording("all").unwrap();
        assert_eq!(stopped, session);
        let frame = subscriber
            .recv_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .expect("stop command delivered");
        assert_eq!(
            CommandEnvelope::parse(&frame.payload).unwrap().cmd,
            "stop_recording"
        );
    }

    #[tokio::test]
    async fn test_start_on_unknown_target_fails_before_publish() {
        let dir = tempfile::TempDir::new().unwrap();
        let (state, _addr) = state_with_module(&dir).await;
        let err = state.start_recording("no_such", "sess", None).unwrap_err();
        assert!(matches!(err, RecordingError::EmptyTarget(_)));
    }
}
