mod command;
mod device;
mod discovery;
mod export;
mod health;
mod readiness;
mod recording;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use saviour_config::ConfigStore;
use saviour_protocol::status::StatusBody;
use saviour_timesync::{SupervisorConfig, SyncRole, TimesyncSupervisor};

use crate::device::CaptureDevice;
use crate::export::{ExportRequest, Exporter};
use crate::health::HealthSampler;
use crate::readiness::Lifecycle;
use crate::recording::Recorder;
use crate::transport::StatusPublisher;

#[derive(Parser, Debug)]
#[command(name = "saviour-module", about = "SAVIOUR module agent")]
struct Args {
    /// Module type tag (camera, microphone, ttl, ...)
    #[arg(short = 't', long, default_value = "generic")]
    module_type: String,

    /// Framework base configuration
    #[arg(long, default_value = "config/base_config.json")]
    base_config: PathBuf,

    /// Persisted effective configuration
    #[arg(long, default_value = "config/active_config.json")]
    active_config: PathBuf,

    /// Module-type default configuration (optional)
    #[arg(long)]
    module_config: Option<PathBuf>,

    /// Interface the module id is derived from and PTP runs on
    #[arg(short, long, default_value = "eth0")]
    interface: String,
}

/// Module shared state
pub struct ModuleState {
    pub config: Arc<ConfigStore>,
    pub module_id: String,
    pub module_type: String,
    pub lifecycle: Arc<Lifecycle>,
    pub status: Arc<StatusPublisher>,
    pub recorder: Arc<Recorder>,
    pub exporter: Arc<Exporter>,
    pub export_tx: mpsc::Sender<ExportRequest>,
    pub timesync: Arc<TimesyncSupervisor>,
    pub health: Arc<HealthSampler>,
    pub device: Arc<AsyncMutex<Box<dyn CaptureDevice>>>,
    /// Cooperative shutdown flag, also set by the `shutdown` command.
    pub shutdown: CancellationToken,
}

impl ModuleState {
    pub fn recording_root(&self) -> PathBuf {
        self.recorder.recording_root()
    }

    pub fn publish_status(&self, body: StatusBody) -> bool {
        self.status.publish(body)
    }
}

fn build_state(
    config: Arc<ConfigStore>,
    module_id: String,
    module_type: String,
    timesync: Arc<TimesyncSupervisor>,
) -> (Arc<ModuleState>, mpsc::Receiver<ExportRequest>) {
    let device: Arc<AsyncMutex<Box<dyn CaptureDevice>>> =
        Arc::new(AsyncMutex::new(device::create_device(&module_type)));
    let status = Arc::new(StatusPublisher::new(module_id.clone(), Arc::clone(&config)));
    let health = Arc::new(HealthSampler::new());
    let lifecycle = Arc::new(Lifecycle::new());
    let (export_tx, export_rx) = mpsc::channel(64);

    let recorder = Arc::new(Recorder::new(
        Arc::clone(&config),
        Arc::clone(&device),
        Arc::clone(&timesync),
        Arc::clone(&health),
        Arc::clone(&status),
        Arc::clone(&lifecycle),
        export_tx.clone(),
    ));
    let exporter = Arc::new(Exporter::new(Arc::clone(&config), module_id.clone()));

    let state = Arc::new(ModuleState {
        config,
        module_id,
        module_type,
        lifecycle,
        status,
        recorder,
        exporter,
        export_tx,
        timesync,
        health,
        device,
        shutdown: CancellationToken::new(),
    });
    (state, export_rx)
}

/// Config watcher: any applied change invalidates the READY verdict and
/// runs the module-type configure hook with the changed key paths.
async fn run_config_watcher(state: Arc<ModuleState>, cancel: CancellationToken) {
    let mut rx = state.config.subscribe();
    loop {
        let delta = tokio::select! {
            delta = rx.recv() => match delta {
                Ok(delta) => delta,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "config watcher lagged");
                    continue;
                }
                Err(_) => return,
            },
            _ = cancel.cancelled() => return,
        };

        info!(changed = ?delta.changed, "config changed, readiness must be re-validated");
        state.lifecycle.set_not_ready();
        let mut device = state.device.lock().await;
        if let Err(e) = device.configure(&delta.changed, &state.config) {
            error!(error = %e, "device reconfiguration failed");
            state.lifecycle.set_fault();
            state.publish_status(StatusBody::Error {
                error: format!("device reconfiguration failed: {e}"),
            });
        }
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

    // Whether a persisted config predates this boot decides how
    // module-type defaults merge (fill-missing vs full).
    let had_active = args.active_config.exists();
    let config = Arc::new(ConfigStore::load(&args.base_config, &args.active_config)?);
    if let Some(ref module_config) = args.module_config {
        config.load_module_defaults(module_config, had_active)?;
    }

    let module_id =
        saviour_protocol::identity::derive_module_id(&args.module_type, &args.interface)?;
    info!(module_id = %module_id, module_type = %args.module_type, "SAVIOUR module starting");

    // Startup gate: an address in a private range.
    let prefixes: Vec<String> = saviour_protocol::PRIVATE_IP_PREFIXES
        .iter()
        .map(|p| p.to_string())
        .collect();
    let ip = discovery::wait_for_private_ip(&prefixes).await;

    // Time sync in slave mode; missing daemons are fatal.
    let timesync = Arc::new(TimesyncSupervisor::new(SupervisorConfig::new(
        SyncRole::Slave,
        args.interface.clone(),
    )));
    if let Err(e) = timesync.start().await {
        error!(error = %e, "time-sync startup prerequisites failed");
        std::process::exit(1);
    }

    let (state, export_rx) = build_state(
        config,
        module_id,
        args.module_type.clone(),
        Arc::clone(&timesync),
    );

    let cancel = state.shutdown.clone();
    let (endpoint_tx, endpoint_rx) = watch::channel(None);
    let (command_tx, command_rx) = mpsc::channel(64);

    // Spawn discovery
    let discovery_handle = {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = discovery::run(state, ip, endpoint_tx, cancel).await {
                error!("discovery error: {}", e);
            }
        })
    };

    // Spawn transport connection manager
    let transport_handle = {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            transport::run(state, endpoint_rx, command_tx, cancel).await;
        })
    };

    // Spawn command worker
    let command_handle = {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            command::run_worker(state, command_rx, cancel).await;
        })
    };

    // Spawn heartbeat publisher
    let heartbeat_handle = {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            health::run_heartbeat(state, cancel).await;
        })
    };

    // Spawn export pipeline
    let export_handle = {
        let exporter = Arc::clone(&state.exporter);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            export::run(exporter, export_rx, cancel).await;
        })
    };

    // Spawn config watcher
    let config_handle = {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            run_config_watcher(state, cancel).await;
        })
    };

    info!("module agent running, waiting for controller via mDNS...");

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = cancel.cancelled() => {}
    }
    info!("shutting down...");
    cancel.cancel();

    // Close out an open recording so the final segment is staged.
    if state.recorder.is_recording() {
        if let Err(e) = state.recorder.stop().await {
            warn!(error = %e, "could not close recording on shutdown");
        }
    }
    state.exporter.clear_shaper().await;
    timesync.shutdown().await;

    discovery_handle.abort();
    transport_handle.abort();
    command_handle.abort();
    heartbeat_handle.abort();
    export_handle.abort();
    config_handle.abort();

    Ok(())
}
