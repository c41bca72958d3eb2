//! Named event channel wiring the controller's components together.
//! Discovery, health and the status intake publish onto one broadcast
//! channel; registry-adjacent consumers (recording, health, the UI
//! layer) subscribe to the variants they care about.

use std::net::IpAddr;

use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// A module advertisement resolved for the first time.
    ModuleAdded { id: String },
    /// An existing module re-advertised (same id, same address).
    ModuleUpdated { id: String },
    /// A module gracefully withdrew its advertisement. Reachability is
    /// judged by health, so the registry record survives this.
    ModuleWithdrawn { id: String },
    /// An advertisement matched an existing record by IP but carried a
    /// new id; the record was renamed in place.
    IdChanged { old: String, new: String },
    /// An advertisement matched by id but from a new address.
    IpChanged { id: String, ip: IpAddr },
    ModuleOnline { id: String },
    ModuleOffline { id: String },
    ReadinessReported {
        id: String,
        ready: bool,
        message: String,
    },
    RecordingStarted { id: String, session: String },
    RecordingStopped { id: String },
    RecordingStartFailed { id: String, error: String },
}

pub type EventSender = broadcast::Sender<ControllerEvent>;

pub fn channel() -> EventSender {
    broadcast::channel(256).0
}
