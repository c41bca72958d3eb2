//! Status envelope: the JSON payload published on `status/<module_id>`,
//! and the module status tags the registry tracks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::health::HealthSample;

// -- Module status tags --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleStatus {
    #[serde(rename = "NOT_READY")]
    NotReady,
    #[serde(rename = "READY")]
    Ready,
    #[serde(rename = "RECORDING")]
    Recording,
    #[serde(rename = "FAULT")]
    Fault,
    #[serde(rename = "OFFLINE")]
    Offline,
}

impl ModuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotReady => "NOT_READY",
            Self::Ready => "READY",
            Self::Recording => "RECORDING",
            Self::Fault => "FAULT",
            Self::Offline => "OFFLINE",
        }
    }

    /// Whether `from -> to` is a legal lifecycle transition.
    ///
    /// OFFLINE and FAULT are reachable from any state; OFFLINE recovers
    /// to NOT_READY on the next heartbeat; READY is entered only from
    /// NOT_READY via validation and leaves to NOT_READY or RECORDING.
    pub fn can_transition(from: ModuleStatus, to: ModuleStatus) -> bool {
        use ModuleStatus::*;
        if from == to {
            return true;
        }
        match (from, to) {
            (_, Offline) | (_, Fault) => true,
            (Offline, NotReady) => true,
            (NotReady, Ready) => true,
            (Ready, NotReady) | (Ready, Recording) => true,
            (Recording, NotReady) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// -- Status envelope --

/// Required header fields plus the type-specific body, flattened so the
/// wire object is `{"type": ..., "timestamp": ..., "module_id": ...,
/// "module_name": ..., ...body fields}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub timestamp: f64,
    pub module_id: String,
    pub module_name: String,
    #[serde(flatten)]
    pub body: StatusBody,
}

impl StatusMessage {
    pub fn new(module_id: impl Into<String>, module_name: impl Into<String>, body: StatusBody) -> Self {
        Self {
            timestamp: crate::epoch_secs(),
            module_id: module_id.into(),
            module_name: module_name.into(),
            body,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusBody {
    Heartbeat {
        health: HealthSample,
        recording: bool,
        streaming: bool,
    },
    Status {
        status: ModuleStatus,
        recording: bool,
        streaming: bool,
        health: HealthSample,
    },
    RecordingStarted {
        recording: bool,
        session_name: String,
    },
    RecordingStopped {
        recording: bool,
    },
    RecordingStartFailed {
        error: String,
    },
    RecordingStopFailed {
        error: String,
    },
    ValidateReadiness {
        ready: bool,
        message: String,
    },
    GetConfig {
        config: Value,
    },
    SetConfig {
        result: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        config: Option<Value>,
    },
    ListRecordings {
        recordings: Vec<String>,
    },
    ClearRecordings {
        result: String,
        cleared: usize,
    },
    ExportRecordings {
        result: String,
        exported: usize,
    },
    ListCommands {
        commands: Vec<String>,
    },
    RestartPtp {
        result: String,
    },
    Shutdown {
        result: String,
    },
    Error {
        error: String,
    },
}

// -- Handler result variants --

/// Failure kinds a command handler may report. Handlers never raise
/// across the transport boundary; the router encodes one of these into
/// the status envelope instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    /// Wrong state for the request (e.g. start while already recording).
    #[error("{0}")]
    WrongState(String),
    /// Local resource problem (disk, device). The module goes to FAULT.
    #[error("{0}")]
    Resource(String),
    /// Invalid configuration key or value; rejected with no state change.
    #[error("{0}")]
    Config(String),
    /// The operation itself failed.
    #[error("{0}")]
    Failed(String),
}

/// Every command produces exactly one of these.
pub type CommandResult = Result<StatusBody, CommandError>;
