//! Wire-level flows across the envelope and status types: what a
//! controller publishes and what it gets back over a module's life.

use serde_json::{json, Value};

use saviour_protocol::envelope::CommandEnvelope;
use saviour_protocol::health::HealthSample;
use saviour_protocol::status::{ModuleStatus, StatusBody, StatusMessage};

#[test]
fn test_every_required_command_parses() {
    let wire = [
        "get_status",
        r#"start_recording {"session_name": "sess_a", "duration": 70}"#,
        "stop_recording",
        "list_recordings",
        "get_config",
        r#"set_config {"camera.fps": 60, "module.group": "arena"}"#,
        "validate_readiness",
        "restart_ptp",
        "shutdown",
    ];
    for text in wire {
        let envelope = CommandEnvelope::parse(text).unwrap();
        assert!(!envelope.cmd.is_empty());
    }
}

#[test]
fn test_start_recording_fanout_roundtrip() {
    // Controller side: build and encode.
    let mut params = serde_json::Map::new();
    params.insert("session_name".to_string(), json!("sess_a_20260105_130459"));
    params.insert("duration".to_string(), json!(70));
    let sent = CommandEnvelope::with_params("start_recording", params);
    let wire = sent.encode();

    // Module side: parse and answer.
    let received = CommandEnvelope::parse(&wire).unwrap();
    assert_eq!(received.get_str("session_name"), Some("sess_a_20260105_130459"));
    assert_eq!(received.get_u64("duration"), Some(70));

    let reply = StatusMessage::new(
        "camera_dc67",
        "box_camera",
        StatusBody::RecordingStarted {
            recording: true,
            session_name: received.get_str("session_name").unwrap().to_string(),
        },
    );

    // Controller side: the reply parses with its required header.
    let parsed = StatusMessage::from_json(&reply.to_json()).unwrap();
    assert_eq!(parsed.module_id, "camera_dc67");
    match parsed.body {
        StatusBody::RecordingStarted { recording, session_name } => {
            assert!(recording);
            assert_eq!(session_name, "sess_a_20260105_130459");
        }
        other => panic!("unexpected body: {other:?}"),
    }
}

#[test]
fn test_module_lifetime_status_series() {
    // The series a module publishes over one short session, in order.
    let bodies = vec![
        StatusBody::Heartbeat {
            health: HealthSample::unknown(),
            recording: false,
            streaming: false,
        },
        StatusBody::ValidateReadiness {
            ready: true,
            message: "all checks passed".to_string(),
        },
        StatusBody::RecordingStarted {
            recording: true,
            session_name: "s_20260105_130459".to_string(),
        },
        StatusBody::RecordingStopped { recording: false },
    ];

    let mut last_timestamp = 0.0;
    for body in bodies {
        let message = StatusMessage::new("mic_aa11", "mic_left", body);
        let value: Value = serde_json::from_str(&message.to_json()).unwrap();
        // Required header on every message.
        for field in ["type", "timestamp", "module_id", "module_name"] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        let timestamp = value["timestamp"].as_f64().unwrap();
        assert!(timestamp >= last_timestamp, "timestamps regressed");
        last_timestamp = timestamp;
    }
}

#[test]
fn test_lifecycle_walk_matches_transition_table() {
    use ModuleStatus::*;
    // The canonical happy path plus the offline detour.
    let walk = [
        (NotReady, Ready),
        (Ready, Recording),
        (Recording, NotReady),
        (NotReady, Offline),
        (Offline, NotReady),
    ];
    for (from, to) in walk {
        assert!(ModuleStatus::can_transition(from, to), "{from} -> {to}");
    }
    // Sinks stay sinks.
    assert!(!ModuleStatus::can_transition(Fault, Ready));
    assert!(!ModuleStatus::can_transition(Fault, Recording));
}

#[test]
fn test_error_status_encodes_failure_kind() {
    let message = StatusMessage::new(
        "ttl_0b12",
        "ttl_io",
        StatusBody::RecordingStartFailed {
            error: "capture device absent".to_string(),
        },
    );
    let value: Value = serde_json::from_str(&message.to_json()).unwrap();
    assert_eq!(value["type"], "recording_start_failed");
    assert_eq!(value["error"], "capture device absent");
}

#[test]
fn test_heartbeat_carries_full_health_sample() {
    let sample = HealthSample {
        timestamp: 1_767_620_699.25,
        cpu_temp: Some(48.5),
        cpu_usage: Some(11.0),
        memory_usage: Some(37.2),
        uptime: Some(4000),
        disk_space: Some(81.5),
        ptp4l_offset: Some(-310),
        ptp4l_freq: Some(1422),
        phc2sys_offset: Some(-55),
        phc2sys_freq: Some(19),
    };
    let message = StatusMessage::new(
        "camera_dc67",
        "box_camera",
        StatusBody::Heartbeat {
            health: sample.clone(),
            recording: true,
            streaming: false,
        },
    );
    let parsed = StatusMessage::from_json(&message.to_json()).unwrap();
    match parsed.body {
        StatusBody::Heartbeat { health, recording, streaming } => {
            assert_eq!(health, sample);
            assert!(recording);
            assert!(!streaming);
        }
        other => panic!("unexpected body: {other:?}"),
    }
}
