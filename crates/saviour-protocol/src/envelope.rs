//! Command envelope: the textual payload published on `cmd/<selector>`.
//!
//! The wire form is `"<cmd>"`, `"<cmd> {json-object}"` or
//! `"<cmd> key=value key=value"`. The k=v form is a convenience for
//! hand-typed commands; values parse as JSON scalars where possible and
//! fall back to strings.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("empty command")]
    Empty,
    #[error("malformed parameter JSON: {0}")]
    BadJson(String),
    #[error("parameters must be a JSON object, got {0}")]
    NotAnObject(String),
    #[error("malformed key=value token: {0}")]
    BadToken(String),
}

/// A parsed command with its parameter object.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    pub cmd: String,
    pub params: Map<String, Value>,
}

impl CommandEnvelope {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            params: Map::new(),
        }
    }

    pub fn with_params(cmd: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            cmd: cmd.into(),
            params,
        }
    }

    /// Parse the textual envelope. The command name is the first
    /// whitespace token; everything after it is either a JSON object or
    /// whitespace-separated `k=v` tokens.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EnvelopeError::Empty);
        }

        // JSON-parameter form: split at the first '{'.
        if let Some(brace) = text.find('{') {
            let cmd = text[..brace].trim();
            if cmd.is_empty() {
                return Err(EnvelopeError::Empty);
            }
            let json_part = &text[brace..];
            let value: Value = serde_json::from_str(json_part)
                .map_err(|e| EnvelopeError::BadJson(e.to_string()))?;
            let Value::Object(params) = value else {
                return Err(EnvelopeError::NotAnObject(json_part.to_string()));
            };
            return Ok(Self {
                cmd: cmd.to_string(),
                params,
            });
        }

        // Bare or k=v form.
        let mut tokens = text.split_whitespace();
        let cmd = tokens.next().ok_or(EnvelopeError::Empty)?.to_string();
        let mut params = Map::new();
        for token in tokens {
            let (key, raw) = token
                .split_once('=')
                .ok_or_else(|| EnvelopeError::BadToken(token.to_string()))?;
            if key.is_empty() {
                return Err(EnvelopeError::BadToken(token.to_string()));
            }
            let value = serde_json::from_str(raw).unwrap_or(Value::String(raw.to_string()));
            params.insert(key.to_string(), value);
        }
        Ok(Self { cmd, params })
    }

    /// Render to the wire form. Parameters are always emitted as JSON.
    pub fn encode(&self) -> String {
        if self.params.is_empty() {
            self.cmd.clone()
        } else {
            format!(
                "{} {}",
                self.cmd,
                Value::Object(self.params.clone())
            )
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Numeric parameter lookup, tolerating values sent as JSON strings.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.params.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_bare_command() {
        let env = CommandEnvelope::parse("get_status").unwrap();
        assert_eq!(env.cmd, "get_status");
        assert!(env.params.is_empty());
    }

    #[test]
    fn test_parse_json_params() {
        let env =
            CommandEnvelope::parse(r#"start_recording {"session_name": "sess_a", "duration": 70}"#)
                .unwrap();
        assert_eq!(env.cmd, "start_recording");
        assert_eq!(env.get_str("session_name"), Some("sess_a"));
        assert_eq!(env.get_u64("duration"), Some(70));
    }

    #[test]
    fn test_parse_kv_params() {
        let env = CommandEnvelope::parse("start_recording session_name=sess_a duration=70").unwrap();
        assert_eq!(env.cmd, "start_recording");
        assert_eq!(env.get_str("session_name"), Some("sess_a"));
        // k=v numerics come through as JSON numbers
        assert_eq!(env.get_u64("duration"), Some(70));
    }

    #[test]
    fn test_duration_as_string_still_numeric() {
        let env =
            CommandEnvelope::parse(r#"start_recording {"session_name": "s", "duration": "45"}"#)
                .unwrap();
        assert_eq!(env.get_u64("duration"), Some(45));
    }

    #[test]
    fn test_encode_roundtrip() {
        let mut params = Map::new();
        params.insert("camera.fps".to_string(), json!(60));
        let env = CommandEnvelope::with_params("set_config", params);
        let wire = env.encode();
        assert!(wire.starts_with("set_config {"));
        let back = CommandEnvelope::parse(&wire).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_reject_empty() {
        assert_eq!(CommandEnvelope::parse("   "), Err(EnvelopeError::Empty));
    }

    #[test]
    fn test_reject_non_object_json() {
        let err = CommandEnvelope::parse("set_config [1, 2]").unwrap_err();
        assert!(matches!(err, EnvelopeError::BadToken(_)));
        let err = CommandEnvelope::parse("set_config {bad json").unwrap_err();
        assert!(matches!(err, EnvelopeError::BadJson(_)));
    }

    #[test]
    fn test_reject_bad_kv_token() {
        let err = CommandEnvelope::parse("start_recording justavalue").unwrap_err();
        assert!(matches!(err, EnvelopeError::BadToken(_)));
    }
}
