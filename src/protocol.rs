//! Control protocol message taxonomy (§4.2).
//!
//! Every frame carries exactly one [`Message`], tagged on its `type` field.
//! Unknown `type` values and malformed JSON are both per-frame-recoverable:
//! [`Message::decode`] returns `None` rather than an error, and the caller
//! logs and drops the frame instead of tearing down the connection (§4.2, §7).

use serde::{Deserialize, Serialize};

use crate::lifecycle::LifecycleState;

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Imperative command kinds carried by `command` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    GetStatus,
    Stop,
    Kill,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "command")]
    Command {
        command: CommandKind,
        #[serde(rename = "correlationId", skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        #[serde(rename = "timeoutSeconds", skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
    },

    #[serde(rename = "input")]
    Input { input: String },

    #[serde(rename = "heartbeat")]
    Heartbeat {
        sequence: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
        #[serde(rename = "serverId", skip_serializing_if = "Option::is_none")]
        server_id: Option<String>,
    },

    #[serde(rename = "shutdown")]
    Shutdown {
        #[serde(rename = "gracefulTimeoutSeconds", skip_serializing_if = "Option::is_none")]
        graceful_timeout_seconds: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename = "status")]
    Status {
        state: LifecycleState,
        #[serde(rename = "osPid", skip_serializing_if = "Option::is_none")]
        os_pid: Option<u32>,
        #[serde(rename = "exitCode", skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        timestamp: u64,
    },

    #[serde(rename = "output")]
    Output {
        data: String,
        #[serde(rename = "isError")]
        is_error: bool,
        timestamp: u64,
    },

    #[serde(rename = "ack")]
    Ack {
        #[serde(rename = "acknowledgedId")]
        acknowledged_id: String,
        success: bool,
        #[serde(rename = "errorMessage", skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        timestamp: u64,
    },
}

/// Maximum length of one captured output line before truncation (§4.2).
pub const MAX_OUTPUT_LINE_BYTES: usize = 64 * 1024;
const TRUNCATION_SUFFIX: &str = "... [TRUNCATED]";

impl Message {
    /// Decode a single frame's payload. Returns `None` on malformed JSON or
    /// a missing/unknown `type` — the frame is consumed and logged, not
    /// treated as connection-fatal (§4.2, §7).
    pub fn decode(payload: &[u8]) -> Option<Message> {
        match serde_json::from_slice::<Message>(payload) {
            Ok(msg) => Some(msg),
            Err(e) => {
                tracing::warn!("dropping malformed or unknown frame: {e}");
                None
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn status(state: LifecycleState, os_pid: Option<u32>, exit_code: Option<i32>, message: Option<String>) -> Message {
        Message::Status {
            state,
            os_pid,
            exit_code,
            message,
            timestamp: unix_timestamp(),
        }
    }

    pub fn ack(acknowledged_id: String, success: bool, error_message: Option<String>) -> Message {
        Message::Ack {
            acknowledged_id,
            success,
            error_message,
            timestamp: unix_timestamp(),
        }
    }

    /// Echo a heartbeat back to the parent with `{sequence, timestamp,
    /// serverId}` (§4.2).
    pub fn heartbeat_echo(sequence: i64, server_id: String) -> Message {
        Message::Heartbeat {
            sequence,
            timestamp: Some(unix_timestamp()),
            server_id: Some(server_id),
        }
    }

    /// Build one `output` message from a captured line, applying the 64 KiB
    /// truncation rule of §4.2.
    pub fn output_line(mut line: String, is_error: bool) -> Message {
        if line.len() > MAX_OUTPUT_LINE_BYTES {
            let keep = MAX_OUTPUT_LINE_BYTES.saturating_sub(TRUNCATION_SUFFIX.len());
            let mut boundary = keep.min(line.len());
            while boundary > 0 && !line.is_char_boundary(boundary) {
                boundary -= 1;
            }
            line.truncate(boundary);
            line.push_str(TRUNCATION_SUFFIX);
        }
        Message::Output {
            data: line,
            is_error,
            timestamp: unix_timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_decodes_to_none() {
        let payload = br#"{"type":"frobnicate","foo":"bar"}"#;
        assert!(Message::decode(payload).is_none());
    }

    #[test]
    fn malformed_json_decodes_to_none() {
        assert!(Message::decode(b"{not json").is_none());
    }

    #[test]
    fn missing_type_decodes_to_none() {
        assert!(Message::decode(br#"{"foo":"bar"}"#).is_none());
    }

    #[test]
    fn command_round_trips() {
        let msg = Message::Command {
            command: CommandKind::Stop,
            correlation_id: Some("X".into()),
            timeout_seconds: Some(2),
        };
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        match decoded {
            Message::Command {
                command,
                correlation_id,
                timeout_seconds,
            } => {
                assert!(matches!(command, CommandKind::Stop));
                assert_eq!(correlation_id.as_deref(), Some("X"));
                assert_eq!(timeout_seconds, Some(2));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn output_line_truncates_over_64kib() {
        let line = "a".repeat(MAX_OUTPUT_LINE_BYTES + 500);
        let msg = Message::output_line(line, false);
        match msg {
            Message::Output { data, .. } => {
                assert!(data.len() <= MAX_OUTPUT_LINE_BYTES);
                assert!(data.ends_with(TRUNCATION_SUFFIX));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn output_line_under_limit_is_untouched() {
        let msg = Message::output_line("short line".to_string(), true);
        match msg {
            Message::Output { data, is_error, .. } => {
                assert_eq!(data, "short line");
                assert!(is_error);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
