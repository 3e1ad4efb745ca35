//! Bridge event vocabulary.
//!
//! Everything a run publishes to its subscribers is one of these variants.
//! They serialize to the `{"type": ..., ...}` envelope the web client speaks;
//! tag-content events use the kebab-cased tag name as their type string, so
//! the envelope is built by hand rather than with an internally tagged derive.

use serde::{Serialize, Serializer};
use serde_json::{Value, json};

use crate::tags::TagKind;

/// A single event on a run's stream, in publish order.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// Sent once per WebSocket connection before any replay.
    ConnectionAck { run_id: String },
    /// The launch command was assembled; no process exists yet.
    Start { command: String, working_dir: String },
    /// The child process is up.
    ProcessStarted { pid: u32, log_file: String },
    /// Released free-form output.
    Output { text: String },
    /// A completed tag segment with its decoded payload.
    Tag {
        kind: TagKind,
        data: Value,
        stream_id: String,
    },
    /// An opening delimiter was observed; content follows under `stream_id`.
    StreamStart { stream_id: String, kind: TagKind },
    /// The segment under `stream_id` closed.
    StreamEnd { stream_id: String, kind: TagKind },
    /// A tag was still open when the stream ended.
    IncompleteTag {
        stream_id: String,
        kind: TagKind,
        partial_content: String,
    },
    /// The child appears blocked on input.
    Prompt { prompt: String, multiline: bool },
    /// Additional prompt context observed while a reply is already pending.
    PromptContinuation { prompt: String },
    /// Admission placed the run in the wait queue.
    Queued {
        position: usize,
        estimated_wait_minutes: u64,
        message: String,
    },
    /// Queue position changed; position 0 means the run is starting.
    QueueUpdate { position: usize, message: String },
    /// The run was cancelled before or during execution.
    Cancelled { message: String },
    Error { error: String },
    /// Terminal event: the child exited.
    Complete { exit_code: i32, success: bool },
    /// Reply to a client ping on the same connection.
    Pong,
}

impl BridgeEvent {
    /// The JSON envelope sent over the wire and written to the event log.
    pub fn wire_value(&self) -> Value {
        match self {
            BridgeEvent::ConnectionAck { run_id } => json!({
                "type": "connection_ack",
                "data": { "run_id": run_id },
            }),
            BridgeEvent::Start {
                command,
                working_dir,
            } => json!({
                "type": "start",
                "data": { "pid": null, "command": command, "working_dir": working_dir },
            }),
            BridgeEvent::ProcessStarted { pid, log_file } => json!({
                "type": "process_started",
                "data": { "pid": pid, "log_file": log_file },
            }),
            BridgeEvent::Output { text } => json!({
                "type": "output",
                "data": text,
            }),
            BridgeEvent::Tag {
                kind,
                data,
                stream_id,
            } => json!({
                "type": kind.wire_type(),
                "data": data,
                "tag_type": kind.name(),
                "stream_id": stream_id,
                "stream_complete": true,
            }),
            BridgeEvent::StreamStart { stream_id, kind } => json!({
                "type": "stream_start",
                "stream_id": stream_id,
                "tag_type": kind.name(),
            }),
            BridgeEvent::StreamEnd { stream_id, kind } => json!({
                "type": "stream_end",
                "stream_id": stream_id,
                "tag_type": kind.name(),
            }),
            BridgeEvent::IncompleteTag {
                stream_id,
                kind,
                partial_content,
            } => json!({
                "type": "incomplete_tag",
                "stream_id": stream_id,
                "tag_type": kind.name(),
                "partial_content": partial_content,
            }),
            BridgeEvent::Prompt { prompt, multiline } => json!({
                "type": "prompt",
                "data": { "prompt": prompt, "multiline": multiline },
            }),
            BridgeEvent::PromptContinuation { prompt } => json!({
                "type": "prompt_continuation",
                "data": { "prompt": prompt },
            }),
            BridgeEvent::Queued {
                position,
                estimated_wait_minutes,
                message,
            } => json!({
                "type": "queued",
                "data": {
                    "position": position,
                    "estimated_wait_minutes": estimated_wait_minutes,
                    "message": message,
                },
            }),
            BridgeEvent::QueueUpdate { position, message } => json!({
                "type": "queue_update",
                "data": { "position": position, "message": message },
            }),
            BridgeEvent::Cancelled { message } => json!({
                "type": "cancelled",
                "data": { "message": message },
            }),
            BridgeEvent::Error { error } => json!({
                "type": "error",
                "data": { "error": error },
            }),
            BridgeEvent::Complete { exit_code, success } => json!({
                "type": "complete",
                "data": { "exit_code": exit_code, "success": success },
            }),
            BridgeEvent::Pong => json!({ "type": "pong" }),
        }
    }

    /// Wire envelope as a compact JSON string.
    pub fn wire_text(&self) -> String {
        self.wire_value().to_string()
    }
}

impl Serialize for BridgeEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.wire_value().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_event_uses_kebab_type_with_stream_metadata() {
        let event = BridgeEvent::Tag {
            kind: TagKind::ExecutorToolCall,
            data: json!({"tool": "slither"}),
            stream_id: "stream_3".to_string(),
        };
        assert_eq!(
            event.wire_value(),
            json!({
                "type": "executor-tool-call",
                "data": {"tool": "slither"},
                "tag_type": "EXECUTOR_TOOL_CALL",
                "stream_id": "stream_3",
                "stream_complete": true,
            })
        );
    }

    #[test]
    fn prompt_event_shape() {
        let event = BridgeEvent::Prompt {
            prompt: "Enter the contract name (e.g., Vault):".to_string(),
            multiline: false,
        };
        assert_eq!(
            event.wire_value(),
            json!({
                "type": "prompt",
                "data": {
                    "prompt": "Enter the contract name (e.g., Vault):",
                    "multiline": false,
                },
            })
        );
    }

    #[test]
    fn stream_framing_events_carry_top_level_fields() {
        let start = BridgeEvent::StreamStart {
            stream_id: "stream_1".to_string(),
            kind: TagKind::Agent,
        };
        let value = start.wire_value();
        assert_eq!(value["type"], "stream_start");
        assert_eq!(value["stream_id"], "stream_1");
        assert_eq!(value["tag_type"], "AGENT");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn complete_event_shape() {
        let event = BridgeEvent::Complete {
            exit_code: 0,
            success: true,
        };
        assert_eq!(
            event.wire_value(),
            json!({"type": "complete", "data": {"exit_code": 0, "success": true}})
        );
    }

    #[test]
    fn serialize_matches_wire_value() {
        let event = BridgeEvent::Queued {
            position: 2,
            estimated_wait_minutes: 30,
            message: "waiting for a free slot".to_string(),
        };
        let direct = serde_json::to_value(&event).unwrap();
        assert_eq!(direct, event.wire_value());
    }

    #[test]
    fn all_variants_produce_a_type_field() {
        let events = vec![
            BridgeEvent::ConnectionAck {
                run_id: "r1".to_string(),
            },
            BridgeEvent::Start {
                command: "python agent.py".to_string(),
                working_dir: "/work".to_string(),
            },
            BridgeEvent::ProcessStarted {
                pid: 42,
                log_file: "/logs/r1_output.log".to_string(),
            },
            BridgeEvent::Output {
                text: "hello".to_string(),
            },
            BridgeEvent::StreamEnd {
                stream_id: "stream_1".to_string(),
                kind: TagKind::Summary,
            },
            BridgeEvent::IncompleteTag {
                stream_id: "stream_2".to_string(),
                kind: TagKind::Planner,
                partial_content: "{\"half".to_string(),
            },
            BridgeEvent::PromptContinuation {
                prompt: "(y/N):".to_string(),
            },
            BridgeEvent::QueueUpdate {
                position: 0,
                message: "now starting".to_string(),
            },
            BridgeEvent::Cancelled {
                message: "cancelled by user".to_string(),
            },
            BridgeEvent::Error {
                error: "boom".to_string(),
            },
            BridgeEvent::Pong,
        ];
        for event in events {
            let value = event.wire_value();
            assert!(value.get("type").is_some(), "missing type: {event:?}");
        }
    }
}
