//! CLI tunnel wire protocol.
//!
//! Frames are JSON objects `{event, payload}` exchanged over one persistent
//! WebSocket per CLI client. Request-carrying frames include a server-chosen
//! `requestId` that the CLI echoes back in the matching `*:result` reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Server -> CLI frames
// ============================================================================

/// Frames the server pushes down the tunnel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload")]
pub enum ServerFrame {
    /// Evaluate a script against the workspace's IDE.
    #[serde(rename = "cdp:eval", rename_all = "camelCase")]
    CdpEval {
        request_id: String,
        expression: String,
        /// Options the CLI forwards to its local evaluation (timeouts etc).
        options: Value,
    },

    /// List the IDE's debuggable targets.
    #[serde(rename = "cdp:targets", rename_all = "camelCase")]
    CdpTargets { request_id: String },

    /// Run a command on the CLI host.
    #[serde(rename = "cli:exec", rename_all = "camelCase")]
    CliExec {
        request_id: String,
        command: Vec<String>,
    },

    /// Ask the CLI to stop its workspace.
    #[serde(rename = "workspace:stop", rename_all = "camelCase")]
    WorkspaceStop { request_id: String },

    /// Ask the CLI to restart its workspace.
    #[serde(rename = "workspace:restart", rename_all = "camelCase")]
    WorkspaceRestart { request_id: String },

    /// Keepalive.
    #[serde(rename = "ping")]
    Ping,
}

// ============================================================================
// CLI -> Server frames
// ============================================================================

/// Frames the CLI sends back up the tunnel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload")]
pub enum CliFrame {
    #[serde(rename = "cdp:eval:result", rename_all = "camelCase")]
    CdpEvalResult {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "cdp:targets:result", rename_all = "camelCase")]
    CdpTargetsResult {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "cli:exec:result", rename_all = "camelCase")]
    CliExecResult {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "workspace:stop:result", rename_all = "camelCase")]
    WorkspaceStopResult {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "workspace:restart:result", rename_all = "camelCase")]
    WorkspaceRestartResult {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// The CLI's workspace is up and reachable.
    #[serde(rename = "cli:ready")]
    CliReady,

    /// The CLI's workspace went down.
    #[serde(rename = "cli:stopped")]
    CliStopped,

    /// Keepalive reply.
    #[serde(rename = "pong")]
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cdp_eval_frame_wire_shape() {
        let frame = ServerFrame::CdpEval {
            request_id: "r-1".to_string(),
            expression: "1+1".to_string(),
            options: json!({"timeoutMs": 15000}),
        };
        let wire: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            wire,
            json!({
                "event": "cdp:eval",
                "payload": {
                    "requestId": "r-1",
                    "expression": "1+1",
                    "options": {"timeoutMs": 15000},
                },
            })
        );
    }

    #[test]
    fn ping_frame_has_no_payload() {
        let wire = serde_json::to_string(&ServerFrame::Ping).unwrap();
        assert_eq!(wire, r#"{"event":"ping"}"#);
    }

    #[test]
    fn eval_result_parses_with_result_or_error() {
        let ok: CliFrame = serde_json::from_str(
            r#"{"event":"cdp:eval:result","payload":{"requestId":"r-1","result":{"ok":true}}}"#,
        )
        .unwrap();
        assert_eq!(
            ok,
            CliFrame::CdpEvalResult {
                request_id: "r-1".to_string(),
                result: Some(json!({"ok": true})),
                error: None,
            }
        );

        let failed: CliFrame = serde_json::from_str(
            r#"{"event":"cdp:eval:result","payload":{"requestId":"r-2","error":"target gone"}}"#,
        )
        .unwrap();
        assert_eq!(
            failed,
            CliFrame::CdpEvalResult {
                request_id: "r-2".to_string(),
                result: None,
                error: Some("target gone".to_string()),
            }
        );
    }

    #[test]
    fn unsolicited_frames_parse_without_payload() {
        let ready: CliFrame = serde_json::from_str(r#"{"event":"cli:ready"}"#).unwrap();
        assert_eq!(ready, CliFrame::CliReady);

        let stopped: CliFrame = serde_json::from_str(r#"{"event":"cli:stopped"}"#).unwrap();
        assert_eq!(stopped, CliFrame::CliStopped);

        let pong: CliFrame = serde_json::from_str(r#"{"event":"pong"}"#).unwrap();
        assert_eq!(pong, CliFrame::Pong);
    }

    #[test]
    fn stop_and_restart_frames_round_trip() {
        for frame in [
            ServerFrame::WorkspaceStop {
                request_id: "r-3".to_string(),
            },
            ServerFrame::WorkspaceRestart {
                request_id: "r-4".to_string(),
            },
            ServerFrame::CliExec {
                request_id: "r-5".to_string(),
                command: vec!["git".to_string(), "status".to_string()],
            },
        ] {
            let wire = serde_json::to_string(&frame).unwrap();
            let parsed: ServerFrame = serde_json::from_str(&wire).unwrap();
            assert_eq!(parsed, frame);
        }
    }
}
