//! JSON view payloads consumed by dashboard widgets.
//!
//! These are the fixed schemas of the data the operation surface returns for
//! rendering. Integer fields that can be unavailable for one tick are
//! `Option`s and serialize to JSON `null`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ControlError;
use crate::nodes::{NodeKind, NodeStatus};

/// One row of the `list-nodes` payload.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub status: NodeStatus,
    /// Wall-clock launch time, epoch milliseconds.
    pub started_at: u64,
    /// `erlang:system_info(process_count)` of the node, or `null` when the
    /// node was not queryable this tick.
    pub process_count: Option<u64>,
}

/// One registered process in the `inspect-node` payload.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessView {
    pub name: String,
    pub status: String,
    pub message_queue_len: u64,
    pub memory: u64,
    /// Rendered as `module:function/arity`.
    pub current_function: String,
}

/// The `inspect-node` payload.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InspectView {
    pub node_name: String,
    pub node_type: NodeKind,
    /// Milliseconds since the node was launched.
    pub uptime: u64,
    pub processes: Vec<ProcessView>,
}

/// One message-flow edge observed in the most recent trace poll window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TraceEdge {
    pub from: String,
    pub to: String,
    pub count: u64,
}

/// The `poll-trace` payload. Counts are per-window deltas; cumulative
/// accumulation across polls is the consumer's concern.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TraceView {
    pub active: bool,
    pub edges: Vec<TraceEdge>,
}

/// The discriminated `{ok}` / `{err}` value every operation yields to the
/// outer framework.
#[derive(Debug, Clone, Serialize, JsonSchema)]
#[serde(untagged)]
pub enum OpReport {
    Ok {
        ok: String,
    },
    Err {
        /// One-line human-readable reason.
        err: String,
        /// Stable machine-readable error token.
        code: String,
    },
}

impl From<Result<String, ControlError>> for OpReport {
    fn from(result: Result<String, ControlError>) -> Self {
        match result {
            Ok(ok) => OpReport::Ok { ok },
            Err(err) => OpReport::Err {
                code: err.kind().to_string(),
                err: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_process_count_serializes_to_null() {
        let row = NodeSummary {
            name: "w1".into(),
            kind: NodeKind::Erlang,
            status: NodeStatus::Running,
            started_at: 1_700_000_000_000,
            process_count: None,
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["type"], "erlang");
        assert_eq!(json["status"], "running");
        assert_eq!(json["startedAt"], 1_700_000_000_000u64);
        assert!(json["processCount"].is_null());
    }

    #[test]
    fn inspect_payload_uses_camel_case_fields() {
        let view = InspectView {
            node_name: "w1".into(),
            node_type: NodeKind::Elixir,
            uptime: 2500,
            processes: vec![ProcessView {
                name: "kv_store".into(),
                status: "waiting".into(),
                message_queue_len: 0,
                memory: 2832,
                current_function: "gen_server:loop/7".into(),
            }],
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["nodeName"], "w1");
        assert_eq!(json["nodeType"], "elixir");
        assert_eq!(json["processes"][0]["messageQueueLen"], 0);
        assert_eq!(json["processes"][0]["currentFunction"], "gen_server:loop/7");
    }

    #[test]
    fn op_report_shapes_match_the_contract() {
        let ok = OpReport::from(Ok("started".to_string()));
        assert_eq!(serde_json::to_value(&ok).unwrap(), serde_json::json!({"ok": "started"}));

        let err = OpReport::from(Err(ControlError::NodeUnknown("w9".into())));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "node_unknown");
        assert_eq!(json["err"], "unknown node: w9");
    }
}
