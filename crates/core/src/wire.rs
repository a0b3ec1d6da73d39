//! Message schemas and queue-topology helpers (spec §6).
//!
//! These are the stable wire contracts shared by the broker, store and
//! engine crates — and, notionally, by SDK clients and worker processes
//! that never appear in this repo.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ContextItem;

// ── Queue / exchange names ────────────────────────────────────────────

pub const STAGE_RESULT_QUEUE: &str = "StageResult";
pub const STAGE_SET_STATUS_QUEUE: &str = "StageSetStatus";
pub const STAGE_UPDATED_QUEUE: &str = "StageUpdated";
pub const STAGE_UPDATED_FANOUT_EXCHANGE: &str = "StageUpdated.fanout";

/// `<appId>_<handler>_StageNext` — the per-handler work queue a scheduler
/// publishes to and SDK workers consume from.
pub fn stage_next_queue(app_id: &str, stage_handler_name: &str) -> String {
    format!("{app_id}_{stage_handler_name}_StageNext")
}

/// `<q>.dlx` direct exchange name for a queue's dead-letter policy.
pub fn dlx_name(queue: &str) -> String {
    format!("{queue}.dlx")
}

/// `<q>.dlq` durable queue name for a queue's dead-letter policy.
pub fn dlq_name(queue: &str) -> String {
    format!("{queue}.dlq")
}

// ── Message payloads ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageNextMessage {
    pub app_id: String,
    pub stage_id: i64,
    pub pipeline_id: Option<i64>,
    pub trace_id: String,
    pub span_id: String,
    pub stage_handler_name: String,
    pub input: String,
    pub prev_stage_output: String,
    pub context_items: Vec<ContextItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResultLogEntry {
    pub message: String,
    pub log_level: String,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResultMessage {
    pub pipeline_id: Option<i64>,
    pub stage_id: i64,
    pub result: String,
    pub is_success: bool,
    #[serde(default)]
    pub next_stage_id: Option<i64>,
    #[serde(default)]
    pub run_next_if_current_failed: bool,
    #[serde(default)]
    pub logs: Vec<StageResultLogEntry>,
    #[serde(default)]
    pub context_items: Vec<ContextItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStageStatusMessage {
    pub stage_id: i64,
    pub status: String,
}

// ── Transition / alert events (spec §4.2, §7) ─────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageAlertEvent {
    pub pipeline_id: Option<i64>,
    pub stage_id: i64,
    pub pipeline_name: String,
    pub stage_name: String,
    pub old_status: String,
    pub new_status: String,
    pub source: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAlertEvent {
    pub worker_id: uuid::Uuid,
    pub worker_name: String,
    pub event_type: String,
    pub level: String,
    pub message: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyAlertEvent {
    pub key: String,
    pub message: String,
    pub ts: DateTime<Utc>,
}

// ── Pipeline creation request (used by createPipeline) ────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStageRequest {
    pub name: String,
    pub stage_handler_name: String,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub options: crate::model::StageOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePipelineRequest {
    pub name: String,
    #[serde(default)]
    pub trace_id: Option<String>,
    pub application_id: String,
    #[serde(default)]
    pub is_event: bool,
    pub stages: Vec<CreateStageRequest>,
    #[serde(default)]
    pub context: Vec<ContextItem>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_next_queue_naming() {
        assert_eq!(stage_next_queue("app1", "h1"), "app1_h1_StageNext");
    }

    #[test]
    fn dlx_dlq_naming() {
        assert_eq!(dlx_name("StageResult"), "StageResult.dlx");
        assert_eq!(dlq_name("StageResult"), "StageResult.dlq");
    }

    #[test]
    fn stage_result_message_serde_roundtrip() {
        let msg = StageResultMessage {
            pipeline_id: Some(1),
            stage_id: 2,
            result: "R1".into(),
            is_success: true,
            next_stage_id: None,
            run_next_if_current_failed: false,
            logs: vec![StageResultLogEntry {
                message: "done".into(),
                log_level: "info".into(),
                created: Utc::now(),
            }],
            context_items: vec![],
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: StageResultMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.stage_id, 2);
        assert_eq!(back.logs.len(), 1);
    }
}
