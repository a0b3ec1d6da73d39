//! Domain entities for the pipeline/stage state machine.
//!
//! Mirrors spec §3: `Pipeline` owns an ordered (or DAG) set of `Stage`s,
//! each stage append-logs to `StageLog`, and pipelines carry free-form
//! `ContextItem`s and `PipelineKeyword`s. `WorkerRegistration`/`WorkerEvent`
//! are the sibling worker-registry entities (C8).

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ModelError;

// ── Status enums (string-exact per spec §6) ──────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum StageStatus {
    NotStarted,
    Running,
    Pending,
    RetryScheduled,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    /// Terminal states a stage settles into at most once (invariant S2).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped
        )
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageStatus::NotStarted => "NotStarted",
            StageStatus::Running => "Running",
            StageStatus::Pending => "Pending",
            StageStatus::RetryScheduled => "RetryScheduled",
            StageStatus::Completed => "Completed",
            StageStatus::Failed => "Failed",
            StageStatus::Skipped => "Skipped",
        };
        write!(f, "{s}")
    }
}

impl FromStr for StageStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NotStarted" => Ok(StageStatus::NotStarted),
            "Running" => Ok(StageStatus::Running),
            "Pending" => Ok(StageStatus::Pending),
            "RetryScheduled" => Ok(StageStatus::RetryScheduled),
            "Completed" => Ok(StageStatus::Completed),
            "Failed" => Ok(StageStatus::Failed),
            "Skipped" => Ok(StageStatus::Skipped),
            other => Err(ModelError::UnknownStageStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum PipelineStatus {
    NotStarted,
    Running,
    Completed,
    Failed,
}

impl PipelineStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineStatus::Completed | PipelineStatus::Failed)
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineStatus::NotStarted => "NotStarted",
            PipelineStatus::Running => "Running",
            PipelineStatus::Completed => "Completed",
            PipelineStatus::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PipelineStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NotStarted" => Ok(PipelineStatus::NotStarted),
            "Running" => Ok(PipelineStatus::Running),
            "Completed" => Ok(PipelineStatus::Completed),
            "Failed" => Ok(PipelineStatus::Failed),
            other => Err(ModelError::UnknownPipelineStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Ready,
    Degraded,
    Draining,
    Stopped,
    Error,
    Offline,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Starting => "starting",
            WorkerState::Ready => "ready",
            WorkerState::Degraded => "degraded",
            WorkerState::Draining => "draining",
            WorkerState::Stopped => "stopped",
            WorkerState::Error => "error",
            WorkerState::Offline => "offline",
        };
        write!(f, "{s}")
    }
}

impl FromStr for WorkerState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(WorkerState::Starting),
            "ready" => Ok(WorkerState::Ready),
            "degraded" => Ok(WorkerState::Degraded),
            "draining" => Ok(WorkerState::Draining),
            "stopped" => Ok(WorkerState::Stopped),
            "error" => Ok(WorkerState::Error),
            "offline" => Ok(WorkerState::Offline),
            other => Err(ModelError::UnknownWorkerState(other.to_string())),
        }
    }
}

// ── Stage options (spec §3) ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOptions {
    #[serde(default = "default_true")]
    pub run_next_if_failed: bool,
    #[serde(default)]
    pub retry_interval_s: u32,
    #[serde(default)]
    pub time_out_s: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub run_in_parallel_with: Vec<String>,
    #[serde(default)]
    pub fail_if_output_empty: bool,
    #[serde(default)]
    pub notify_on_failure: bool,
    #[serde(default)]
    pub run_as_user: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            run_next_if_failed: true,
            retry_interval_s: 0,
            time_out_s: 0,
            max_retries: 0,
            depends_on: Vec::new(),
            run_in_parallel_with: Vec::new(),
            fail_if_output_empty: false,
            notify_on_failure: false,
            run_as_user: None,
        }
    }
}

// ── Stage ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: i64,
    pub pipeline_id: Option<i64>,
    pub span_id: String,
    pub name: String,
    pub stage_handler_name: String,
    pub status: StageStatus,
    /// Position within the pipeline's submitted stage order; used as the
    /// scheduler tie-break (spec §4.2 step 2) and for implicit chaining.
    pub stage_order: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub input: Option<String>,
    pub output: Option<String>,
    pub is_skipped: bool,
    pub is_event: bool,
    pub next_stage_id: Option<i64>,
    pub options: StageOptions,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ── StageLog ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageLog {
    pub id: i64,
    pub stage_id: i64,
    pub level: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

// ── Pipeline context / keywords ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub key: String,
    pub value: String,
    pub value_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineKeyword {
    pub keyword: String,
}

// ── Pipeline ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: i64,
    pub name: String,
    pub trace_id: String,
    pub application_id: String,
    pub status: PipelineStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub is_event: bool,
    /// Last mutation time — used by consumers to discard stale fan-out
    /// replacements when snapshots arrive out of order (spec §9).
    pub updated_at: DateTime<Utc>,
    pub context: Vec<ContextItem>,
    pub keywords: Vec<PipelineKeyword>,
}

/// A fully hydrated pipeline — the "snapshot" fan-out to dashboards (C6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    #[serde(flatten)]
    pub pipeline: Pipeline,
    pub stages: Vec<Stage>,
    pub logs: Vec<StageLog>,
}

// ── Worker registry (C8) ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub id: Uuid,
    pub application_id: String,
    pub worker_name: String,
    pub instance_id: String,
    pub session_token: String,
    pub state: WorkerState,
    pub supported_handlers: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub in_flight_jobs: i32,
    pub jobs_processed: i64,
    pub jobs_failed: i64,
    pub resource_metrics: serde_json::Value,
    pub capabilities: serde_json::Value,
    pub metadata: serde_json::Value,
}

impl WorkerRegistration {
    /// Effective-state resolution (invariant W1): derived at query time from
    /// `last_seen_at` rather than persisted, so a crashed worker is reported
    /// `offline` without any background sweep having to run first.
    pub fn effective_state(&self, now: DateTime<Utc>, offline_after: chrono::Duration) -> WorkerState {
        if self.state != WorkerState::Stopped && now - self.last_seen_at > offline_after {
            WorkerState::Offline
        } else {
            self.state
        }
    }

    pub fn session_valid(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.started_at <= ttl
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEvent {
    pub id: i64,
    pub worker_id: Uuid,
    pub ts: DateTime<Utc>,
    pub level: String,
    pub event_type: String,
    pub message: String,
    pub details: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_status_roundtrips_string() {
        for s in [
            StageStatus::NotStarted,
            StageStatus::Running,
            StageStatus::Pending,
            StageStatus::RetryScheduled,
            StageStatus::Completed,
            StageStatus::Failed,
            StageStatus::Skipped,
        ] {
            let parsed: StageStatus = s.to_string().parse().unwrap();
            assert_eq!(parsed.to_string(), s.to_string());
        }
    }

    #[test]
    fn unknown_stage_status_errors() {
        assert!("Bogus".parse::<StageStatus>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(StageStatus::Completed.is_terminal());
        assert!(StageStatus::Failed.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
    }

    #[test]
    fn worker_effective_state_flips_offline_after_threshold() {
        let now = Utc::now();
        let mut w = WorkerRegistration {
            id: Uuid::new_v4(),
            application_id: "app".into(),
            worker_name: "w1".into(),
            instance_id: "i1".into(),
            session_token: "tok".into(),
            state: WorkerState::Ready,
            supported_handlers: vec![],
            started_at: now,
            last_seen_at: now - chrono::Duration::seconds(46),
            stopped_at: None,
            in_flight_jobs: 0,
            jobs_processed: 0,
            jobs_failed: 0,
            resource_metrics: serde_json::json!({}),
            capabilities: serde_json::json!({}),
            metadata: serde_json::json!({}),
        };
        assert_eq!(
            w.effective_state(now, chrono::Duration::seconds(45)),
            WorkerState::Offline
        );
        w.last_seen_at = now;
        assert_eq!(
            w.effective_state(now, chrono::Duration::seconds(45)),
            WorkerState::Ready
        );
        w.state = WorkerState::Stopped;
        w.last_seen_at = now - chrono::Duration::seconds(1000);
        assert_eq!(
            w.effective_state(now, chrono::Duration::seconds(45)),
            WorkerState::Stopped
        );
    }
}
