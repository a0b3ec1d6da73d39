use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use stagework_alerts::AlertSink;
use stagework_core::{
    CreatePipelineRequest, Pipeline, PipelineSnapshot, PipelineStatus, SetStageStatusMessage,
    Stage, StageAlertEvent, StageResultMessage, StageStatus,
};

use crate::error::StoreError;
use crate::row::StageRow;
use crate::schedule;
use crate::snapshot;

/// Sole mutator of pipeline/stage state (spec §4.2). Every public method
/// runs inside its own transaction; row-level locks serialize contenders
/// on the same pipeline so multiple engine replicas stay safe (spec §4.3,
/// §5).
pub struct Store {
    pool: PgPool,
    alert_sink: Arc<dyn AlertSink>,
}

impl Store {
    pub fn new(pool: PgPool, alert_sink: Arc<dyn AlertSink>) -> Self {
        Self { pool, alert_sink }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Inserts a pipeline with its ordered stages, context and keywords in
    /// one transaction. Zero-stage pipelines settle immediately into
    /// `Completed` (spec §8 boundary behavior).
    pub async fn create_pipeline(&self, req: CreatePipelineRequest) -> Result<Pipeline, StoreError> {
        validate_request(&req)?;

        let mut tx = self.pool.begin().await?;
        let trace_id = req.trace_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

        let is_empty = req.stages.is_empty();
        let (status, finished_at) = if is_empty {
            ("Completed", Some(Utc::now()))
        } else {
            ("NotStarted", None)
        };

        let pipeline_id: i64 = sqlx::query_scalar(
            "INSERT INTO pipeline (name, trace_id, application_id, status, is_event, finished_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
        )
        .bind(&req.name)
        .bind(&trace_id)
        .bind(&req.application_id)
        .bind(status)
        .bind(req.is_event)
        .bind(finished_at)
        .fetch_one(&mut *tx)
        .await?;

        for item in &req.context {
            sqlx::query(
                "INSERT INTO pipeline_context (pipeline_id, key, value, value_type)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (pipeline_id, key) DO UPDATE SET value = EXCLUDED.value,
                     value_type = EXCLUDED.value_type",
            )
            .bind(pipeline_id)
            .bind(&item.key)
            .bind(&item.value)
            .bind(&item.value_type)
            .execute(&mut *tx)
            .await?;
        }

        for keyword in &req.keywords {
            sqlx::query(
                "INSERT INTO pipeline_keyword (pipeline_id, keyword) VALUES ($1, $2)
                 ON CONFLICT DO NOTHING",
            )
            .bind(pipeline_id)
            .bind(keyword)
            .execute(&mut *tx)
            .await?;
        }

        let mut stage_ids = Vec::with_capacity(req.stages.len());
        for (idx, stage_req) in req.stages.iter().enumerate() {
            let span_id = Uuid::new_v4().to_string();
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO stage (pipeline_id, span_id, name, stage_handler_name, status,
                                     stage_order, input, options)
                 VALUES ($1, $2, $3, $4, 'NotStarted', $5, $6, $7)
                 RETURNING id",
            )
            .bind(pipeline_id)
            .bind(&span_id)
            .bind(&stage_req.name)
            .bind(&stage_req.stage_handler_name)
            .bind(idx as i64)
            .bind(&stage_req.input)
            .bind(Json(&stage_req.options))
            .fetch_one(&mut *tx)
            .await?;
            stage_ids.push(id);
        }

        // Resolve the implicit chain: stage i's nextStageId is stage i+1's id.
        for window in stage_ids.windows(2) {
            let (prev, next) = (window[0], window[1]);
            sqlx::query("UPDATE stage SET next_stage_id = $1 WHERE id = $2")
                .bind(next)
                .bind(prev)
                .execute(&mut *tx)
                .await?;
        }

        let snapshot = snapshot::hydrate(&mut tx, pipeline_id)
            .await?
            .ok_or(StoreError::UnknownPipeline(pipeline_id))?;
        tx.commit().await?;

        Ok(snapshot.pipeline)
    }

    /// Scheduling primitive (spec §4.2 `getStageToExecute`).
    pub async fn get_stage_to_execute(&self) -> Result<Option<Stage>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let stage = schedule::get_stage_to_execute(&mut tx).await?;
        tx.commit().await?;
        Ok(stage)
    }

    /// Applies a `StageResultMessage` (spec §4.2 `updateStageResult`).
    pub async fn update_stage_result(&self, msg: StageResultMessage) -> Result<PipelineSnapshot, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, StageRow>(
            "SELECT id, pipeline_id, span_id, name, stage_handler_name, status, stage_order,
                    created_at, started_at, finished_at, input, output, is_skipped, is_event,
                    next_stage_id, options
             FROM stage WHERE id = $1 FOR UPDATE",
        )
        .bind(msg.stage_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::UnknownStage(msg.stage_id))?;

        let pipeline_id = row.pipeline_id;
        let old_status: StageStatus = row.status.parse()?;

        for log in &msg.logs {
            insert_log_deduped(&mut tx, msg.stage_id, &log.log_level, &log.message, log.created).await?;
        }

        for item in &msg.context_items {
            if let Some(pid) = pipeline_id {
                sqlx::query(
                    "INSERT INTO pipeline_context (pipeline_id, key, value, value_type)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (pipeline_id, key) DO UPDATE SET value = EXCLUDED.value,
                         value_type = EXCLUDED.value_type",
                )
                .bind(pid)
                .bind(&item.key)
                .bind(&item.value)
                .bind(&item.value_type)
                .execute(&mut *tx)
                .await?;
            }
        }

        let mut new_status = old_status;
        if !old_status.is_terminal() {
            if msg.is_success {
                new_status = StageStatus::Completed;
                sqlx::query(
                    "UPDATE stage SET status = 'Completed', output = $1, finished_at = now()
                     WHERE id = $2",
                )
                .bind(&msg.result)
                .bind(msg.stage_id)
                .execute(&mut *tx)
                .await?;

                if let Some(next_id) = msg.next_stage_id {
                    sqlx::query("UPDATE stage SET next_stage_id = $1 WHERE id = $2")
                        .bind(next_id)
                        .bind(msg.stage_id)
                        .execute(&mut *tx)
                        .await?;
                }
            } else {
                new_status = StageStatus::Failed;
                sqlx::query(
                    "UPDATE stage SET status = 'Failed', output = $1, finished_at = now()
                     WHERE id = $2",
                )
                .bind(&msg.result)
                .bind(msg.stage_id)
                .execute(&mut *tx)
                .await?;

                if !msg.run_next_if_current_failed {
                    cascade_skip_chain(&mut tx, row.next_stage_id).await?;
                }
            }
        }

        let pipeline_id = if let Some(pid) = pipeline_id {
            recompute_pipeline_status(&mut tx, pid).await?;
            Some(pid)
        } else {
            None
        };

        let pending_alert = if old_status != new_status {
            match pipeline_id {
                Some(pid) => Some(
                    build_stage_alert_event(&mut tx, pid, msg.stage_id, old_status, new_status, "updateStageResult")
                        .await?,
                ),
                None => None,
            }
        } else {
            None
        };

        let snapshot = match pipeline_id {
            Some(pid) => snapshot::hydrate(&mut tx, pid).await?.ok_or(StoreError::UnknownPipeline(pid))?,
            None => empty_standalone_snapshot(&mut tx, msg.stage_id).await?,
        };
        tx.commit().await?;

        if let Some(event) = pending_alert {
            send_stage_alert(&self.alert_sink, event).await;
        }

        Ok(snapshot)
    }

    /// Direct status override (spec §4.2 `updateStageStatus`): manual
    /// rerun/skip from the dashboard, plus the resolved `Pending → Running`
    /// worker-ack edge (see design notes).
    pub async fn update_stage_status(&self, msg: SetStageStatusMessage) -> Result<PipelineSnapshot, StoreError> {
        let target: StageStatus = msg.status.parse()?;

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, StageRow>(
            "SELECT id, pipeline_id, span_id, name, stage_handler_name, status, stage_order,
                    created_at, started_at, finished_at, input, output, is_skipped, is_event,
                    next_stage_id, options
             FROM stage WHERE id = $1 FOR UPDATE",
        )
        .bind(msg.stage_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::UnknownStage(msg.stage_id))?;

        let old_status: StageStatus = row.status.parse()?;
        let pipeline_id = row.pipeline_id;

        let changed = match target {
            StageStatus::NotStarted => {
                sqlx::query(
                    "UPDATE stage SET status = 'NotStarted', started_at = NULL,
                         finished_at = NULL, output = NULL WHERE id = $1",
                )
                .bind(msg.stage_id)
                .execute(&mut *tx)
                .await?;
                true
            }
            StageStatus::Skipped => {
                sqlx::query(
                    "UPDATE stage SET status = 'Skipped', is_skipped = true, finished_at = now()
                     WHERE id = $1",
                )
                .bind(msg.stage_id)
                .execute(&mut *tx)
                .await?;
                true
            }
            StageStatus::Running if old_status == StageStatus::Pending => {
                sqlx::query("UPDATE stage SET status = 'Running' WHERE id = $1")
                    .bind(msg.stage_id)
                    .execute(&mut *tx)
                    .await?;
                true
            }
            StageStatus::Running if old_status == StageStatus::Running => false,
            _ => false,
        };

        if let Some(pid) = pipeline_id {
            recompute_pipeline_status(&mut tx, pid).await?;
        }

        let pending_alert = if changed && old_status != target {
            match pipeline_id {
                Some(pid) => Some(
                    build_stage_alert_event(&mut tx, pid, msg.stage_id, old_status, target, "updateStageStatus")
                        .await?,
                ),
                None => None,
            }
        } else {
            None
        };

        let snapshot = match pipeline_id {
            Some(pid) => snapshot::hydrate(&mut tx, pid).await?.ok_or(StoreError::UnknownPipeline(pid))?,
            None => empty_standalone_snapshot(&mut tx, msg.stage_id).await?,
        };
        tx.commit().await?;

        if let Some(event) = pending_alert {
            send_stage_alert(&self.alert_sink, event).await;
        }

        Ok(snapshot)
    }

    /// Sweeps stages stuck in `Pending` past `timeout` (spec §4.5 C5).
    pub async fn mark_pending_too_long(&self, timeout: ChronoDuration) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let cutoff = Utc::now() - timeout;
        let rows: Vec<(i64, Option<i64>)> = sqlx::query_as(
            "SELECT id, pipeline_id FROM stage
             WHERE status = 'Pending' AND started_at < $1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut affected_pipelines: HashSet<i64> = HashSet::new();
        let mut pending_alerts = Vec::new();

        for (stage_id, pipeline_id) in &rows {
            sqlx::query("UPDATE stage SET status = 'Failed', finished_at = now() WHERE id = $1")
                .bind(stage_id)
                .execute(&mut *tx)
                .await?;

            insert_log_deduped(&mut tx, *stage_id, "error", "pending timeout", Utc::now()).await?;

            if let Some(pid) = pipeline_id {
                affected_pipelines.insert(*pid);
                pending_alerts.push(
                    build_stage_alert_event(&mut tx, *pid, *stage_id, StageStatus::Pending, StageStatus::Failed, "watchdog")
                        .await?,
                );
            }
        }

        for pid in affected_pipelines {
            recompute_pipeline_status(&mut tx, pid).await?;
        }

        let count = rows.len() as i64;
        tx.commit().await?;

        for event in pending_alerts {
            send_stage_alert(&self.alert_sink, event).await;
        }

        Ok(count)
    }

    pub async fn get_pipeline_with_stages(&self, id: i64) -> Result<Option<PipelineSnapshot>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        snapshot::hydrate(&mut conn, id).await
    }
}

fn validate_request(req: &CreatePipelineRequest) -> Result<(), StoreError> {
    let uses_depends_on = req.stages.iter().any(|s| !s.options.depends_on.is_empty());
    if !uses_depends_on {
        return Ok(());
    }

    let mut seen = HashSet::new();
    for s in &req.stages {
        if !seen.insert(s.name.as_str()) {
            return Err(StoreError::DuplicateStageName(s.name.clone()));
        }
    }
    for s in &req.stages {
        for dep in &s.options.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(StoreError::UnknownDependency(dep.clone()));
            }
        }
    }
    Ok(())
}

async fn insert_log_deduped(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    stage_id: i64,
    level: &str,
    message: &str,
    created_at: chrono::DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO stage_log (stage_id, level, message, created_at)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (stage_id, message, created_at) DO NOTHING",
    )
    .bind(stage_id)
    .bind(level)
    .bind(message)
    .bind(created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Marks every `NotStarted` stage reachable from `start` via `next_stage_id`
/// as `Skipped`, stopping at the first stage that is no longer
/// `NotStarted` (it already has its own outcome).
async fn cascade_skip_chain(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    start: Option<i64>,
) -> Result<(), StoreError> {
    let mut cursor = start;
    while let Some(stage_id) = cursor {
        let row: Option<(String, Option<i64>)> =
            sqlx::query_as("SELECT status, next_stage_id FROM stage WHERE id = $1 FOR UPDATE")
                .bind(stage_id)
                .fetch_optional(&mut **tx)
                .await?;
        let Some((status, next)) = row else { break };
        if status != "NotStarted" {
            break;
        }
        sqlx::query(
            "UPDATE stage SET status = 'Skipped', is_skipped = true, finished_at = now()
             WHERE id = $1",
        )
        .bind(stage_id)
        .execute(&mut **tx)
        .await?;
        cursor = next;
    }
    Ok(())
}

/// Recomputes `pipeline.status` from its stages' terminal state (spec §4.2,
/// invariant P2/I2): `Completed` once every stage is terminal with no
/// failures, `Failed` once every stage is terminal and at least one failed.
async fn recompute_pipeline_status(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    pipeline_id: i64,
) -> Result<(), StoreError> {
    let statuses: Vec<String> = sqlx::query_scalar("SELECT status FROM stage WHERE pipeline_id = $1")
        .bind(pipeline_id)
        .fetch_all(&mut **tx)
        .await?;

    if statuses.is_empty() {
        return Ok(());
    }

    let all_terminal = statuses.iter().all(|s| {
        matches!(s.as_str(), "Completed" | "Failed" | "Skipped")
    });

    if all_terminal {
        let any_failed = statuses.iter().any(|s| s == "Failed");
        let new_status = if any_failed { "Failed" } else { "Completed" };

        sqlx::query(
            "UPDATE pipeline SET status = $1, finished_at = now(), updated_at = now()
             WHERE id = $2 AND status NOT IN ('Completed', 'Failed')",
        )
        .bind(new_status)
        .bind(pipeline_id)
        .execute(&mut **tx)
        .await?;
    } else {
        // A manual rerun (updateStageStatus resetting a stage back to
        // NotStarted) can reopen a pipeline that already settled into
        // Completed/Failed; clear the stale terminal status so the
        // scheduler's terminal-pipeline exclusion stops shadowing it.
        sqlx::query(
            "UPDATE pipeline SET status = 'Running', finished_at = NULL, updated_at = now()
             WHERE id = $1 AND status IN ('Completed', 'Failed')",
        )
        .bind(pipeline_id)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

/// Gathers a stage alert's payload inside the transaction that caused it,
/// without calling the sink — the caller sends it only after `tx.commit()`
/// succeeds (spec §4.2: "an event is emitted only after the transition is
/// durably committed").
async fn build_stage_alert_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    pipeline_id: i64,
    stage_id: i64,
    old_status: StageStatus,
    new_status: StageStatus,
    source: &str,
) -> Result<StageAlertEvent, StoreError> {
    let names: Option<(String, String)> = sqlx::query_as(
        "SELECT p.name, s.name FROM pipeline p JOIN stage s ON s.pipeline_id = p.id
         WHERE p.id = $1 AND s.id = $2",
    )
    .bind(pipeline_id)
    .bind(stage_id)
    .fetch_optional(&mut **tx)
    .await?;

    let (pipeline_name, stage_name) = names.unwrap_or_default();
    Ok(StageAlertEvent {
        pipeline_id: Some(pipeline_id),
        stage_id,
        pipeline_name,
        stage_name,
        old_status: old_status.to_string(),
        new_status: new_status.to_string(),
        source: source.to_string(),
        ts: Utc::now(),
    })
}

/// Non-blocking per spec §4.2 — a sink failure never fails the mutation
/// that already committed.
async fn send_stage_alert(sink: &Arc<dyn AlertSink>, event: StageAlertEvent) {
    let stage_id = event.stage_id;
    if let Err(e) = sink.notify_stage_change(&event).await {
        tracing::warn!(error = %e, stage_id, "alert sink failed");
    }
}

async fn empty_standalone_snapshot(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    stage_id: i64,
) -> Result<PipelineSnapshot, StoreError> {
    let row = sqlx::query_as::<_, StageRow>(
        "SELECT id, pipeline_id, span_id, name, stage_handler_name, status, stage_order,
                created_at, started_at, finished_at, input, output, is_skipped, is_event,
                next_stage_id, options
         FROM stage WHERE id = $1",
    )
    .bind(stage_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(StoreError::UnknownStage(stage_id))?;

    let logs = sqlx::query_as::<_, crate::row::StageLogRow>(
        "SELECT id, stage_id, level, message, created_at FROM stage_log WHERE stage_id = $1
         ORDER BY created_at",
    )
    .bind(stage_id)
    .fetch_all(&mut **tx)
    .await?
    .into_iter()
    .map(stagework_core::StageLog::from)
    .collect();

    let now = Utc::now();
    let placeholder_pipeline = Pipeline {
        id: 0,
        name: String::new(),
        trace_id: String::new(),
        application_id: String::new(),
        status: PipelineStatus::NotStarted,
        created_at: now,
        finished_at: None,
        is_event: true,
        updated_at: now,
        context: Vec::new(),
        keywords: Vec::new(),
    };

    Ok(PipelineSnapshot {
        pipeline: placeholder_pipeline,
        stages: vec![row.into_stage()?],
        logs,
    })
}
