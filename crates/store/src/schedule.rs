//! `getStageToExecute` (spec §4.2): the scheduling primitive. Runs inside
//! its own transaction with `SELECT ... FOR UPDATE SKIP LOCKED` so multiple
//! scheduler replicas can poll concurrently without racing on the same
//! stage (spec §4.3).

use chrono::Utc;
use sqlx::{PgConnection, Postgres, Transaction};

use stagework_core::{Stage, StageStatus};

use crate::error::StoreError;
use crate::row::StageRow;

/// Candidate stages, ordered so that within a pipeline the earliest-created
/// stage is always considered first (tie-break per spec §4.2 step 2).
async fn load_candidates(tx: &mut PgConnection) -> Result<Vec<StageRow>, StoreError> {
    let rows = sqlx::query_as::<_, StageRow>(
        "SELECT s.id, s.pipeline_id, s.span_id, s.name, s.stage_handler_name, s.status,
                s.stage_order, s.created_at, s.started_at, s.finished_at, s.input, s.output,
                s.is_skipped, s.is_event, s.next_stage_id, s.options
         FROM stage s
         LEFT JOIN pipeline p ON p.id = s.pipeline_id
         WHERE s.status = 'NotStarted'
           AND (s.pipeline_id IS NULL OR p.status NOT IN ('Completed', 'Failed'))
         ORDER BY s.pipeline_id NULLS FIRST, s.stage_order
         FOR UPDATE OF s SKIP LOCKED",
    )
    .fetch_all(&mut *tx)
    .await?;
    Ok(rows)
}

async fn predecessor_status(
    tx: &mut PgConnection,
    pipeline_id: i64,
    stage_id: i64,
) -> Result<Option<StageStatus>, StoreError> {
    let status: Option<String> = sqlx::query_scalar(
        "SELECT status FROM stage WHERE pipeline_id = $1 AND next_stage_id = $2",
    )
    .bind(pipeline_id)
    .bind(stage_id)
    .fetch_optional(&mut *tx)
    .await?;

    Ok(match status {
        Some(s) => Some(s.parse()?),
        None => None,
    })
}

/// `true` iff every stage named in `depends_on` (by name, within the same
/// pipeline) is `Completed` or `Skipped`.
async fn depends_on_satisfied(
    tx: &mut PgConnection,
    pipeline_id: i64,
    depends_on: &[String],
) -> Result<bool, StoreError> {
    if depends_on.is_empty() {
        return Ok(true);
    }
    let statuses: Vec<String> = sqlx::query_scalar(
        "SELECT status FROM stage WHERE pipeline_id = $1 AND name = ANY($2)",
    )
    .bind(pipeline_id)
    .bind(depends_on)
    .fetch_all(&mut *tx)
    .await?;

    if statuses.len() != depends_on.len() {
        // A referenced stage is missing; createPipeline should have
        // rejected this up front, so treat as not-yet-satisfied rather
        // than panicking the scheduler loop.
        return Ok(false);
    }

    for s in statuses {
        let parsed: StageStatus = s.parse()?;
        if !matches!(parsed, StageStatus::Completed | StageStatus::Skipped) {
            return Ok(false);
        }
    }
    Ok(true)
}

async fn pipeline_status(tx: &mut PgConnection, pipeline_id: i64) -> Result<String, StoreError> {
    let status: String = sqlx::query_scalar("SELECT status FROM pipeline WHERE id = $1")
        .bind(pipeline_id)
        .fetch_one(&mut *tx)
        .await?;
    Ok(status)
}

async fn mark_skipped(tx: &mut PgConnection, stage_id: i64) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE stage SET status = 'Skipped', is_skipped = true, finished_at = now()
         WHERE id = $1",
    )
    .bind(stage_id)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

enum Eligibility {
    Ready,
    SkipAndContinue,
    NotYet,
}

async fn classify(tx: &mut PgConnection, candidate: &StageRow) -> Result<Eligibility, StoreError> {
    let Some(pipeline_id) = candidate.pipeline_id else {
        // Standalone event stage: no pipeline-level gating.
        return Ok(Eligibility::Ready);
    };

    if !candidate.options.0.depends_on.is_empty() {
        return Ok(if depends_on_satisfied(tx, pipeline_id, &candidate.options.0.depends_on).await? {
            Eligibility::Ready
        } else {
            Eligibility::NotYet
        });
    }

    match predecessor_status(tx, pipeline_id, candidate.id).await? {
        Some(StageStatus::Completed) | Some(StageStatus::Skipped) => Ok(Eligibility::Ready),
        Some(StageStatus::Failed) => {
            if candidate.options.0.run_next_if_failed {
                Ok(Eligibility::Ready)
            } else {
                Ok(Eligibility::SkipAndContinue)
            }
        }
        Some(_) => Ok(Eligibility::NotYet),
        None => {
            // First stage in the chain: eligible while the pipeline hasn't
            // settled into a terminal state.
            let status = pipeline_status(tx, pipeline_id).await?;
            Ok(if status == "NotStarted" || status == "Running" {
                Eligibility::Ready
            } else {
                Eligibility::NotYet
            })
        }
    }
}

/// Selects and claims the next eligible stage, or returns `None` if nothing
/// is runnable right now. Skips (and persists) any stage whose predecessor
/// failed without `runNextIfFailed`, continuing the scan in the same pass
/// rather than requiring a fresh poll (spec §4.2 step 4's "recurse").
pub async fn get_stage_to_execute(tx: &mut Transaction<'_, Postgres>) -> Result<Option<Stage>, StoreError> {
    let candidates = load_candidates(tx).await?;

    for candidate in candidates {
        match classify(tx, &candidate).await? {
            Eligibility::Ready => {
                sqlx::query(
                    "UPDATE stage SET status = 'Pending', started_at = now() WHERE id = $1",
                )
                .bind(candidate.id)
                .execute(&mut **tx)
                .await?;

                if let Some(pipeline_id) = candidate.pipeline_id {
                    sqlx::query(
                        "UPDATE pipeline SET status = 'Running', updated_at = now()
                         WHERE id = $1 AND status = 'NotStarted'",
                    )
                    .bind(pipeline_id)
                    .execute(&mut **tx)
                    .await?;
                }

                let mut stage = candidate.into_stage()?;
                stage.status = StageStatus::Pending;
                stage.started_at = Some(Utc::now());
                return Ok(Some(stage));
            }
            Eligibility::SkipAndContinue => {
                mark_skipped(tx, candidate.id).await?;
                continue;
            }
            Eligibility::NotYet => continue,
        }
    }

    Ok(None)
}
