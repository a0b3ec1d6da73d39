//! Read-only hydration of a pipeline into its fully-joined snapshot
//! (spec §4.2 `getPipelineWithStages`, and the C6 fan-out payload).

use sqlx::PgConnection;

use stagework_core::{ContextItem, PipelineKeyword, PipelineSnapshot, StageLog};

use crate::error::StoreError;
use crate::row::{ContextRow, KeywordRow, PipelineRow, StageLogRow, StageRow};

pub async fn hydrate(
    conn: &mut PgConnection,
    pipeline_id: i64,
) -> Result<Option<PipelineSnapshot>, StoreError> {
    let Some(pipeline_row) = sqlx::query_as::<_, PipelineRow>(
        "SELECT id, name, trace_id, application_id, status, created_at, finished_at,
                is_event, updated_at
         FROM pipeline WHERE id = $1",
    )
    .bind(pipeline_id)
    .fetch_optional(&mut *conn)
    .await?
    else {
        return Ok(None);
    };

    let context: Vec<ContextItem> = sqlx::query_as::<_, ContextRow>(
        "SELECT key, value, value_type FROM pipeline_context WHERE pipeline_id = $1 ORDER BY key",
    )
    .bind(pipeline_id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(ContextItem::from)
    .collect();

    let keywords: Vec<PipelineKeyword> = sqlx::query_as::<_, KeywordRow>(
        "SELECT keyword FROM pipeline_keyword WHERE pipeline_id = $1 ORDER BY keyword",
    )
    .bind(pipeline_id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(PipelineKeyword::from)
    .collect();

    let stage_rows = sqlx::query_as::<_, StageRow>(
        "SELECT id, pipeline_id, span_id, name, stage_handler_name, status, stage_order,
                created_at, started_at, finished_at, input, output, is_skipped, is_event,
                next_stage_id, options
         FROM stage WHERE pipeline_id = $1 ORDER BY stage_order",
    )
    .bind(pipeline_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut stage_ids = Vec::with_capacity(stage_rows.len());
    let mut stages = Vec::with_capacity(stage_rows.len());
    for row in stage_rows {
        stage_ids.push(row.id);
        stages.push(row.into_stage()?);
    }

    let logs: Vec<StageLog> = if stage_ids.is_empty() {
        Vec::new()
    } else {
        sqlx::query_as::<_, StageLogRow>(
            "SELECT id, stage_id, level, message, created_at
             FROM stage_log WHERE stage_id = ANY($1) ORDER BY created_at",
        )
        .bind(&stage_ids)
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(StageLog::from)
        .collect()
    };

    let pipeline = pipeline_row.into_pipeline(context, keywords)?;
    Ok(Some(PipelineSnapshot { pipeline, stages, logs }))
}
