//! Raw `sqlx::FromRow` row shapes and their conversion into the domain
//! types from `stagework_core::model`. Kept separate from `store.rs` so the
//! SQL column shape doesn't leak into the rest of the crate.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::types::Json;

use stagework_core::{
    ContextItem, Pipeline, PipelineKeyword, PipelineStatus, Stage, StageLog, StageOptions,
    StageStatus,
};

use crate::error::StoreError;

#[derive(sqlx::FromRow)]
pub struct PipelineRow {
    pub id: i64,
    pub name: String,
    pub trace_id: String,
    pub application_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub is_event: bool,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRow {
    pub fn into_pipeline(
        self,
        context: Vec<ContextItem>,
        keywords: Vec<PipelineKeyword>,
    ) -> Result<Pipeline, StoreError> {
        Ok(Pipeline {
            id: self.id,
            name: self.name,
            trace_id: self.trace_id,
            application_id: self.application_id,
            status: PipelineStatus::from_str(&self.status)?,
            created_at: self.created_at,
            finished_at: self.finished_at,
            is_event: self.is_event,
            updated_at: self.updated_at,
            context,
            keywords,
        })
    }
}

#[derive(sqlx::FromRow)]
pub struct StageRow {
    pub id: i64,
    pub pipeline_id: Option<i64>,
    pub span_id: String,
    pub name: String,
    pub stage_handler_name: String,
    pub status: String,
    pub stage_order: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub input: Option<String>,
    pub output: Option<String>,
    pub is_skipped: bool,
    pub is_event: bool,
    pub next_stage_id: Option<i64>,
    pub options: Json<StageOptions>,
}

impl StageRow {
    pub fn into_stage(self) -> Result<Stage, StoreError> {
        Ok(Stage {
            id: self.id,
            pipeline_id: self.pipeline_id,
            span_id: self.span_id,
            name: self.name,
            stage_handler_name: self.stage_handler_name,
            status: StageStatus::from_str(&self.status)?,
            stage_order: self.stage_order,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            input: self.input,
            output: self.output,
            is_skipped: self.is_skipped,
            is_event: self.is_event,
            next_stage_id: self.next_stage_id,
            options: self.options.0,
        })
    }
}

#[derive(sqlx::FromRow)]
pub struct ContextRow {
    pub key: String,
    pub value: String,
    pub value_type: String,
}

impl From<ContextRow> for ContextItem {
    fn from(r: ContextRow) -> Self {
        ContextItem { key: r.key, value: r.value, value_type: r.value_type }
    }
}

#[derive(sqlx::FromRow)]
pub struct KeywordRow {
    pub keyword: String,
}

impl From<KeywordRow> for PipelineKeyword {
    fn from(r: KeywordRow) -> Self {
        PipelineKeyword { keyword: r.keyword }
    }
}

#[derive(sqlx::FromRow)]
pub struct StageLogRow {
    pub id: i64,
    pub stage_id: i64,
    pub level: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl From<StageLogRow> for StageLog {
    fn from(r: StageLogRow) -> Self {
        StageLog {
            id: r.id,
            stage_id: r.stage_id,
            level: r.level,
            message: r.message,
            created_at: r.created_at,
        }
    }
}
