use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use stagework_core::{WorkerRegistration, WorkerState};

use crate::error::RegistryError;

#[derive(sqlx::FromRow)]
pub struct WorkerRow {
    pub id: Uuid,
    pub application_id: String,
    pub worker_name: String,
    pub instance_id: String,
    pub session_token: String,
    pub state: String,
    pub supported_handlers: Json<Vec<String>>,
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

impl WorkerRow {
    pub fn into_registration(self) -> Result<WorkerRegistration, RegistryError> {
        Ok(WorkerRegistration {
            id: self.id,
            application_id: self.application_id,
            worker_name: self.worker_name,
            instance_id: self.instance_id,
            session_token: self.session_token,
            state: WorkerState::from_str(&self.state)?,
            supported_handlers: self.supported_handlers.0,
            started_at: self.started_at,
            last_seen_at: self.last_seen_at,
            stopped_at: self.stopped_at,
            in_flight_jobs: self.in_flight_jobs,
            jobs_processed: self.jobs_processed,
            jobs_failed: self.jobs_failed,
            resource_metrics: self.resource_metrics,
            capabilities: self.capabilities,
            metadata: self.metadata,
        })
    }
}
