//! Default `AlertSink`: logs structured events via `tracing`. Used when no
//! real dispatch sink is wired up (e.g. local dev, or composed underneath
//! `DedupingAlertSink` in tests).

use async_trait::async_trait;
use tracing::info;

use stagework_core::{PolicyAlertEvent, StageAlertEvent, WorkerAlertEvent};

use crate::error::AlertError;
use crate::traits::AlertSink;

#[derive(Debug, Default)]
pub struct LoggingAlertSink;

#[async_trait]
impl AlertSink for LoggingAlertSink {
    async fn notify_stage_change(&self, event: &StageAlertEvent) -> Result<(), AlertError> {
        info!(
            pipeline_id = ?event.pipeline_id,
            stage_id = event.stage_id,
            pipeline_name = %event.pipeline_name,
            stage_name = %event.stage_name,
            old_status = %event.old_status,
            new_status = %event.new_status,
            source = %event.source,
            "stage transition"
        );
        Ok(())
    }

    async fn notify_worker_event(&self, event: &WorkerAlertEvent) -> Result<(), AlertError> {
        info!(
            worker_id = %event.worker_id,
            worker_name = %event.worker_name,
            event_type = %event.event_type,
            level = %event.level,
            "worker event: {}", event.message
        );
        Ok(())
    }

    async fn notify_policy_event(&self, event: &PolicyAlertEvent) -> Result<(), AlertError> {
        info!(key = %event.key, "policy event: {}", event.message);
        Ok(())
    }
}
