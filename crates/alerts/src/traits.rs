//! Outbound interface from the Store to the alerting subsystem (C7).
//!
//! The Store only ever talks to `AlertSink`; a concrete sink that routes to
//! Slack/email/webhook/etc. is an external collaborator and out of scope
//! here. Kept narrow and separate from `AlertConfigReader` so the Store
//! never needs to know how (or whether) a sink looks up its own routing
//! config — avoids the cycle described in spec §9 (sink queries config
//! through its own interface, not through the Store).

use async_trait::async_trait;

use stagework_core::{PolicyAlertEvent, StageAlertEvent, WorkerAlertEvent};

use crate::error::AlertError;

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify_stage_change(&self, event: &StageAlertEvent) -> Result<(), AlertError>;
    async fn notify_worker_event(&self, event: &WorkerAlertEvent) -> Result<(), AlertError>;
    async fn notify_policy_event(&self, event: &PolicyAlertEvent) -> Result<(), AlertError>;
}

#[async_trait]
impl<S: AlertSink + ?Sized> AlertSink for std::sync::Arc<S> {
    async fn notify_stage_change(&self, event: &StageAlertEvent) -> Result<(), AlertError> {
        (**self).notify_stage_change(event).await
    }

    async fn notify_worker_event(&self, event: &WorkerAlertEvent) -> Result<(), AlertError> {
        (**self).notify_worker_event(event).await
    }

    async fn notify_policy_event(&self, event: &PolicyAlertEvent) -> Result<(), AlertError> {
        (**self).notify_policy_event(event).await
    }
}

/// Narrow lookup interface for an alert sink's own routing configuration
/// (e.g. which channels a given pipeline's alerts should go to). The Store
/// never implements or calls this — only a concrete sink does, which keeps
/// the sink-reads-config dependency from folding back into the Store.
#[async_trait]
pub trait AlertConfigReader: Send + Sync {
    async fn get_routing_config(&self, key: &str) -> Result<Option<serde_json::Value>, AlertError>;
}
