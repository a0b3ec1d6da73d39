use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use stagework_alerts::AlertSink;
use stagework_core::config::{BrokerConfig, RegistryConfig};
use stagework_core::{WorkerAlertEvent, WorkerRegistration, WorkerState};

use crate::error::RegistryError;
use crate::wire::{
    BootstrapRequest, BootstrapResponse, BrokerTopology, HeartbeatContract, HeartbeatRequest,
    WorkerEventRequest,
};

/// Worker bootstrap/heartbeat/event-ingest/shutdown service (spec §4.7,
/// C8). Orthogonal to the stage engine but shares the Postgres pool with
/// `stagework-store` and the alert sink with the Store.
pub struct Registry {
    pool: PgPool,
    alert_sink: Arc<dyn AlertSink>,
    cfg: RegistryConfig,
    rabbit_url_hint: String,
    broker_cfg: BrokerConfig,
}

impl Registry {
    pub fn new(
        pool: PgPool,
        alert_sink: Arc<dyn AlertSink>,
        cfg: RegistryConfig,
        broker_cfg: BrokerConfig,
        rabbit_url_hint: String,
    ) -> Self {
        Self { pool, alert_sink, cfg, rabbit_url_hint, broker_cfg }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn bootstrap(&self, req: BootstrapRequest) -> Result<BootstrapResponse, RegistryError> {
        let worker_id = Uuid::new_v4();
        let session_token = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO worker (id, application_id, worker_name, instance_id, session_token,
                                  state, supported_handlers, started_at, last_seen_at,
                                  capabilities)
             VALUES ($1, $2, $3, $4, $5, 'starting', $6, $7, $7, $8)",
        )
        .bind(worker_id)
        .bind(&req.application_id)
        .bind(&req.worker_name)
        .bind(&req.instance_id)
        .bind(&session_token)
        .bind(Json(&req.supported_handlers))
        .bind(now)
        .bind(&req.capabilities)
        .execute(&self.pool)
        .await?;

        emit_worker_event(
            &self.alert_sink,
            worker_id,
            &req.worker_name,
            "bootstrap",
            "info",
            "worker bootstrapped",
        )
        .await;

        Ok(BootstrapResponse {
            worker_id,
            session_token,
            broker: BrokerTopology {
                rabbit_url_hint: self.rabbit_url_hint.clone(),
                dlq_enabled: self.broker_cfg.dlq_enabled,
                dlq_message_ttl_s: self.broker_cfg.dlq_message_ttl_s,
                prefetch: self.broker_cfg.prefetch_worker,
            },
            heartbeat: HeartbeatContract {
                interval_sec: self.cfg.heartbeat_interval_s,
                offline_after_sec: self.cfg.offline_after_s,
            },
            observability_links: serde_json::json!({}),
        })
    }

    pub async fn heartbeat(
        &self,
        worker_id: Uuid,
        session_token: &str,
        req: HeartbeatRequest,
    ) -> Result<(), RegistryError> {
        let worker = self.load(worker_id).await?;
        self.check_session(&worker)?;
        if worker.session_token != session_token {
            return Err(RegistryError::SessionExpired(worker_id));
        }

        sqlx::query(
            "UPDATE worker SET state = $1, in_flight_jobs = $2, jobs_processed = $3,
                 jobs_failed = $4, resource_metrics = $5, last_seen_at = now()
             WHERE id = $6",
        )
        .bind(&req.state)
        .bind(req.in_flight_jobs)
        .bind(req.jobs_processed)
        .bind(req.jobs_failed)
        .bind(&req.resource_metrics)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        let state: WorkerState = req.state.parse()?;
        if matches!(state, WorkerState::Ready | WorkerState::Error | WorkerState::Offline | WorkerState::Stopped) {
            emit_worker_event(
                &self.alert_sink,
                worker_id,
                &worker.worker_name,
                "state_changed",
                if state == WorkerState::Error { "error" } else { "info" },
                &format!("worker state changed to {state}"),
            )
            .await;
        }

        Ok(())
    }

    /// Accepts a batch of worker-reported events (spec §4.7 events ingest).
    pub async fn ingest_events(
        &self,
        worker_id: Uuid,
        session_token: &str,
        events: Vec<WorkerEventRequest>,
    ) -> Result<(), RegistryError> {
        if events.len() as u32 > self.cfg.events_max_batch {
            return Err(RegistryError::BatchTooLarge {
                got: events.len(),
                max: self.cfg.events_max_batch,
            });
        }

        let worker = self.load(worker_id).await?;
        self.check_session(&worker)?;
        if worker.session_token != session_token {
            return Err(RegistryError::SessionExpired(worker_id));
        }

        let mut tx = self.pool.begin().await?;
        for event in &events {
            sqlx::query(
                "INSERT INTO worker_event (worker_id, level, event_type, message, details)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(worker_id)
            .bind(&event.level)
            .bind(&event.event_type)
            .bind(&event.message)
            .bind(&event.details)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        for event in events {
            let is_alertable = event.level.eq_ignore_ascii_case("error")
                || matches!(event.event_type.as_str(), "bootstrap" | "stopped" | "state_changed");
            if is_alertable {
                emit_worker_event(
                    &self.alert_sink,
                    worker_id,
                    &worker.worker_name,
                    &event.event_type,
                    &event.level,
                    &event.message,
                )
                .await;
            }
        }

        Ok(())
    }

    pub async fn shutdown(&self, worker_id: Uuid, session_token: &str) -> Result<(), RegistryError> {
        let worker = self.load(worker_id).await?;
        if worker.session_token != session_token {
            return Err(RegistryError::SessionExpired(worker_id));
        }

        sqlx::query("UPDATE worker SET state = 'stopped', stopped_at = now() WHERE id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;

        emit_worker_event(&self.alert_sink, worker_id, &worker.worker_name, "stopped", "info", "worker shut down")
            .await;
        Ok(())
    }

    /// Effective-state resolution at query time (spec §4.7, invariant W1):
    /// a worker silent past `offline_after` reads back as `Offline` even
    /// though nothing persisted that state. Each such read also raises a
    /// `worker_heartbeat_lost` alert; the wrapping `DedupingAlertSink`
    /// collapses repeat reads during the same outage into one delivery.
    pub async fn get_worker(&self, worker_id: Uuid) -> Result<WorkerRegistration, RegistryError> {
        let mut worker = self.load(worker_id).await?;
        let offline_after = ChronoDuration::seconds(self.cfg.offline_after_s as i64);
        let effective = worker.effective_state(Utc::now(), offline_after);

        if effective == WorkerState::Offline {
            emit_worker_event(
                &self.alert_sink,
                worker_id,
                &worker.worker_name,
                "worker_heartbeat_lost",
                "error",
                "worker heartbeat lost; marked offline",
            )
            .await;
        }

        worker.state = effective;
        Ok(worker)
    }

    async fn load(&self, worker_id: Uuid) -> Result<WorkerRegistration, RegistryError> {
        let row = sqlx::query_as::<_, crate::row::WorkerRow>(
            "SELECT id, application_id, worker_name, instance_id, session_token, state,
                    supported_handlers, started_at, last_seen_at, stopped_at, in_flight_jobs,
                    jobs_processed, jobs_failed, resource_metrics, capabilities, metadata
             FROM worker WHERE id = $1",
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RegistryError::UnknownWorker(worker_id))?;

        row.into_registration()
    }

    fn check_session(&self, worker: &WorkerRegistration) -> Result<(), RegistryError> {
        let ttl = ChronoDuration::hours(self.cfg.session_ttl_h as i64);
        if !worker.session_valid(Utc::now(), ttl) {
            return Err(RegistryError::SessionExpired(worker.id));
        }
        Ok(())
    }
}

async fn emit_worker_event(
    sink: &Arc<dyn AlertSink>,
    worker_id: Uuid,
    worker_name: &str,
    event_type: &str,
    level: &str,
    message: &str,
) {
    let event = WorkerAlertEvent {
        worker_id,
        worker_name: worker_name.to_string(),
        event_type: event_type.to_string(),
        level: level.to_string(),
        message: message.to_string(),
        ts: Utc::now(),
    };
    if let Err(e) = sink.notify_worker_event(&event).await {
        tracing::warn!(error = %e, %worker_id, "alert sink failed");
    }
}
