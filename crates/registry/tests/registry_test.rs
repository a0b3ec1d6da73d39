//! Scenario tests for the worker registry (spec §8 E6). Requires a live
//! Postgres reachable via `DATABASE_URL`; `sqlx::test` provisions and
//! migrates a scratch database per test, reusing the table definitions
//! owned by `stagework-store`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;

use stagework_alerts::{AlertError, AlertSink, DedupingAlertSink, LoggingAlertSink};
use stagework_core::config::{BrokerConfig, RegistryConfig};
use stagework_core::{PolicyAlertEvent, StageAlertEvent, WorkerAlertEvent};
use stagework_registry::Registry;
use stagework_registry::wire::{BootstrapRequest, HeartbeatRequest, WorkerEventRequest};

fn registry(pool: PgPool) -> Registry {
    registry_with_sink(pool, Arc::new(LoggingAlertSink))
}

fn registry_with_sink(pool: PgPool, alert_sink: Arc<dyn AlertSink>) -> Registry {
    Registry::new(
        pool,
        alert_sink,
        RegistryConfig {
            heartbeat_interval_s: 15,
            offline_after_s: 45,
            session_ttl_h: 24,
            events_max_batch: 200,
        },
        BrokerConfig {
            prefetch_worker: 5,
            prefetch_api: 10,
            dlq_enabled: true,
            dlq_message_ttl_s: 30,
        },
        "amqp://rabbitmq:5672".into(),
    )
}

struct CountingSink {
    worker_events: Arc<AtomicUsize>,
    heartbeat_lost: Arc<AtomicUsize>,
}

#[async_trait]
impl AlertSink for CountingSink {
    async fn notify_stage_change(&self, _event: &StageAlertEvent) -> Result<(), AlertError> {
        Ok(())
    }

    async fn notify_worker_event(&self, event: &WorkerAlertEvent) -> Result<(), AlertError> {
        self.worker_events.fetch_add(1, Ordering::SeqCst);
        if event.event_type == "worker_heartbeat_lost" {
            self.heartbeat_lost.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn notify_policy_event(&self, _event: &PolicyAlertEvent) -> Result<(), AlertError> {
        Ok(())
    }
}

fn bootstrap_request() -> BootstrapRequest {
    BootstrapRequest {
        application_id: "app1".into(),
        worker_name: "worker-a".into(),
        instance_id: "pod-1".into(),
        supported_handlers: vec!["h1".into(), "h2".into()],
        capabilities: serde_json::json!({"cpu": 4}),
    }
}

#[sqlx::test(migrations = "../store/migrations")]
async fn bootstrap_registers_worker_and_returns_topology(pool: PgPool) {
    let registry = registry(pool);
    let resp = registry.bootstrap(bootstrap_request()).await.unwrap();

    assert_eq!(resp.broker.prefetch, 5);
    assert_eq!(resp.heartbeat.interval_sec, 15);

    let worker = registry.get_worker(resp.worker_id).await.unwrap();
    assert_eq!(worker.worker_name, "worker-a");
    assert_eq!(worker.supported_handlers, vec!["h1", "h2"]);
}

#[sqlx::test(migrations = "../store/migrations")]
async fn heartbeat_updates_state_and_rejects_wrong_session(pool: PgPool) {
    let registry = registry(pool);
    let resp = registry.bootstrap(bootstrap_request()).await.unwrap();

    registry
        .heartbeat(
            resp.worker_id,
            &resp.session_token,
            HeartbeatRequest {
                state: "ready".into(),
                in_flight_jobs: 2,
                jobs_processed: 10,
                jobs_failed: 0,
                resource_metrics: serde_json::json!({"cpu_pct": 12.5}),
            },
        )
        .await
        .unwrap();

    let worker = registry.get_worker(resp.worker_id).await.unwrap();
    assert_eq!(worker.state.to_string(), "ready");
    assert_eq!(worker.in_flight_jobs, 2);

    let err = registry
        .heartbeat(
            resp.worker_id,
            "wrong-token",
            HeartbeatRequest {
                state: "ready".into(),
                in_flight_jobs: 0,
                jobs_processed: 0,
                jobs_failed: 0,
                resource_metrics: serde_json::json!({}),
            },
        )
        .await;
    assert!(err.is_err());
}

#[sqlx::test(migrations = "../store/migrations")]
async fn effective_state_reports_offline_after_silence(pool: PgPool) {
    let registry = registry(pool);
    let resp = registry.bootstrap(bootstrap_request()).await.unwrap();

    let worker = registry.get_worker(resp.worker_id).await.unwrap();
    let now = Utc::now();
    assert_eq!(
        worker.effective_state(now, ChronoDuration::seconds(45)),
        stagework_core::WorkerState::Starting
    );
    let long_silence = now + ChronoDuration::seconds(90);
    assert_eq!(
        worker.effective_state(long_silence, ChronoDuration::seconds(45)),
        stagework_core::WorkerState::Offline
    );
}

#[sqlx::test(migrations = "../store/migrations")]
async fn offline_worker_raises_heartbeat_lost_exactly_once(pool: PgPool) {
    let heartbeat_lost = Arc::new(AtomicUsize::new(0));
    let sink = Arc::new(DedupingAlertSink::new(
        CountingSink { worker_events: Arc::new(AtomicUsize::new(0)), heartbeat_lost: heartbeat_lost.clone() },
        ChronoDuration::seconds(60),
    ));

    let registry = registry_with_sink(
        pool,
        sink as Arc<dyn AlertSink>,
    );
    let resp = registry.bootstrap(bootstrap_request()).await.unwrap();

    sqlx::query("UPDATE worker SET last_seen_at = now() - interval '90 seconds' WHERE id = $1")
        .bind(resp.worker_id)
        .execute(registry.pool())
        .await
        .unwrap();

    let first = registry.get_worker(resp.worker_id).await.unwrap();
    assert_eq!(first.state.to_string(), "offline");
    let second = registry.get_worker(resp.worker_id).await.unwrap();
    assert_eq!(second.state.to_string(), "offline");

    assert_eq!(heartbeat_lost.load(Ordering::SeqCst), 1, "dedupe sink collapses repeat reads into one alert");
}

#[sqlx::test(migrations = "../store/migrations")]
async fn ingest_events_rejects_oversized_batch(pool: PgPool) {
    let registry = registry(pool);
    let resp = registry.bootstrap(bootstrap_request()).await.unwrap();

    let events: Vec<_> = (0..201)
        .map(|i| WorkerEventRequest {
            level: "info".into(),
            event_type: "progress".into(),
            message: format!("tick {i}"),
            details: serde_json::json!({}),
        })
        .collect();

    let err = registry.ingest_events(resp.worker_id, &resp.session_token, events).await;
    assert!(err.is_err());
}

#[sqlx::test(migrations = "../store/migrations")]
async fn shutdown_marks_worker_stopped(pool: PgPool) {
    let registry = registry(pool);
    let resp = registry.bootstrap(bootstrap_request()).await.unwrap();

    registry.shutdown(resp.worker_id, &resp.session_token).await.unwrap();

    let worker = registry.get_worker(resp.worker_id).await.unwrap();
    assert_eq!(worker.state.to_string(), "stopped");
    assert!(worker.stopped_at.is_some());
}
