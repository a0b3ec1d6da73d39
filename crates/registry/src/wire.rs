//! Registry-specific request/response shapes (spec §4.7). Kept local to
//! this crate rather than `stagework-core::wire` since they never cross
//! the broker — the registry is an ordinary request/response service that
//! happens to share C1/C2 with the stage engine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapRequest {
    pub application_id: String,
    pub worker_name: String,
    pub instance_id: String,
    #[serde(default)]
    pub supported_handlers: Vec<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerTopology {
    pub rabbit_url_hint: String,
    pub dlq_enabled: bool,
    pub dlq_message_ttl_s: u64,
    pub prefetch: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatContract {
    pub interval_sec: u64,
    pub offline_after_sec: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BootstrapResponse {
    pub worker_id: Uuid,
    pub session_token: String,
    pub broker: BrokerTopology,
    pub heartbeat: HeartbeatContract,
    /// Dashboard deep-link templates for this worker; observability
    /// integrations themselves are out of scope, so this is a static map.
    pub observability_links: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatRequest {
    pub state: String,
    #[serde(default)]
    pub in_flight_jobs: i32,
    #[serde(default)]
    pub jobs_processed: i64,
    #[serde(default)]
    pub jobs_failed: i64,
    #[serde(default)]
    pub resource_metrics: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerEventRequest {
    pub level: String,
    pub event_type: String,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
}
