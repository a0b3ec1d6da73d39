//! Dedupe decorator for `AlertSink` (spec §7, §9): repeated identical
//! events within a TTL window are suppressed before reaching the wrapped
//! sink. Mirrors `notify::Dispatcher`'s per-key routing shape, but keyed by
//! a derived dedupe key rather than by rule id.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;

use stagework_core::{PolicyAlertEvent, StageAlertEvent, WorkerAlertEvent};

use crate::error::AlertError;
use crate::traits::AlertSink;

pub struct DedupingAlertSink<S> {
    inner: S,
    window: ChronoDuration,
    last_sent: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl<S: AlertSink> DedupingAlertSink<S> {
    pub fn new(inner: S, window: ChronoDuration) -> Self {
        Self {
            inner,
            window,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if `key` should be suppressed (an identical event was
    /// already sent within the window); otherwise records `key` as sent now.
    async fn should_suppress(&self, key: String, now: DateTime<Utc>) -> bool {
        let mut map = self.last_sent.lock().await;
        map.retain(|_, ts| now - *ts <= self.window);

        if let Some(last) = map.get(&key) {
            if now - *last <= self.window {
                return true;
            }
        }
        map.insert(key, now);
        false
    }
}

#[async_trait]
impl<S: AlertSink> AlertSink for DedupingAlertSink<S> {
    async fn notify_stage_change(&self, event: &StageAlertEvent) -> Result<(), AlertError> {
        let key = format!(
            "stage:{}:{}:{}",
            event.stage_id, event.old_status, event.new_status
        );
        if self.should_suppress(key, event.ts).await {
            return Ok(());
        }
        self.inner.notify_stage_change(event).await
    }

    async fn notify_worker_event(&self, event: &WorkerAlertEvent) -> Result<(), AlertError> {
        let key = format!("worker:{}:{}", event.worker_id, event.event_type);
        if self.should_suppress(key, event.ts).await {
            return Ok(());
        }
        self.inner.notify_worker_event(event).await
    }

    async fn notify_policy_event(&self, event: &PolicyAlertEvent) -> Result<(), AlertError> {
        let key = format!("policy:{}", event.key);
        if self.should_suppress(key, event.ts).await {
            return Ok(());
        }
        self.inner.notify_policy_event(event).await
    }
}

/// Short-TTL cache in front of an `AlertConfigReader` (spec §9: "keep a
/// short-TTL cache (~5s) to avoid a query per event").
pub struct CachedConfigReader<R> {
    inner: R,
    ttl: ChronoDuration,
    cache: Mutex<HashMap<String, (serde_json::Value, DateTime<Utc>)>>,
}

impl<R: crate::traits::AlertConfigReader> CachedConfigReader<R> {
    pub fn new(inner: R, ttl: ChronoDuration) -> Self {
        Self {
            inner,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<R: crate::traits::AlertConfigReader> crate::traits::AlertConfigReader for CachedConfigReader<R> {
    async fn get_routing_config(&self, key: &str) -> Result<Option<serde_json::Value>, AlertError> {
        let now = Utc::now();
        {
            let cache = self.cache.lock().await;
            if let Some((value, fetched_at)) = cache.get(key) {
                if now - *fetched_at <= self.ttl {
                    return Ok(Some(value.clone()));
                }
            }
        }

        let fetched = self.inner.get_routing_config(key).await?;
        if let Some(value) = &fetched {
            let mut cache = self.cache.lock().await;
            cache.insert(key.to_string(), (value.clone(), now));
        }
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        stage_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AlertSink for CountingSink {
        async fn notify_stage_change(&self, _event: &StageAlertEvent) -> Result<(), AlertError> {
            self.stage_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn notify_worker_event(&self, _event: &WorkerAlertEvent) -> Result<(), AlertError> {
            Ok(())
        }
        async fn notify_policy_event(&self, _event: &PolicyAlertEvent) -> Result<(), AlertError> {
            Ok(())
        }
    }

    fn stage_event(ts: DateTime<Utc>) -> StageAlertEvent {
        StageAlertEvent {
            pipeline_id: Some(1),
            stage_id: 1,
            pipeline_name: "p1".into(),
            stage_name: "a".into(),
            old_status: "Running".into(),
            new_status: "Completed".into(),
            source: "store".into(),
            ts,
        }
    }

    #[tokio::test]
    async fn suppresses_identical_event_within_window() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = DedupingAlertSink::new(
            CountingSink { stage_calls: calls.clone() },
            ChronoDuration::seconds(60),
        );

        let now = Utc::now();
        sink.notify_stage_change(&stage_event(now)).await.unwrap();
        sink.notify_stage_change(&stage_event(now + ChronoDuration::seconds(1)))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forwards_again_after_window_elapses() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = DedupingAlertSink::new(
            CountingSink { stage_calls: calls.clone() },
            ChronoDuration::seconds(5),
        );

        let now = Utc::now();
        sink.notify_stage_change(&stage_event(now)).await.unwrap();
        sink.notify_stage_change(&stage_event(now + ChronoDuration::seconds(10)))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
