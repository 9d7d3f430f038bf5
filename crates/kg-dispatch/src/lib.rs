//! Webhook / Event Dispatcher (C9): fans `node_access`/`node_mutation`
//! events out to internal handlers and external URLs.
//!
//! Each internal handler's error is swallowed with `warn!` so one backend's
//! failure never blocks another; the external webhook gets its own
//! POST-with-timeout-and-status-check path. Both dispatch legs run via
//! `futures::future::join_all` over handler futures that each return a
//! `Result` and are never `?`-propagated.

use async_trait::async_trait;
use kg_common::{NodeAccessEvent, NodeMutationEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone)]
pub enum DispatchEvent {
    NodeAccess(NodeAccessEvent),
    NodeMutation(NodeMutationEvent),
}

impl DispatchEvent {
    fn event_type(&self) -> &'static str {
        match self {
            DispatchEvent::NodeAccess(_) => "node_access",
            DispatchEvent::NodeMutation(_) => "node_mutation",
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            DispatchEvent::NodeAccess(e) => serde_json::to_value(e).unwrap_or_default(),
            DispatchEvent::NodeMutation(e) => serde_json::to_value(e).unwrap_or_default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("internal handler failed: {0}")]
pub struct HandlerError(pub String);

/// An internal fan-out target (e.g. C10's WebSocket broadcaster). Handlers
/// run in a bounded pool and their errors are logged, never propagated.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DispatchEvent) -> Result<(), HandlerError>;
}

#[derive(Debug, Default)]
pub struct DispatchMetrics {
    pub events_emitted: AtomicU64,
    pub handler_failures: AtomicU64,
    pub external_webhook_failures: AtomicU64,
}

pub struct DispatcherConfig {
    pub external_webhook_url: Option<String>,
    pub webhook_timeout: Duration,
    pub max_retry_backoff: Duration,
    pub handler_concurrency: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            external_webhook_url: None,
            webhook_timeout: Duration::from_secs(5),
            max_retry_backoff: Duration::from_secs(30),
            handler_concurrency: 8,
        }
    }
}

/// Fans events out to a live-reloadable registry of internal handlers and,
/// at most, one external webhook URL.
pub struct Dispatcher {
    handlers: Mutex<Vec<Arc<dyn EventHandler>>>,
    http: reqwest::Client,
    config: DispatcherConfig,
    metrics: Arc<DispatchMetrics>,
    handler_semaphore: Arc<tokio::sync::Semaphore>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let handler_semaphore = Arc::new(tokio::sync::Semaphore::new(config.handler_concurrency));
        Self {
            handlers: Mutex::new(Vec::new()),
            http: reqwest::Client::new(),
            config,
            metrics: Arc::new(DispatchMetrics::default()),
            handler_semaphore,
        }
    }

    pub fn metrics(&self) -> Arc<DispatchMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Registration is live-reloadable: callers may add handlers at any
    /// point during the process lifetime, not only at construction.
    pub async fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.lock().await;
        handlers.push(handler);
    }

    pub async fn emit(&self, event: DispatchEvent) {
        self.metrics.events_emitted.fetch_add(1, Ordering::Relaxed);

        let handlers = {
            let guard = self.handlers.lock().await;
            guard.clone()
        };

        let handler_futures = handlers.into_iter().map(|handler| {
            let event = event.clone();
            let semaphore = Arc::clone(&self.handler_semaphore);
            let metrics = Arc::clone(&self.metrics);
            async move {
                let _permit = semaphore.acquire().await;
                if let Err(e) = handler.handle(&event).await {
                    metrics.handler_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(event_type = event.event_type(), error = %e, "internal handler failed");
                }
            }
        });

        let external = self.send_external(&event);

        tokio::join!(futures::future::join_all(handler_futures), external);
    }

    /// At most one attempt per call; on failure the caller (the retry loop
    /// driven by `send_external_with_retry`) decides whether to back off and
    /// try again, up to `max_retry_backoff`.
    async fn send_external(&self, event: &DispatchEvent) {
        let Some(url) = &self.config.external_webhook_url else { return };

        let payload = event.to_json();
        let mut backoff = Duration::from_millis(200);
        loop {
            let result = self
                .http
                .post(url)
                .timeout(self.config.webhook_timeout)
                .json(&payload)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => {
                    warn!(status = %resp.status(), "external webhook returned non-success");
                }
                Err(e) => {
                    warn!(error = %e, "external webhook request failed");
                }
            }

            if backoff >= self.config.max_retry_backoff {
                self.metrics.external_webhook_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.max_retry_backoff);
        }
    }
}

/// Lets the Ingestion Worker (C7) emit into this dispatcher without
/// depending on `kg-dispatch`'s own event-family enum.
#[async_trait]
impl kg_common::EventSink for Dispatcher {
    async fn emit_node_access(&self, event: kg_common::NodeAccessEvent) {
        self.emit(DispatchEvent::NodeAccess(event)).await;
    }

    async fn emit_node_mutation(&self, event: kg_common::NodeMutationEvent) {
        self.emit(DispatchEvent::NodeMutation(event)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &DispatchEvent) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                return Err(HandlerError("boom".to_string()));
            }
            Ok(())
        }
    }

    fn sample_mutation() -> DispatchEvent {
        DispatchEvent::NodeMutation(NodeMutationEvent {
            event_type: "node_mutation".to_string(),
            group_id: "g1".to_string(),
            created_node_uuids: vec![],
            updated_node_uuids: vec![],
            created_edge_uuids: vec![],
            timestamp: chrono::Utc::now(),
        })
    }

    #[tokio::test]
    async fn emit_invokes_every_registered_handler() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        dispatcher
            .register_handler(Arc::new(CountingHandler { calls: Arc::clone(&calls), fail: false }))
            .await;
        dispatcher
            .register_handler(Arc::new(CountingHandler { calls: Arc::clone(&calls), fail: false }))
            .await;

        dispatcher.emit(sample_mutation()).await;

        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(dispatcher.metrics().events_emitted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn a_failing_handler_does_not_block_others() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        dispatcher
            .register_handler(Arc::new(CountingHandler { calls: Arc::clone(&calls), fail: true }))
            .await;
        dispatcher
            .register_handler(Arc::new(CountingHandler { calls: Arc::clone(&calls), fail: false }))
            .await;

        dispatcher.emit(sample_mutation()).await;

        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(dispatcher.metrics().handler_failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn emit_with_no_external_url_does_not_touch_external_metrics() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        dispatcher.emit(sample_mutation()).await;
        assert_eq!(dispatcher.metrics().external_webhook_failures.load(Ordering::Relaxed), 0);
    }
}
