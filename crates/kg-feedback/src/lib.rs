//! Relevance Feedback Collector (C11).
//!
//! Reads the pending per-node scores accumulated since the last flush,
//! folds them into each node's importance via an exponentially-weighted
//! moving average, and writes the result back through the graph adapter.

use chrono::{DateTime, Utc};
use kg_common::RelevanceFeedback;
use kg_graph::GraphStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// `new = alpha * score + (1 - alpha) * old`. `old` defaults to `score`
/// itself when the node has no prior importance recorded, so the first
/// observation sets the baseline rather than pulling it toward zero.
pub fn ewma(old: Option<f64>, score: f64, alpha: f64) -> f64 {
    let old = old.unwrap_or(score);
    alpha * score + (1.0 - alpha) * old
}

#[derive(Debug, Clone)]
pub struct FeedbackConfig {
    pub alpha: f64,
    pub commit_window: Duration,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self { alpha: 0.2, commit_window: Duration::from_secs(1) }
    }
}

#[derive(Debug, Clone)]
struct QueuedFeedback {
    query_id: Uuid,
    scores: Vec<f64>,
    received_at: DateTime<Utc>,
}

/// Accumulates submitted feedback in memory and flushes updates to the
/// graph store once per commit window, rather than issuing a write per
/// `submit` call.
pub struct FeedbackCollector {
    store: Arc<GraphStore>,
    config: FeedbackConfig,
    pending: Mutex<HashMap<Uuid, QueuedFeedback>>,
}

impl FeedbackCollector {
    pub fn new(store: Arc<GraphStore>, config: FeedbackConfig) -> Self {
        Self { store, config, pending: Mutex::new(HashMap::new()) }
    }

    pub async fn submit(&self, feedback: RelevanceFeedback) {
        let mut pending = self.pending.lock().await;
        for (uuid, score) in feedback.memory_scores {
            let entry = pending.entry(uuid).or_insert_with(|| QueuedFeedback {
                query_id: feedback.query_id,
                scores: Vec::new(),
                received_at: Utc::now(),
            });
            entry.scores.push(score.clamp(0.0, 1.0));
        }
    }

    /// Runs forever, flushing on `config.commit_window`. Intended to run
    /// inside its own `tokio::task`.
    pub async fn run(self: Arc<Self>) -> ! {
        loop {
            tokio::time::sleep(self.config.commit_window).await;
            self.flush().await;
        }
    }

    /// Drains the pending buffer and applies one EWMA fold per node,
    /// reading the prior importance once and writing the final value once.
    pub async fn flush(&self) -> usize {
        let batch: HashMap<Uuid, QueuedFeedback> = {
            let mut pending = self.pending.lock().await;
            std::mem::take(&mut *pending)
        };

        let mut applied = 0;
        for (uuid, queued) in batch {
            let old = match self.store.get_importance(uuid).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(node = %uuid, error = %e, "failed to read prior importance, skipping");
                    continue;
                }
            };

            let new_importance = queued
                .scores
                .iter()
                .fold(old, |acc, &score| Some(ewma(acc, score, self.config.alpha)));

            let Some(new_importance) = new_importance else { continue };

            if let Err(e) = self.store.apply_importance_update(uuid, new_importance).await {
                warn!(node = %uuid, error = %e, "failed to write importance update");
                continue;
            }

            applied += 1;
            info!(
                node = %uuid,
                query_id = %queued.query_id,
                new_importance,
                samples = queued.scores.len(),
                "applied relevance feedback"
            );
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_seeds_from_first_observation_when_no_prior() {
        assert_eq!(ewma(None, 0.8, 0.2), 0.8);
    }

    #[test]
    fn ewma_blends_old_and_new() {
        let updated = ewma(Some(0.5), 1.0, 0.2);
        assert!((updated - 0.6).abs() < 1e-9);
    }

    #[test]
    fn ewma_folds_sequentially_across_multiple_samples() {
        let samples = [0.9, 0.9, 0.9];
        let result = samples.iter().fold(Some(0.1), |acc, &s| Some(ewma(acc, s, 0.2)));
        assert!(result.unwrap() > 0.1);
        assert!(result.unwrap() < 0.9);
    }
}
