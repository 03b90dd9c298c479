//! Batched delivery of session telemetry records
//!
//! Sessions produce small export records (items appended, a compaction
//! run, a cleared log). Delivery must never slow down the turn loop, so
//! records pass through a bounded queue into a background worker that
//! batches them, retries transient sink failures with backoff, and drops
//! the batch once retries are exhausted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sigma_wire::TokenUsage;

use crate::error::Result;

/// One telemetry record bound for a sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRecord {
    pub id: Uuid,
    /// What happened, e.g. `items_added` or `compaction_run`
    pub kind: String,
    pub payload: Value,
    pub recorded_at: DateTime<Utc>,
}

impl ExportRecord {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            recorded_at: Utc::now(),
        }
    }

    /// Record that a batch of items was appended to a session
    pub fn items_added(session_id: &str, count: usize) -> Self {
        Self::new(
            "items_added",
            json!({ "session_id": session_id, "count": count }),
        )
    }

    /// Record one compaction run and the token usage it reported
    pub fn compaction_run(session_id: &str, usage: &TokenUsage) -> Self {
        Self::new(
            "compaction_run",
            json!({
                "session_id": session_id,
                "input_tokens": usage.input_tokens,
                "output_tokens": usage.output_tokens,
                "total_tokens": usage.total_tokens,
            }),
        )
    }

    /// Record that a session log was destroyed
    pub fn log_cleared(session_id: &str) -> Self {
        Self::new("log_cleared", json!({ "session_id": session_id }))
    }
}

/// Delivery target for export records
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn export(&self, batch: &[ExportRecord]) -> Result<()>;
}

/// Retry and backoff settings for sink delivery
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on the backed-off delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Configuration for the batch exporter
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Records per batch before a flush is forced
    pub batch_size: usize,
    /// How often a partial batch is flushed anyway
    pub flush_interval: Duration,
    /// Bound on records queued for the worker
    pub queue_capacity: usize,
    /// Backoff applied when the sink rejects a batch
    pub retry: RetryConfig,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            flush_interval: Duration::from_secs(5),
            queue_capacity: 1024,
            retry: RetryConfig::default(),
        }
    }
}

impl ExporterConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Handle to a spawned exporter worker.
///
/// Recording is non-blocking; a full queue drops the record rather than
/// stalling the caller. [`shutdown`](Self::shutdown) flushes whatever is
/// still queued before the worker exits.
pub struct BatchExporter {
    sender: mpsc::Sender<ExportRecord>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

impl BatchExporter {
    /// Spawn the background worker and return the recording handle
    pub fn spawn(sink: Arc<dyn TelemetrySink>, config: ExporterConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(receiver, sink, config, cancel.clone()));
        Self {
            sender,
            cancel,
            worker,
        }
    }

    /// Queue one record without blocking
    pub fn record(&self, record: ExportRecord) {
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                tracing::warn!("Telemetry queue full, dropping record: {}", record.kind);
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                tracing::warn!("Telemetry worker gone, dropping record: {}", record.kind);
            }
        }
    }

    /// Stop the worker after it flushes everything still queued
    pub async fn shutdown(self) {
        self.cancel.cancel();
        drop(self.sender);
        let _ = self.worker.await;
    }
}

async fn run_worker(
    mut receiver: mpsc::Receiver<ExportRecord>,
    sink: Arc<dyn TelemetrySink>,
    config: ExporterConfig,
    cancel: CancellationToken,
) {
    let mut batch: Vec<ExportRecord> = Vec::with_capacity(config.batch_size);
    let mut tick = tokio::time::interval(config.flush_interval);

    loop {
        tokio::select! {
            maybe = receiver.recv() => {
                match maybe {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= config.batch_size {
                            deliver(sink.as_ref(), &mut batch, &config.retry).await;
                        }
                    }
                    // All senders gone; fall through to the final flush.
                    None => break,
                }
            }
            _ = tick.tick() => {
                deliver(sink.as_ref(), &mut batch, &config.retry).await;
            }
            _ = cancel.cancelled() => break,
        }
    }

    // Drain whatever made it into the queue before shutdown.
    while let Ok(record) = receiver.try_recv() {
        batch.push(record);
        if batch.len() >= config.batch_size {
            deliver(sink.as_ref(), &mut batch, &config.retry).await;
        }
    }
    deliver(sink.as_ref(), &mut batch, &config.retry).await;
}

/// Deliver one batch, retrying transient failures. The batch is cleared
/// whether delivery succeeded or was given up on; telemetry loss must
/// never propagate as an error.
async fn deliver(sink: &dyn TelemetrySink, batch: &mut Vec<ExportRecord>, retry: &RetryConfig) {
    if batch.is_empty() {
        return;
    }

    let mut attempt = 0u32;
    loop {
        match sink.export(batch).await {
            Ok(()) => {
                tracing::debug!("Exported {} telemetry records", batch.len());
                batch.clear();
                return;
            }
            Err(e) => {
                if attempt < retry.max_retries && e.is_retryable() {
                    let delay = retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        "Telemetry export failed (attempt {}/{}): {}. Retrying in {:?}...",
                        attempt + 1,
                        retry.max_retries + 1,
                        e,
                        delay
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                    continue;
                }
                tracing::warn!("Dropping {} telemetry records: {}", batch.len(), e);
                batch.clear();
                return;
            }
        }
    }
}
