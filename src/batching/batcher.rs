//! # Request Batcher
//!
//! Accumulates requests in per-model, per-priority FIFO lanes and flushes
//! them into the [`BatchProcessor`]. A flush is considered after every
//! submission, on every background tick and when a model's timer expires.
//!
//! ## Timers
//!
//! A model's timer is armed when its queue turns non-empty and is cancelled
//! whenever a batch fires; it is re-armed if requests remain. A generation
//! counter discards timers that expire concurrently with a flush.
//!
//! ## Timeouts
//!
//! Each submission waits for its result with its own timeout. A caller that
//! gives up leaves an orphaned entry behind; orphans are skipped when a batch
//! is assembled and results for orphans that already left the queue are
//! discarded.

use super::processor::BatchProcessor;
use super::strategy::{recent_throughput, should_fire, FireReason, QueueSnapshot};
use super::types::{BatchItem, BatchRequest, BatchingConfig, ModelConfig};
use crate::core::error::{OptimizerError, OptimizerResult};
use crate::core::types::RequestPriority;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Per-model batcher statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelBatchStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub orphaned: u64,
    pub batches: u64,
    pub pending: usize,
    pub average_batch_size: f64,
    /// Items per second over the recent batches
    pub recent_throughput: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatcherStats {
    pub strategy: String,
    pub models: BTreeMap<String, ModelBatchStats>,
}

struct QueuedRequest {
    request: BatchRequest,
    responder: oneshot::Sender<OptimizerResult<Value>>,
}

struct ModelQueue {
    config: ModelConfig,
    lanes: [VecDeque<QueuedRequest>; RequestPriority::COUNT],
    timer: Option<JoinHandle<()>>,
    generation: u64,
    recent: VecDeque<(usize, Duration)>,
    stats: ModelBatchStats,
    dispatched_items: u64,
}

impl ModelQueue {
    fn new(config: ModelConfig) -> Self {
        Self {
            config,
            lanes: Default::default(),
            timer: None,
            generation: 0,
            recent: VecDeque::new(),
            stats: ModelBatchStats::default(),
            dispatched_items: 0,
        }
    }

    fn pending(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    fn snapshot(&self, timer_expired: bool) -> QueueSnapshot {
        QueueSnapshot {
            pending: self.pending(),
            critical_pending: self.lanes[RequestPriority::Critical.index()].len(),
            timer_expired,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;
    }

    /// Take up to `max_batch_size` live requests, highest priority first
    fn drain_batch(&mut self) -> Vec<QueuedRequest> {
        let limit = self.config.max_batch_size.max(1);
        let mut batch = Vec::with_capacity(limit.min(self.pending()));

        for priority in RequestPriority::DRAIN_ORDER {
            let lane = &mut self.lanes[priority.index()];
            while batch.len() < limit {
                let Some(queued) = lane.pop_front() else {
                    break;
                };
                if queued.responder.is_closed() {
                    self.stats.orphaned += 1;
                    debug!(request_id = %queued.request.request_id, "Dropping orphaned request");
                    continue;
                }
                batch.push(queued);
            }
        }

        batch
    }
}

struct BatcherInner {
    config: BatchingConfig,
    processor: Arc<BatchProcessor>,
    queues: Mutex<HashMap<String, ModelQueue>>,
    shutting_down: Mutex<bool>,
    tracker: TaskTracker,
}

/// Priority-aware request batcher
#[derive(Clone)]
pub struct RequestBatcher {
    inner: Arc<BatcherInner>,
}

impl RequestBatcher {
    pub fn new(config: BatchingConfig, processor: Arc<BatchProcessor>) -> Self {
        let queues = config
            .models
            .iter()
            .map(|(name, model)| (name.clone(), ModelQueue::new(model.clone())))
            .collect();

        Self {
            inner: Arc::new(BatcherInner {
                config,
                processor,
                queues: Mutex::new(queues),
                shutting_down: Mutex::new(false),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &BatchingConfig {
        &self.inner.config
    }

    /// Queue a request and wait for its result
    pub async fn submit(&self, request: BatchRequest) -> OptimizerResult<Value> {
        let timeout = request.timeout.unwrap_or(self.inner.config.default_request_timeout);
        let request_id = request.request_id.clone();
        let model_type = request.model_type.clone();
        let (tx, rx) = oneshot::channel();

        {
            // Lock order: shutdown flag, then queues. Batches are handed to the
            // tracker before the locks drop so `shutdown` always waits for them.
            let shutting_down = self.inner.shutting_down.lock();
            if *shutting_down {
                return Err(OptimizerError::ShuttingDown);
            }

            let mut queues = self.inner.queues.lock();
            let Some(queue) = queues.get_mut(&model_type) else {
                return Err(OptimizerError::UnknownModelType { model_type });
            };

            let was_empty = queue.pending() == 0;
            let priority = request.priority;
            queue.lanes[priority.index()].push_back(QueuedRequest {
                request,
                responder: tx,
            });
            queue.stats.submitted += 1;
            debug!(
                request_id = %request_id,
                model_type = %model_type,
                priority = %priority,
                pending = queue.pending(),
                "Request queued"
            );

            if was_empty {
                self.inner.arm_timer(&model_type, queue);
            }
            for (reason, batch) in self.inner.take_ready(&model_type, queue) {
                self.inner.dispatch(model_type.clone(), reason, batch);
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OptimizerError::internal(format!(
                "request {} was dropped without a result",
                request_id
            ))),
            Err(_) => {
                if let Some(queue) = self.inner.queues.lock().get_mut(&model_type) {
                    queue.stats.timed_out += 1;
                }
                counter!("batcher_timeouts_total", "model_type" => model_type.clone()).increment(1);
                warn!(request_id = %request_id, model_type = %model_type, "Request timed out");
                Err(OptimizerError::RequestTimeout {
                    request_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Evaluate every model queue once; returns the number of batches fired
    pub fn flush_ready(&self) -> usize {
        let mut fired = 0;
        let mut queues = self.inner.queues.lock();
        for (name, queue) in queues.iter_mut() {
            for (reason, batch) in self.inner.take_ready(name, queue) {
                self.inner.dispatch(name.clone(), reason, batch);
                fired += 1;
            }
        }
        fired
    }

    /// Spawn the periodic flush check
    pub fn spawn_tick_loop(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let batcher = self.clone();
        let every = self.inner.config.tick_interval;

        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        batcher.flush_ready();
                    }
                }
            }

            debug!("Batcher tick loop stopped");
        })
    }

    /// Requests waiting in the queues of `model_type`, orphans included
    pub fn pending_count(&self, model_type: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(model_type)
            .map(ModelQueue::pending)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> BatcherStats {
        let queues = self.inner.queues.lock();
        let models = queues
            .iter()
            .map(|(name, queue)| {
                let mut stats = queue.stats.clone();
                stats.pending = queue.pending();
                stats.average_batch_size = if stats.batches > 0 {
                    queue.dispatched_items as f64 / stats.batches as f64
                } else {
                    0.0
                };
                stats.recent_throughput = recent_throughput(&queue.recent);
                (name.clone(), stats)
            })
            .collect();

        BatcherStats {
            strategy: self.inner.config.strategy.to_string(),
            models,
        }
    }

    /// Stop accepting requests, flush every queue and wait for all batches
    pub async fn shutdown(&self) {
        let batches: Vec<(String, Vec<QueuedRequest>)> = {
            let mut shutting_down = self.inner.shutting_down.lock();
            if *shutting_down {
                return;
            }
            *shutting_down = true;

            let mut queues = self.inner.queues.lock();
            let mut batches = Vec::new();
            for (name, queue) in queues.iter_mut() {
                queue.cancel_timer();
                loop {
                    let batch = queue.drain_batch();
                    if batch.is_empty() {
                        break;
                    }
                    batches.push((name.clone(), batch));
                }
            }
            batches
        };

        info!(batches = batches.len(), "Flushing request batcher");
        for (model_type, batch) in batches {
            self.inner.dispatch(model_type, FireReason::Shutdown, batch);
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Request batcher drained");
    }
}

impl BatcherInner {
    fn throughput(&self, queue: &ModelQueue) -> Option<f64> {
        recent_throughput(&queue.recent)
    }

    /// Pull every batch the strategy wants to fire right now
    fn take_ready(self: &Arc<Self>, model_type: &str, queue: &mut ModelQueue) -> Vec<(FireReason, Vec<QueuedRequest>)> {
        let mut ready = Vec::new();

        while let Some(reason) = should_fire(
            self.config.strategy,
            &queue.config,
            &self.config.adaptive,
            queue.snapshot(false),
            self.throughput(queue),
        ) {
            let batch = queue.drain_batch();
            if batch.is_empty() {
                break;
            }
            ready.push((reason, batch));
        }

        if !ready.is_empty() {
            queue.cancel_timer();
            if queue.pending() > 0 {
                self.arm_timer(model_type, queue);
            }
        }
        ready
    }

    fn arm_timer(self: &Arc<Self>, model_type: &str, queue: &mut ModelQueue) {
        queue.cancel_timer();
        let generation = queue.generation;
        let after = queue.config.batch_timeout;
        let weak: Weak<Self> = Arc::downgrade(self);
        let model_type = model_type.to_string();

        queue.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_timer(&model_type, generation);
            }
        }));
    }

    fn on_timer(self: &Arc<Self>, model_type: &str, generation: u64) {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(model_type) else {
            return;
        };
        if queue.generation != generation {
            return;
        }
        queue.timer = None;
        queue.generation += 1;

        let fire = should_fire(
            self.config.strategy,
            &queue.config,
            &self.config.adaptive,
            queue.snapshot(true),
            self.throughput(queue),
        );
        let batch = if fire.is_some() { queue.drain_batch() } else { Vec::new() };

        if queue.pending() > 0 {
            self.arm_timer(model_type, queue);
        }
        if !batch.is_empty() {
            self.dispatch(model_type.to_string(), FireReason::Timer, batch);
        }
    }

    fn dispatch(self: &Arc<Self>, model_type: String, reason: FireReason, batch: Vec<QueuedRequest>) {
        let inner = Arc::clone(self);
        let size = batch.len();

        counter!(
            "batcher_batches_total",
            "model_type" => model_type.clone(),
            "reason" => reason.as_str()
        )
        .increment(1);
        debug!(model_type = %model_type, reason = %reason, batch_size = size, "Firing batch");

        self.tracker.spawn(async move {
            let started = Instant::now();
            let (items, responders): (Vec<BatchItem>, Vec<_>) = batch
                .into_iter()
                .map(|queued| {
                    let item = BatchItem {
                        request_id: queued.request.request_id,
                        payload: queued.request.payload,
                    };
                    (item, queued.responder)
                })
                .unzip();

            let results = inner.processor.process_batch(&model_type, items).await;
            let took = started.elapsed();

            let (mut completed, mut failed, mut orphaned) = (0u64, 0u64, 0u64);
            for (responder, result) in responders.into_iter().zip(results) {
                let ok = result.is_ok();
                // The caller may have timed out already
                if responder.send(result).is_err() {
                    orphaned += 1;
                } else if ok {
                    completed += 1;
                } else {
                    failed += 1;
                }
            }

            let mut queues = inner.queues.lock();
            if let Some(queue) = queues.get_mut(&model_type) {
                queue.stats.batches += 1;
                queue.stats.completed += completed;
                queue.stats.failed += failed;
                queue.stats.orphaned += orphaned;
                queue.dispatched_items += size as u64;

                queue.recent.push_back((size, took));
                while queue.recent.len() > inner.config.adaptive.throughput_window.max(1) {
                    queue.recent.pop_front();
                }
            }
        });
    }
}
