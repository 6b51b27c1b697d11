//! Generic size+time triggered batch scheduler.
//!
//! One FIFO queue per *kind* (string key), each drained by a single
//! dispatch worker. A batch is cut when the queue reaches
//! `max_batch_size` or its oldest item exceeds `max_batch_age`. Within a
//! batch, items are ordered by priority descending then enqueue time
//! ascending; across batches there is no total order.
//!
//! A failing processor fails every item of that batch (one event each) and
//! the scheduler keeps accepting work. Batches are never retried.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::constants::{DEFAULT_BATCHER_MAX_PENDING, DEFAULT_ENQUEUE_TIMEOUT};
use crate::error::{Error, Result};

/// How often dispatch workers re-check the age trigger.
const DISPATCH_TICK: Duration = Duration::from_millis(50);

/// One queued unit of work.
#[derive(Debug, Clone)]
pub struct BatchItem<T> {
    pub id: Uuid,
    pub payload: T,
    pub enqueued_at: Instant,
    pub priority: i32,
    pub metadata: HashMap<String, String>,
}

/// Callback registered per kind.
#[async_trait]
pub trait BatchProcessor<T>: Send + Sync {
    async fn process(&self, kind: &str, items: Vec<BatchItem<T>>) -> anyhow::Result<()>;
}

/// Scheduler configuration shared by all kinds of one batcher.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub max_batch_size: usize,
    pub max_batch_age: Duration,
    /// Soft cap per kind; reaching it forces an eager flush before more
    /// items are accepted.
    pub max_pending: usize,
    /// How long `enqueue` may block on that flush before failing with
    /// [`Error::Backpressure`].
    pub enqueue_timeout: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            max_batch_age: Duration::from_millis(3000),
            max_pending: DEFAULT_BATCHER_MAX_PENDING,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
        }
    }
}

/// Failure event emitted once per item of a failed batch.
#[derive(Debug, Clone)]
pub struct ItemFailed {
    pub kind: String,
    pub item_id: Uuid,
    pub error: String,
}

/// Per-kind counters for the stats surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct KindStats {
    pub pending: usize,
    pub processed_items: u64,
    pub failed_items: u64,
    pub dispatched_batches: u64,
    pub failed_batches: u64,
}

struct KindState<T> {
    queue: VecDeque<BatchItem<T>>,
    stats: KindStats,
}

struct KindHandle<T> {
    name: String,
    state: Mutex<KindState<T>>,
    processor: Arc<dyn BatchProcessor<T>>,
    /// Serialises dispatch so at most one batch per kind is in flight.
    dispatch: tokio::sync::Mutex<()>,
    wake: Notify,
}

impl<T: Send + 'static> KindHandle<T> {
    /// Cut the next batch under the queue lock; `None` when no trigger
    /// fires (or `force` is false and the queue is empty).
    fn cut_batch(&self, config: &BatcherConfig, force: bool) -> Option<Vec<BatchItem<T>>> {
        let mut state = self.state.lock();
        if state.queue.is_empty() {
            return None;
        }
        let size_ready = state.queue.len() >= config.max_batch_size;
        let age_ready = state
            .queue
            .front()
            .is_some_and(|item| item.enqueued_at.elapsed() >= config.max_batch_age);
        if !(force || size_ready || age_ready) {
            return None;
        }

        let take = state.queue.len().min(config.max_batch_size);
        let mut batch: Vec<BatchItem<T>> = state.queue.drain(..take).collect();
        batch.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.enqueued_at.cmp(&b.enqueued_at))
        });
        state.stats.pending = state.queue.len();
        Some(batch)
    }

    async fn dispatch_ready(
        self: &Arc<Self>,
        config: &BatcherConfig,
        events: &broadcast::Sender<ItemFailed>,
        force: bool,
    ) -> usize {
        let _guard = self.dispatch.lock().await;
        let mut dispatched = 0;
        while let Some(batch) = self.cut_batch(config, force) {
            dispatched += batch.len();
            self.run_batch(batch, events).await;
            if !force {
                break;
            }
        }
        dispatched
    }

    async fn run_batch(&self, batch: Vec<BatchItem<T>>, events: &broadcast::Sender<ItemFailed>) {
        let count = batch.len();
        let ids: Vec<Uuid> = batch.iter().map(|item| item.id).collect();
        debug!(kind = %self.name, count, "dispatching batch");

        match self.processor.process(&self.name, batch).await {
            Ok(()) => {
                let mut state = self.state.lock();
                state.stats.processed_items += count as u64;
                state.stats.dispatched_batches += 1;
            }
            Err(err) => {
                error!(kind = %self.name, count, error = %err, "batch failed");
                {
                    let mut state = self.state.lock();
                    state.stats.failed_items += count as u64;
                    state.stats.failed_batches += 1;
                    state.stats.dispatched_batches += 1;
                }
                for item_id in ids {
                    let _ = events.send(ItemFailed {
                        kind: self.name.clone(),
                        item_id,
                        error: err.to_string(),
                    });
                }
            }
        }
    }
}

/// The typed batch scheduler.
pub struct Batcher<T> {
    config: BatcherConfig,
    kinds: RwLock<HashMap<String, Arc<KindHandle<T>>>>,
    events: broadcast::Sender<ItemFailed>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl<T: Send + 'static> Batcher<T> {
    #[must_use]
    pub fn new(config: BatcherConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            config,
            kinds: RwLock::new(HashMap::new()),
            events,
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to per-item failure events.
    #[must_use]
    pub fn subscribe_failures(&self) -> broadcast::Receiver<ItemFailed> {
        self.events.subscribe()
    }

    /// Register a kind and spawn its dispatch worker. Re-registering an
    /// existing kind replaces the processor for future batches.
    pub fn register_kind(
        self: &Arc<Self>,
        kind: impl Into<String>,
        processor: Arc<dyn BatchProcessor<T>>,
    ) {
        let kind = kind.into();
        let handle = Arc::new(KindHandle {
            name: kind.clone(),
            state: Mutex::new(KindState {
                queue: VecDeque::new(),
                stats: KindStats::default(),
            }),
            processor,
            dispatch: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
        });
        self.kinds.write().insert(kind, Arc::clone(&handle));

        let config = self.config.clone();
        let events = self.events.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let worker = tokio::spawn(async move {
            loop {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let dispatched = handle.dispatch_ready(&config, &events, false).await;
                if dispatched == 0 {
                    tokio::select! {
                        () = handle.wake.notified() => {}
                        () = tokio::time::sleep(DISPATCH_TICK) => {}
                    }
                }
            }
            debug!(kind = %handle.name, "dispatch worker stopped");
        });
        self.workers.lock().push(worker);
    }

    /// Enqueue a payload; returns the item id as a receipt.
    pub async fn enqueue(&self, kind: &str, payload: T, priority: i32) -> Result<Uuid> {
        self.enqueue_with(kind, payload, priority, HashMap::new())
            .await
    }

    /// Enqueue with metadata attached to the item.
    pub async fn enqueue_with(
        &self,
        kind: &str,
        payload: T,
        priority: i32,
        metadata: HashMap<String, String>,
    ) -> Result<Uuid> {
        let handle = self
            .kinds
            .read()
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::InvalidState(format!("unregistered batch kind: {kind}")))?;

        let over_cap = handle.state.lock().queue.len() >= self.config.max_pending;
        if over_cap {
            warn!(kind, cap = self.config.max_pending, "batcher over soft cap, flushing eagerly");
            let flush = handle.dispatch_ready(&self.config, &self.events, true);
            if tokio::time::timeout(self.config.enqueue_timeout, flush)
                .await
                .is_err()
            {
                return Err(Error::Backpressure {
                    kind: kind.to_string(),
                });
            }
        }

        let item = BatchItem {
            id: Uuid::new_v4(),
            payload,
            enqueued_at: Instant::now(),
            priority,
            metadata,
        };
        let id = item.id;
        let ready = {
            let mut state = handle.state.lock();
            state.queue.push_back(item);
            state.stats.pending = state.queue.len();
            state.queue.len() >= self.config.max_batch_size
        };
        if ready {
            handle.wake.notify_one();
        }
        Ok(id)
    }

    /// Synchronously run every pending batch of one kind.
    pub async fn flush_kind(&self, kind: &str) -> Result<()> {
        let handle = self
            .kinds
            .read()
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::InvalidState(format!("unregistered batch kind: {kind}")))?;
        handle.dispatch_ready(&self.config, &self.events, true).await;
        Ok(())
    }

    /// Synchronously run every pending batch of every kind.
    pub async fn flush_all(&self) {
        let handles: Vec<_> = self.kinds.read().values().cloned().collect();
        for handle in handles {
            handle.dispatch_ready(&self.config, &self.events, true).await;
        }
    }

    /// Flush everything, then stop the dispatch workers.
    pub async fn shutdown(&self) {
        self.flush_all().await;
        self.shutdown.store(true, Ordering::SeqCst);
        let handles: Vec<_> = self.kinds.read().values().cloned().collect();
        for handle in &handles {
            handle.wake.notify_one();
        }
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Pending depth of one kind (zero for unknown kinds).
    #[must_use]
    pub fn pending(&self, kind: &str) -> usize {
        self.kinds
            .read()
            .get(kind)
            .map_or(0, |handle| handle.state.lock().queue.len())
    }

    /// Stats snapshot per kind.
    #[must_use]
    pub fn stats(&self) -> HashMap<String, KindStats> {
        self.kinds
            .read()
            .iter()
            .map(|(kind, handle)| {
                let state = handle.state.lock();
                let mut stats = state.stats;
                stats.pending = state.queue.len();
                (kind.clone(), stats)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every processed batch.
    struct Recorder {
        batches: Mutex<Vec<Vec<(Uuid, i32)>>>,
        fail: AtomicBool,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl BatchProcessor<String> for Recorder {
        async fn process(
            &self,
            _kind: &str,
            items: Vec<BatchItem<String>>,
        ) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("processor exploded");
            }
            self.batches
                .lock()
                .push(items.iter().map(|i| (i.id, i.priority)).collect());
            Ok(())
        }
    }

    fn batcher(config: BatcherConfig) -> Arc<Batcher<String>> {
        Arc::new(Batcher::new(config))
    }

    #[tokio::test]
    async fn size_trigger_dispatches_full_batch() {
        let recorder = Recorder::new();
        let b = batcher(BatcherConfig {
            max_batch_size: 3,
            max_batch_age: Duration::from_secs(60),
            ..Default::default()
        });
        b.register_kind("k", recorder.clone());

        for i in 0..3 {
            b.enqueue("k", format!("item-{i}"), 0).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let batches = recorder.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(b.pending("k"), 0);
    }

    #[tokio::test]
    async fn age_trigger_dispatches_partial_batch() {
        let recorder = Recorder::new();
        let b = batcher(BatcherConfig {
            max_batch_size: 100,
            max_batch_age: Duration::from_millis(80),
            ..Default::default()
        });
        b.register_kind("k", recorder.clone());

        b.enqueue("k", "lonely".to_string(), 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(recorder.batches.lock().len(), 1);
    }

    #[tokio::test]
    async fn batch_is_ordered_by_priority_then_age() {
        let recorder = Recorder::new();
        let b = batcher(BatcherConfig {
            max_batch_size: 10,
            max_batch_age: Duration::from_secs(60),
            ..Default::default()
        });
        b.register_kind("k", recorder.clone());

        let low = b.enqueue("k", "low".to_string(), 1).await.unwrap();
        let high_old = b.enqueue("k", "high-old".to_string(), 5).await.unwrap();
        let high_new = b.enqueue("k", "high-new".to_string(), 5).await.unwrap();
        b.flush_kind("k").await.unwrap();

        let batches = recorder.batches.lock();
        let order: Vec<Uuid> = batches[0].iter().map(|(id, _)| *id).collect();
        assert_eq!(order, vec![high_old, high_new, low]);
    }

    #[tokio::test]
    async fn failed_batch_emits_event_per_item_and_keeps_running() {
        let recorder = Recorder::new();
        recorder.fail.store(true, Ordering::SeqCst);
        let b = batcher(BatcherConfig {
            max_batch_size: 2,
            max_batch_age: Duration::from_secs(60),
            ..Default::default()
        });
        b.register_kind("k", recorder.clone());
        let mut failures = b.subscribe_failures();

        b.enqueue("k", "a".to_string(), 0).await.unwrap();
        b.enqueue("k", "b".to_string(), 0).await.unwrap();
        b.flush_kind("k").await.unwrap();

        let first = failures.recv().await.unwrap();
        let second = failures.recv().await.unwrap();
        assert_eq!(first.kind, "k");
        assert_ne!(first.item_id, second.item_id);

        // The batcher still accepts and processes new work.
        recorder.fail.store(false, Ordering::SeqCst);
        b.enqueue("k", "c".to_string(), 0).await.unwrap();
        b.flush_kind("k").await.unwrap();
        assert_eq!(recorder.batches.lock().len(), 1);

        let stats = b.stats();
        assert_eq!(stats["k"].failed_items, 2);
        assert_eq!(stats["k"].processed_items, 1);
    }

    #[tokio::test]
    async fn flush_drains_multiple_batches() {
        let recorder = Recorder::new();
        let b = batcher(BatcherConfig {
            max_batch_size: 2,
            max_batch_age: Duration::from_secs(60),
            ..Default::default()
        });
        b.register_kind("k", recorder.clone());

        for i in 0..5 {
            b.enqueue("k", format!("{i}"), 0).await.unwrap();
        }
        // Workers may have consumed some already; flush finishes the rest.
        b.flush_kind("k").await.unwrap();
        assert_eq!(b.pending("k"), 0);
        let total: usize = recorder.batches.lock().iter().map(Vec::len).sum();
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn soft_cap_forces_eager_flush() {
        let recorder = Recorder::new();
        let b = batcher(BatcherConfig {
            max_batch_size: 10,
            max_batch_age: Duration::from_secs(60),
            max_pending: 4,
            enqueue_timeout: Duration::from_secs(1),
        });
        b.register_kind("k", recorder.clone());

        for i in 0..6 {
            b.enqueue("k", format!("{i}"), 0).await.unwrap();
        }
        // The fifth enqueue found the queue at the cap and flushed first.
        assert!(b.pending("k") < 6);
        let flushed: usize = recorder.batches.lock().iter().map(Vec::len).sum();
        assert!(flushed >= 4);
    }

    #[tokio::test]
    async fn enqueue_to_unknown_kind_fails() {
        let b = batcher(BatcherConfig::default());
        let err = b.enqueue("ghost", "x".to_string(), 0).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn shutdown_flushes_then_stops() {
        let recorder = Recorder::new();
        let b = batcher(BatcherConfig {
            max_batch_size: 100,
            max_batch_age: Duration::from_secs(60),
            ..Default::default()
        });
        b.register_kind("k", recorder.clone());
        b.enqueue("k", "pending".to_string(), 0).await.unwrap();

        b.shutdown().await;
        assert_eq!(recorder.batches.lock().len(), 1);
    }
}
