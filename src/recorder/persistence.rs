//! Persistence workers
//!
//! A fixed pool of async workers drains the frame queue. Each save is a
//! blocking write, so it runs on a bounded offload pool and the cooperative
//! executor stays free for acquisition.
//!
//! Workers have no end condition of their own. The coordinator cancels them
//! once acquisition is over and the queue has drained. Cancellation is only
//! observed while a worker is waiting for an entry; a save that has started
//! always runs to completion and is acknowledged.

use super::queue::{BoundedFrameQueue, QueueEntry};
use super::state::{PipelineEvent, StatsRegistry, WorkerReport};
use crate::storage::{DestinationMap, FileNaming, FrameSink};
use crate::utils::error::SinkError;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Failures of the offload pool itself
#[derive(Error, Debug)]
pub enum OffloadError {
    #[error("offload pool is shut down")]
    Shutdown,

    #[error("offloaded job failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Bounded pool for blocking jobs
///
/// Jobs run on the blocking threads of an explicitly supplied runtime; the
/// semaphore caps how many run at once.
#[derive(Clone)]
pub struct OffloadPool {
    runtime: Handle,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl OffloadPool {
    pub fn new(runtime: Handle, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Pool on the runtime of the calling task.
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current(max_concurrent: usize) -> Self {
        Self::new(Handle::current(), max_concurrent)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Jobs currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    /// Run `job` on a blocking thread once a slot is free
    pub async fn run<F, T>(&self, job: F) -> Result<T, OffloadError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OffloadError::Shutdown)?;

        let result = self
            .runtime
            .spawn_blocking(move || {
                let _permit = permit;
                job()
            })
            .await?;
        Ok(result)
    }
}

/// Everything a worker needs to persist an entry
pub struct SaveContext {
    pub queue: Arc<BoundedFrameQueue>,
    pub destinations: Arc<DestinationMap>,
    pub naming: FileNaming,
    pub sink: Arc<dyn FrameSink>,
    pub offload: OffloadPool,
    pub stats: Arc<StatsRegistry>,
    pub events: broadcast::Sender<PipelineEvent>,
}

/// One queue consumer
pub struct PersistenceWorker {
    id: usize,
    ctx: Arc<SaveContext>,
    cancel: CancellationToken,
}

impl PersistenceWorker {
    pub fn new(id: usize, ctx: Arc<SaveContext>, cancel: CancellationToken) -> Self {
        Self { id, ctx, cancel }
    }

    pub async fn run(self) -> WorkerReport {
        let mut report = WorkerReport {
            worker: self.id,
            ..Default::default()
        };

        loop {
            let entry = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                entry = self.ctx.queue.dequeue() => entry,
            };

            if self.persist(entry).await {
                report.saved += 1;
            } else {
                report.failed += 1;
            }
        }

        tracing::debug!(
            "Worker {} stopped after {} saves ({} failed)",
            self.id,
            report.saved,
            report.failed
        );
        report
    }

    /// Save one entry and acknowledge it whatever the outcome
    async fn persist(&self, entry: QueueEntry) -> bool {
        let QueueEntry { frame, channel } = entry;
        let sequence_id = frame.sequence_id();
        let path = self
            .ctx
            .destinations
            .path_for(&channel, sequence_id, &self.ctx.naming);

        let result = match &path {
            Some(path) => {
                let sink = self.ctx.sink.clone();
                let target = path.clone();
                let started = Instant::now();
                let saved = self
                    .ctx
                    .offload
                    .run(move || {
                        let result = sink.save(&frame, &target);
                        drop(frame);
                        result
                    })
                    .await
                    .unwrap_or_else(|e| Err(SinkError::Aborted(e.to_string())));
                tracing::debug!(
                    "[{}] Save of frame {} took {:?}",
                    channel,
                    sequence_id,
                    started.elapsed()
                );
                saved
            }
            None => {
                drop(frame);
                Err(SinkError::NoDestination(channel.clone()))
            }
        };

        let counters = self.ctx.stats.get(&channel);
        let saved = match result {
            Ok(()) => {
                if let Some(counters) = counters {
                    counters.add_saved();
                }
                let path = path.unwrap_or_default();
                tracing::debug!("[{}] Saved frame {} to {:?}", channel, sequence_id, path);
                let _ = self.ctx.events.send(PipelineEvent::FrameSaved {
                    channel: channel.clone(),
                    sequence_id,
                    path,
                });
                true
            }
            Err(e) => {
                if let Some(counters) = counters {
                    counters.add_save_failure();
                }
                tracing::error!(
                    "[{}] Failed to save frame {} to {:?}: {}",
                    channel,
                    sequence_id,
                    path.as_deref().unwrap_or_else(|| std::path::Path::new("<none>")),
                    e
                );
                let _ = self.ctx.events.send(PipelineEvent::SaveFailed {
                    channel: channel.clone(),
                    sequence_id,
                    path,
                    reason: e.to_string(),
                });
                false
            }
        };

        if let Err(e) = self.ctx.queue.mark_done(&channel) {
            tracing::error!("Worker {}: {}", self.id, e);
        }
        saved
    }
}

/// Fixed set of persistence workers sharing one cancellation token
pub struct PersistenceWorkerPool {
    workers: Vec<JoinHandle<WorkerReport>>,
    cancel: CancellationToken,
}

impl PersistenceWorkerPool {
    /// Spawn `num_workers` workers on `runtime`
    pub fn spawn(runtime: &Handle, num_workers: usize, ctx: Arc<SaveContext>) -> Self {
        let cancel = CancellationToken::new();
        let workers = (0..num_workers)
            .map(|id| {
                let worker = PersistenceWorker::new(id, ctx.clone(), cancel.clone());
                runtime.spawn(worker.run())
            })
            .collect();

        tracing::info!(
            "Started {} persistence workers ({} concurrent saves)",
            num_workers,
            ctx.offload.max_concurrent()
        );
        Self { workers, cancel }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Cancel idle workers and wait for them to exit.
    ///
    /// Only call this once nothing more will be enqueued and the queue has
    /// been joined; entries still queued would be left unprocessed.
    pub async fn shutdown(self) -> Vec<WorkerReport> {
        self.cancel.cancel();

        let mut reports = Vec::with_capacity(self.workers.len());
        for (id, handle) in self.workers.into_iter().enumerate() {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::error!("Worker {} ended abnormally: {}", id, e);
                    reports.push(WorkerReport {
                        worker: id,
                        ..Default::default()
                    });
                }
            }
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ChannelId, Frame};
    use crate::storage::{FilenameScheme, RawFileSink};
    use parking_lot::Mutex;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    /// Fails every save whose sequence id is listed
    struct FlakySink {
        fail: Vec<u64>,
        saved: Mutex<Vec<u64>>,
    }

    impl FrameSink for FlakySink {
        fn save(&self, frame: &Frame, _path: &Path) -> Result<(), SinkError> {
            if self.fail.contains(&frame.sequence_id()) {
                return Err(SinkError::Io {
                    path: PathBuf::from("/full"),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                });
            }
            self.saved.lock().push(frame.sequence_id());
            Ok(())
        }
    }

    /// Tracks how many saves overlap
    struct SlowSink {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FrameSink for SlowSink {
        fn save(&self, _frame: &Frame, _path: &Path) -> Result<(), SinkError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn context(
        queue: Arc<BoundedFrameQueue>,
        dir: &Path,
        sink: Arc<dyn FrameSink>,
        max_concurrent: usize,
    ) -> (Arc<SaveContext>, broadcast::Receiver<PipelineEvent>) {
        let mut destinations = DestinationMap::new();
        destinations.insert("top", dir.join("top"));
        destinations.ensure_directories().unwrap();
        let (events, rx) = broadcast::channel(64);
        let ctx = SaveContext {
            queue,
            destinations: Arc::new(destinations),
            naming: FileNaming::new(FilenameScheme::Sequence, ".raw"),
            sink,
            offload: OffloadPool::current(max_concurrent),
            stats: Arc::new(StatsRegistry::new(&[ChannelId::from("top")])),
            events,
        };
        (Arc::new(ctx), rx)
    }

    fn entry(id: u64, released: &Arc<AtomicU64>) -> QueueEntry {
        let released = released.clone();
        let frame = Frame::new(id, vec![id as u8; 4]).on_release(move |_| {
            released.fetch_add(1, Ordering::SeqCst);
        });
        QueueEntry::new(frame, ChannelId::from("top"))
    }

    #[tokio::test]
    async fn test_offload_pool_runs_job() {
        let pool = OffloadPool::current(2);
        let value = pool.run(|| 21 * 2).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_offload_pool_reports_panics() {
        let pool = OffloadPool::current(1);
        let result = pool.run(|| -> u32 { panic!("sink exploded") }).await;
        assert!(matches!(result, Err(OffloadError::Join(_))));
        // The slot is returned even though the job panicked
        assert_eq!(pool.run(|| 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_workers_save_raw_files() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(BoundedFrameQueue::new(8));
        let (ctx, _rx) = context(queue.clone(), dir.path(), Arc::new(RawFileSink), 2);
        let released = Arc::new(AtomicU64::new(0));

        let pool = PersistenceWorkerPool::spawn(&Handle::current(), 2, ctx.clone());
        for id in 1..=5 {
            queue.enqueue(entry(id, &released)).await.unwrap();
        }
        timeout(Duration::from_secs(5), queue.join()).await.unwrap();
        let reports = pool.shutdown().await;

        assert_eq!(reports.iter().map(|r| r.saved).sum::<u64>(), 5);
        for id in 1..=5u64 {
            let bytes = std::fs::read(dir.path().join("top").join(format!("{id}.raw"))).unwrap();
            assert_eq!(bytes, vec![id as u8; 4]);
        }
        assert_eq!(released.load(Ordering::SeqCst), 5);
        assert_eq!(ctx.stats.snapshot(&ChannelId::from("top")).saved, 5);
    }

    #[tokio::test]
    async fn test_save_failure_is_counted_and_acknowledged() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(BoundedFrameQueue::new(8));
        let sink = Arc::new(FlakySink {
            fail: vec![2],
            saved: Mutex::new(Vec::new()),
        });
        let (ctx, mut rx) = context(queue.clone(), dir.path(), sink.clone(), 1);
        let released = Arc::new(AtomicU64::new(0));

        let pool = PersistenceWorkerPool::spawn(&Handle::current(), 1, ctx.clone());
        for id in 1..=4 {
            queue.enqueue(entry(id, &released)).await.unwrap();
        }
        timeout(Duration::from_secs(5), queue.join()).await.unwrap();
        let reports = pool.shutdown().await;

        assert_eq!(*sink.saved.lock(), vec![1, 3, 4]);
        assert_eq!(reports[0].saved, 3);
        assert_eq!(reports[0].failed, 1);
        assert_eq!(queue.pending(), 0);
        assert_eq!(released.load(Ordering::SeqCst), 4);

        let counts = ctx.stats.snapshot(&ChannelId::from("top"));
        assert_eq!(counts.saved, 3);
        assert_eq!(counts.save_failures, 1);

        let mut failed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PipelineEvent::SaveFailed { sequence_id, .. } = event {
                failed.push(sequence_id);
            }
        }
        assert_eq!(failed, vec![2]);
    }

    #[tokio::test]
    async fn test_panicking_sink_is_a_save_failure() {
        struct PanicSink;
        impl FrameSink for PanicSink {
            fn save(&self, _frame: &Frame, _path: &Path) -> Result<(), SinkError> {
                panic!("driver crashed");
            }
        }

        let dir = tempdir().unwrap();
        let queue = Arc::new(BoundedFrameQueue::new(4));
        let (ctx, _rx) = context(queue.clone(), dir.path(), Arc::new(PanicSink), 1);
        let released = Arc::new(AtomicU64::new(0));

        let pool = PersistenceWorkerPool::spawn(&Handle::current(), 1, ctx.clone());
        queue.enqueue(entry(1, &released)).await.unwrap();
        timeout(Duration::from_secs(5), queue.join()).await.unwrap();
        let reports = pool.shutdown().await;

        assert_eq!(reports[0].failed, 1);
        assert_eq!(ctx.stats.snapshot(&ChannelId::from("top")).save_failures, 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_after_drain_leaves_nothing_pending() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(BoundedFrameQueue::new(4));
        let (ctx, _rx) = context(queue.clone(), dir.path(), Arc::new(RawFileSink), 2);
        let released = Arc::new(AtomicU64::new(0));

        let pool = PersistenceWorkerPool::spawn(&Handle::current(), 3, ctx);
        for id in 1..=6 {
            queue.enqueue(entry(id, &released)).await.unwrap();
        }
        queue.close();
        timeout(Duration::from_secs(5), queue.join()).await.unwrap();

        let reports = timeout(Duration::from_secs(1), pool.shutdown()).await.unwrap();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports.iter().map(|r| r.saved + r.failed).sum::<u64>(), 6);
        assert_eq!(queue.pending(), 0);
        assert!(queue.is_empty());
    }

    /// Marks when a save begins and when it has fully finished
    struct StallingSink {
        started: AtomicBool,
        done: AtomicBool,
    }

    impl FrameSink for StallingSink {
        fn save(&self, _frame: &Frame, _path: &Path) -> Result<(), SinkError> {
            self.started.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
            self.done.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_lets_running_save_finish() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(BoundedFrameQueue::new(4));
        let sink = Arc::new(StallingSink {
            started: AtomicBool::new(false),
            done: AtomicBool::new(false),
        });
        let (ctx, _rx) = context(queue.clone(), dir.path(), sink.clone(), 1);
        let released = Arc::new(AtomicU64::new(0));

        let pool = PersistenceWorkerPool::spawn(&Handle::current(), 1, ctx.clone());
        queue.enqueue(entry(1, &released)).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while !sink.started.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let reports = timeout(Duration::from_secs(5), pool.shutdown()).await.unwrap();

        assert!(sink.done.load(Ordering::SeqCst));
        assert_eq!(reports[0].saved, 1);
        assert_eq!(queue.pending(), 0);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.stats.snapshot(&ChannelId::from("top")).saved, 1);
    }

    #[tokio::test]
    async fn test_offload_bounds_concurrent_saves() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(BoundedFrameQueue::new(16));
        let sink = Arc::new(SlowSink {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let (ctx, _rx) = context(queue.clone(), dir.path(), sink.clone(), 2);
        let released = Arc::new(AtomicU64::new(0));

        let pool = PersistenceWorkerPool::spawn(&Handle::current(), 6, ctx);
        for id in 1..=12 {
            queue.enqueue(entry(id, &released)).await.unwrap();
        }
        timeout(Duration::from_secs(10), queue.join()).await.unwrap();
        pool.shutdown().await;

        assert!(sink.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(released.load(Ordering::SeqCst), 12);
    }
}
