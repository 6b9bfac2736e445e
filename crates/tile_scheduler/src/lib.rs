//! Worker pool that runs tile jobs for the request tracker.
//!
//! Workers know nothing about requests: a job is a coordinate and a compute
//! closure, and its outcome goes to the listener of its batch.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, select, unbounded};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tile_protocol::{
    ComputeError, ComputeFn, JobPriority, RequestHandle, TileComputationListener,
    TileCoordinate, TileJobBatch, TileJobSink,
};
use tracing::{debug, error, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub worker_count: usize,
    /// Total tries for a job failing with a transient error.
    pub max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            max_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchedulerConfigError {
    #[error("worker_count must be at least 1")]
    NoWorkers,
    #[error("max_attempts must be at least 1")]
    NoAttempts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    pub live_batches: usize,
}

struct QueuedJob {
    handle: RequestHandle,
    coord: TileCoordinate,
    compute: ComputeFn,
    listener: Arc<dyn TileComputationListener>,
}

#[derive(Debug, Default)]
struct BatchState {
    unfinished: usize,
    cancelled_all: bool,
    cancelled: HashSet<TileCoordinate>,
}

struct Shared {
    max_attempts: u32,
    stopping: AtomicBool,
    batches: Mutex<HashMap<RequestHandle, BatchState>>,
    next_handle: AtomicU64,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
}

impl Shared {
    fn is_cancelled(&self, handle: RequestHandle, coord: TileCoordinate) -> bool {
        self.batches
            .lock()
            .get(&handle)
            .is_none_or(|batch| batch.cancelled_all || batch.cancelled.contains(&coord))
    }

    fn finish(&self, handle: RequestHandle) {
        let mut batches = self.batches.lock();
        let Some(batch) = batches.get_mut(&handle) else {
            panic!("finished a job of unknown batch {}", handle.0);
        };
        batch.unfinished -= 1;
        if batch.unfinished == 0 {
            batches.remove(&handle);
        }
    }
}

/// Fixed-size pool fed by an interactive and a prefetch queue.
///
/// Workers always take interactive jobs first. A job that has not started
/// can be cancelled; a running one finishes and reports normally.
pub struct TileScheduler {
    shared: Arc<Shared>,
    queues: RwLock<Option<JobQueues>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct JobQueues {
    interactive: Sender<QueuedJob>,
    prefetch: Sender<QueuedJob>,
}

impl TileScheduler {
    pub fn start(config: SchedulerConfig) -> Result<Self, SchedulerConfigError> {
        if config.worker_count == 0 {
            return Err(SchedulerConfigError::NoWorkers);
        }
        if config.max_attempts == 0 {
            return Err(SchedulerConfigError::NoAttempts);
        }
        let shared = Arc::new(Shared {
            max_attempts: config.max_attempts,
            stopping: AtomicBool::new(false),
            batches: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            retried: AtomicU64::new(0),
        });
        let (interactive_sender, interactive_receiver) = unbounded();
        let (prefetch_sender, prefetch_receiver) = unbounded();
        let workers: Vec<_> = (0..config.worker_count)
            .map(|index| {
                let shared = Arc::clone(&shared);
                let interactive = interactive_receiver.clone();
                let prefetch = prefetch_receiver.clone();
                std::thread::Builder::new()
                    .name(format!("tile_worker_{index}"))
                    .spawn(move || worker_loop(&shared, &interactive, &prefetch))
                    .expect("spawn tile worker thread")
            })
            .collect();
        debug!(workers = config.worker_count, "tile scheduler started");
        Ok(Self {
            shared,
            queues: RwLock::new(Some(JobQueues {
                interactive: interactive_sender,
                prefetch: prefetch_sender,
            })),
            workers: Mutex::new(workers),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            cancelled: self.shared.cancelled.load(Ordering::Relaxed),
            retried: self.shared.retried.load(Ordering::Relaxed),
            live_batches: self.shared.batches.lock().len(),
        }
    }

    /// Stops the pool. Jobs still queued are reported as cancelled.
    ///
    /// Must not be called from a job or listener running on a worker.
    pub fn shutdown(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.queues.write().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                error!("tile worker thread panicked");
            }
        }
    }
}

impl Drop for TileScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl TileJobSink for TileScheduler {
    fn submit(
        &self,
        batch: TileJobBatch,
        listener: Arc<dyn TileComputationListener>,
    ) -> RequestHandle {
        let handle = RequestHandle(self.shared.next_handle.fetch_add(1, Ordering::Relaxed));
        if batch.jobs.is_empty() {
            return handle;
        }
        let queues = self.queues.read();
        let Some(queues) = queues.as_ref() else {
            for job in &batch.jobs {
                self.shared.cancelled.fetch_add(1, Ordering::Relaxed);
                listener.tile_cancelled(handle, job.coord);
            }
            return handle;
        };
        let sender = match batch.priority {
            JobPriority::Interactive => &queues.interactive,
            JobPriority::Prefetch => &queues.prefetch,
        };

        self.shared.batches.lock().insert(
            handle,
            BatchState {
                unfinished: batch.jobs.len(),
                ..BatchState::default()
            },
        );
        self.shared
            .submitted
            .fetch_add(batch.jobs.len() as u64, Ordering::Relaxed);
        trace!(
            handle = handle.0,
            jobs = batch.jobs.len(),
            priority = ?batch.priority,
            "batch submitted"
        );
        for job in batch.jobs {
            let queued = QueuedJob {
                handle,
                coord: job.coord,
                compute: job.compute,
                listener: Arc::clone(&listener),
            };
            if let Err(returned) = sender.send(queued) {
                let job = returned.into_inner();
                self.shared.cancelled.fetch_add(1, Ordering::Relaxed);
                job.listener.tile_cancelled(job.handle, job.coord);
                self.shared.finish(job.handle);
            }
        }
        handle
    }

    fn cancel(&self, handle: RequestHandle, coords: Option<&[TileCoordinate]>) {
        let mut batches = self.shared.batches.lock();
        let Some(batch) = batches.get_mut(&handle) else {
            return;
        };
        match coords {
            None => batch.cancelled_all = true,
            Some(coords) => batch.cancelled.extend(coords.iter().copied()),
        }
    }
}

fn next_job(interactive: &Receiver<QueuedJob>, prefetch: &Receiver<QueuedJob>) -> Option<QueuedJob> {
    if let Ok(job) = interactive.try_recv() {
        return Some(job);
    }
    if let Ok(job) = prefetch.try_recv() {
        return Some(job);
    }
    select! {
        recv(interactive) -> job => job.ok().or_else(|| prefetch.recv().ok()),
        recv(prefetch) -> job => job.ok().or_else(|| interactive.recv().ok()),
    }
}

fn worker_loop(shared: &Shared, interactive: &Receiver<QueuedJob>, prefetch: &Receiver<QueuedJob>) {
    while let Some(job) = next_job(interactive, prefetch) {
        run_job(shared, job);
    }
}

fn run_job(shared: &Shared, job: QueuedJob) {
    let QueuedJob {
        handle,
        coord,
        compute,
        listener,
    } = job;
    if shared.stopping.load(Ordering::Acquire) || shared.is_cancelled(handle, coord) {
        shared.cancelled.fetch_add(1, Ordering::Relaxed);
        notify(handle, coord, || listener.tile_cancelled(handle, coord));
        shared.finish(handle);
        return;
    }

    let mut attempt = 1;
    let outcome = loop {
        let result = catch_unwind(AssertUnwindSafe(|| compute())).unwrap_or_else(|payload| {
            Err(ComputeError::KernelPanicked(panic_message(payload.as_ref())))
        });
        match result {
            Err(error) if error.is_transient() && attempt < shared.max_attempts => {
                debug!(handle = handle.0, %coord, attempt, %error, "retrying tile job");
                shared.retried.fetch_add(1, Ordering::Relaxed);
                attempt += 1;
            }
            result => break result,
        }
    };

    match outcome {
        Ok(buffer) => {
            shared.completed.fetch_add(1, Ordering::Relaxed);
            notify(handle, coord, || listener.tile_computed(handle, coord, &buffer));
        }
        Err(error) => {
            shared.failed.fetch_add(1, Ordering::Relaxed);
            notify(handle, coord, || listener.tile_failed(handle, coord, &error));
        }
    }
    shared.finish(handle);
}

/// Runs a listener callback; a panic in it must not take the worker down.
fn notify(handle: RequestHandle, coord: TileCoordinate, callback: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(callback)) {
        error!(
            handle = handle.0,
            %coord,
            panic = %panic_message(payload.as_ref()),
            "tile listener panicked"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
