//! Bookkeeping for outstanding paint and prefetch requests.
//!
//! Every request covers a set of tiles of one (image, epoch). Tiles already
//! wanted by a live request of the same (image, epoch) are not scheduled a
//! second time, and a completed tile is delivered only to the request whose
//! scheduler handle produced it. A caller whose tiles were dropped as
//! duplicates therefore receives no callback for them.

use std::cell::RefCell;
use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use bitvec::prelude::{BitVec, Lsb0};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use crossbeam_queue::ArrayQueue;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tile_protocol::{
    ComputeError, Epoch, ImageId, JobPriority, RequestHandle, TileBuffer,
    TileComputationListener, TileCoordinate, TileJob, TileJobBatch, TileJobSink,
};
use tracing::{debug, error, trace, warn};

mod handler;

pub use handler::{PaintContext, QueueMode, TileHandler};

pub const DEFAULT_SYNCHRONOUS_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_FAILURE_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// How long a synchronous queue call waits before returning anyway.
    pub synchronous_timeout_ms: u64,
    /// Failed tiles kept for [`RequestTracker::recent_failures`].
    pub failure_history: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            synchronous_timeout_ms: DEFAULT_SYNCHRONOUS_TIMEOUT_MS,
            failure_history: DEFAULT_FAILURE_HISTORY,
        }
    }
}

impl TrackerConfig {
    pub fn synchronous_timeout(&self) -> Duration {
        Duration::from_millis(self.synchronous_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedTile {
    pub image: ImageId,
    pub epoch: Epoch,
    pub coord: TileCoordinate,
    pub error: ComputeError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSummary {
    pub image: ImageId,
    pub epoch: Epoch,
    pub mode: QueueMode,
    pub handle: Option<RequestHandle>,
    pub requested: usize,
    pub pending: usize,
}

type Coordinates = SmallVec<[TileCoordinate; 16]>;

struct TrackedRequest {
    id: u64,
    image: ImageId,
    epoch: Epoch,
    mode: QueueMode,
    handle: Option<RequestHandle>,
    coords: Coordinates,
    handled: BitVec<usize, Lsb0>,
    pending: usize,
    handler: Arc<dyn TileHandler>,
    // Never sent on; dropping it wakes a synchronous caller.
    _done: Option<Sender<()>>,
}

impl TrackedRequest {
    fn matches(&self, image: ImageId, epoch: Epoch) -> bool {
        self.image == image && self.epoch == epoch
    }

    fn has_tile(&self, coord: TileCoordinate) -> bool {
        self.coords.contains(&coord)
    }

    /// Returns false when `coord` is not part of this request.
    fn mark_handled(&mut self, coord: TileCoordinate) -> bool {
        let Some(index) = self.coords.iter().position(|owned| *owned == coord) else {
            return false;
        };
        let Some(mut slot) = self.handled.get_mut(index) else {
            panic!("handled bitset shorter than request {}", self.id);
        };
        if *slot {
            panic!(
                "tile {coord} of request {} ({:?}, {}) handled twice",
                self.id, self.image, self.epoch
            );
        }
        *slot = true;
        self.pending -= 1;
        true
    }

    fn summary(&self) -> RequestSummary {
        RequestSummary {
            image: self.image,
            epoch: self.epoch,
            mode: self.mode,
            handle: self.handle,
            requested: self.coords.len(),
            pending: self.pending,
        }
    }
}

#[derive(Default)]
struct TrackerState {
    // Oldest first.
    requests: Vec<TrackedRequest>,
    prefetch: Option<u64>,
    next_request_id: u64,
    // Request whose batch is being handed to the sink; its handle is not
    // recorded yet.
    submitting: Option<u64>,
}

impl TrackerState {
    fn position(&self, id: u64) -> Option<usize> {
        self.requests.iter().position(|request| request.id == id)
    }

    fn find_by_handle(&mut self, handle: RequestHandle) -> Option<&mut TrackedRequest> {
        self.requests
            .iter_mut()
            .find(|request| request.handle == Some(handle))
    }

    fn remove(&mut self, id: u64) -> Option<TrackedRequest> {
        let index = self.position(id)?;
        if self.prefetch == Some(id) {
            self.prefetch = None;
        }
        Some(self.requests.remove(index))
    }

    fn remove_where(&mut self, mut predicate: impl FnMut(&TrackedRequest) -> bool) -> Vec<TrackedRequest> {
        let mut removed = Vec::new();
        let mut index = 0;
        while index < self.requests.len() {
            if predicate(&self.requests[index]) {
                let request = self.requests.remove(index);
                if self.prefetch == Some(request.id) {
                    self.prefetch = None;
                }
                removed.push(request);
            } else {
                index += 1;
            }
        }
        removed
    }

    fn is_in_flight(&self, image: ImageId, epoch: Epoch, coord: TileCoordinate) -> bool {
        self.requests
            .iter()
            .any(|request| request.matches(image, epoch) && request.has_tile(coord))
    }
}

type StateGuard<'a> = ReentrantMutexGuard<'a, RefCell<TrackerState>>;

struct TrackerCore {
    config: TrackerConfig,
    sink: Arc<dyn TileJobSink>,
    // Reentrant so that handlers, which run with the lock held, can call
    // back into the tracker. A RefCell borrow never spans a handler call.
    state: ReentrantMutex<RefCell<TrackerState>>,
    failures: ArrayQueue<FailedTile>,
}

impl TrackerCore {
    fn cancel_requests(&self, requests: Vec<TrackedRequest>) {
        for request in requests {
            debug!(
                image = ?request.image,
                epoch = request.epoch.0,
                pending = request.pending,
                mode = ?request.mode,
                "request cancelled"
            );
            if let Some(handle) = request.handle {
                self.sink.cancel(handle, None);
            }
        }
    }

    /// Removes `id` once nothing of it is pending.
    fn retire_if_done(&self, state: &mut TrackerState, id: u64) {
        let finished = state
            .position(id)
            .is_some_and(|index| state.requests[index].pending == 0);
        if !finished {
            return;
        }
        if let Some(request) = state.remove(id) {
            debug!(
                image = ?request.image,
                epoch = request.epoch.0,
                tiles = request.coords.len(),
                "request done"
            );
        }
    }

    fn cancel_prefetch(&self, guard: &StateGuard<'_>) {
        let stale = {
            let mut state = guard.borrow_mut();
            match state.prefetch {
                Some(id) => state.remove(id),
                None => None,
            }
        };
        self.cancel_requests(stale.into_iter().collect());
    }
}

impl TileComputationListener for TrackerCore {
    fn tile_computed(&self, handle: RequestHandle, coord: TileCoordinate, buffer: &TileBuffer) {
        let guard = self.state.lock();
        let delivery = {
            let mut state = guard.borrow_mut();
            match state.find_by_handle(handle) {
                Some(request) => {
                    if request.mark_handled(coord) {
                        Some((
                            request.id,
                            Arc::clone(&request.handler),
                            PaintContext::new(
                                request.image,
                                request.epoch,
                                request.mode,
                                Some(buffer),
                            ),
                        ))
                    } else {
                        trace!(handle = handle.0, %coord, "tile not owned by request");
                        None
                    }
                }
                None => {
                    trace!(handle = handle.0, %coord, "dropped completion of retired request");
                    None
                }
            }
        };
        let Some((id, handler, context)) = delivery else {
            return;
        };

        let painted =
            catch_unwind(AssertUnwindSafe(|| handler.handle(coord.tile_x, coord.tile_y, &context)));
        if painted.is_err() {
            error!(handle = handle.0, %coord, "tile handler panicked");
        }

        self.retire_if_done(&mut guard.borrow_mut(), id);
    }

    fn tile_failed(&self, handle: RequestHandle, coord: TileCoordinate, error: &ComputeError) {
        let guard = self.state.lock();
        let delivery = {
            let mut state = guard.borrow_mut();
            state
                .find_by_handle(handle)
                .filter(|request| request.has_tile(coord))
                .map(|request| {
                    (
                        Arc::clone(&request.handler),
                        request.image,
                        request.epoch,
                        request.mode,
                    )
                })
        };
        let Some((handler, image, epoch, mode)) = delivery else {
            trace!(handle = handle.0, %coord, %error, "dropped failure of retired request");
            return;
        };

        warn!(image = ?image, epoch = epoch.0, %coord, %error, "tile computation failed");
        self.failures.force_push(FailedTile {
            image,
            epoch,
            coord,
            error: error.clone(),
        });
        let context = PaintContext::new(image, epoch, mode, None);
        let reported = catch_unwind(AssertUnwindSafe(|| {
            handler.failed(coord.tile_x, coord.tile_y, &context, error)
        }));
        if reported.is_err() {
            error!(handle = handle.0, %coord, "tile handler panicked on failure");
        }
    }

    /// Requests the tracker cancelled are already gone, so a live owner
    /// means the scheduler dropped the job itself, e.g. while shutting
    /// down. The tile will never arrive; stop waiting for it.
    fn tile_cancelled(&self, handle: RequestHandle, coord: TileCoordinate) {
        let guard = self.state.lock();
        let mut borrowed = guard.borrow_mut();
        let state = &mut *borrowed;
        let owner = state
            .find_by_handle(handle)
            .map(|request| request.id)
            .or(state.submitting);
        let Some(index) = owner.and_then(|id| state.position(id)) else {
            trace!(handle = handle.0, %coord, "tile job cancelled");
            return;
        };
        let request = &mut state.requests[index];
        if !request.mark_handled(coord) {
            trace!(handle = handle.0, %coord, "cancelled tile not owned by request");
            return;
        }
        warn!(
            image = ?request.image,
            epoch = request.epoch.0,
            %coord,
            "scheduler dropped tile job"
        );
        let id = request.id;
        self.retire_if_done(state, id);
    }
}

/// Tracks live tile requests and routes scheduler completions to them.
///
/// Cheap to clone; clones share state. All operations are serialized by one
/// lock, which is also held while a handler runs. Once
/// [`RequestTracker::cancel_tiles`] returns, no handler of the cancelled
/// requests runs again.
#[derive(Clone)]
pub struct RequestTracker {
    core: Arc<TrackerCore>,
}

impl RequestTracker {
    pub fn new(config: TrackerConfig, sink: Arc<dyn TileJobSink>) -> Self {
        Self {
            core: Arc::new(TrackerCore {
                config,
                sink,
                state: ReentrantMutex::new(RefCell::new(TrackerState::default())),
                failures: ArrayQueue::new(config.failure_history.max(1)),
            }),
        }
    }

    pub fn config(&self) -> TrackerConfig {
        self.core.config
    }

    /// Queues `coords` of (`image`, `epoch`) and returns how many were
    /// newly scheduled.
    ///
    /// Any live prefetch request is cancelled first. Coordinates already
    /// requested by a live request of the same (image, epoch) are dropped;
    /// they keep being delivered to that request only, so `handler` hears
    /// about accepted tiles alone. `make_job` builds the job of each
    /// accepted coordinate.
    ///
    /// In [`QueueMode::Synchronous`] the call returns once every accepted
    /// tile was delivered, the request was cancelled, or the configured
    /// timeout passed. A failed tile stays pending, so only cancellation or
    /// the timeout ends such a wait. Synchronous queueing from inside a
    /// handler waits for the full timeout.
    pub fn queue_tiles(
        &self,
        image: ImageId,
        epoch: Epoch,
        coords: &[TileCoordinate],
        mode: QueueMode,
        mut make_job: impl FnMut(TileCoordinate) -> TileJob,
        handler: Arc<dyn TileHandler>,
    ) -> usize {
        let (accepted, waiter) = {
            let guard = self.core.state.lock();
            self.core.cancel_prefetch(&guard);

            let accepted: Coordinates = {
                let state = guard.borrow();
                let mut seen = HashSet::with_capacity(coords.len());
                coords
                    .iter()
                    .copied()
                    .filter(|coord| seen.insert(*coord) && !state.is_in_flight(image, epoch, *coord))
                    .collect()
            };
            if accepted.len() < coords.len() {
                debug!(
                    image = ?image,
                    epoch = epoch.0,
                    requested = coords.len(),
                    accepted = accepted.len(),
                    "dropped tiles already in flight"
                );
            }
            if accepted.is_empty() {
                return 0;
            }

            let (done, waiter) = if mode.is_synchronous() {
                let (done, waiter) = bounded::<()>(0);
                (Some(done), Some(waiter))
            } else {
                (None, None)
            };
            let priority = if mode.is_prefetch() {
                JobPriority::Prefetch
            } else {
                JobPriority::Interactive
            };
            let batch = TileJobBatch {
                priority,
                jobs: accepted.iter().map(|coord| make_job(*coord)).collect(),
            };
            let count = accepted.len();
            let id = {
                let mut state = guard.borrow_mut();
                let id = state.next_request_id;
                state.next_request_id += 1;
                state.requests.push(TrackedRequest {
                    id,
                    image,
                    epoch,
                    mode,
                    handle: None,
                    handled: BitVec::repeat(false, count),
                    pending: count,
                    coords: accepted,
                    handler,
                    _done: done,
                });
                if mode.is_prefetch() {
                    state.prefetch = Some(id);
                }
                id
            };

            // Completions need this lock, so none can arrive before the
            // handle is recorded.
            let listener: Arc<dyn TileComputationListener> = self.core.clone();
            guard.borrow_mut().submitting = Some(id);
            let handle = self.core.sink.submit(batch, listener);
            {
                let mut state = guard.borrow_mut();
                state.submitting = None;
                if let Some(index) = state.position(id) {
                    state.requests[index].handle = Some(handle);
                }
            }
            debug!(
                image = ?image,
                epoch = epoch.0,
                handle = handle.0,
                tiles = count,
                ?mode,
                "request queued"
            );
            (count, waiter)
        };

        if let Some(waiter) = waiter {
            if let Err(RecvTimeoutError::Timeout) =
                waiter.recv_timeout(self.core.config.synchronous_timeout())
            {
                warn!(
                    image = ?image,
                    epoch = epoch.0,
                    timeout_ms = self.core.config.synchronous_timeout_ms,
                    "synchronous tile request timed out"
                );
            }
        }
        accepted
    }

    /// Cancels every live request of (`image`, `epoch`); returns how many.
    pub fn cancel_tiles(&self, image: ImageId, epoch: Epoch) -> usize {
        self.cancel_where(|request| request.matches(image, epoch))
    }

    /// Cancels the live requests of `image` older than `current`.
    pub fn cancel_superseded(&self, image: ImageId, current: Epoch) -> usize {
        self.cancel_where(|request| request.image == image && request.epoch < current)
    }

    /// Cancels the live requests of every epoch of `image`.
    pub fn cancel_image(&self, image: ImageId) -> usize {
        self.cancel_where(|request| request.image == image)
    }

    /// Tiles of (`image`, `epoch`) not yet delivered.
    pub fn pending_tiles(&self, image: ImageId, epoch: Epoch) -> usize {
        let guard = self.core.state.lock();
        let state = guard.borrow();
        state
            .requests
            .iter()
            .filter(|request| request.matches(image, epoch))
            .map(|request| request.pending)
            .sum()
    }

    /// Live requests, oldest first.
    pub fn live_requests(&self) -> Vec<RequestSummary> {
        let guard = self.core.state.lock();
        let state = guard.borrow();
        state.requests.iter().map(TrackedRequest::summary).collect()
    }

    pub fn has_prefetch(&self) -> bool {
        let guard = self.core.state.lock();
        let state = guard.borrow();
        state.prefetch.is_some()
    }

    /// The most recent tile failures, oldest first.
    pub fn recent_failures(&self) -> Vec<FailedTile> {
        // Failures are only pushed with the lock held.
        let _guard = self.core.state.lock();
        let mut failures = Vec::with_capacity(self.core.failures.len());
        while let Some(failure) = self.core.failures.pop() {
            failures.push(failure);
        }
        for failure in &failures {
            self.core.failures.force_push(failure.clone());
        }
        failures
    }

    fn cancel_where(&self, predicate: impl FnMut(&TrackedRequest) -> bool) -> usize {
        let guard = self.core.state.lock();
        let cancelled = guard.borrow_mut().remove_where(predicate);
        let count = cancelled.len();
        self.core.cancel_requests(cancelled);
        count
    }
}
