//! Editing session: one document's images, their edit stacks and the tile
//! pipeline that renders them.
//!
//! The session owns every component. Nothing here is process-wide, so two
//! sessions never share caches, workers or requests.

use std::sync::Arc;

use ops::{
    GraphError, GraphSnapshot, NodeId, OperationGraph, OperationKind, OperationNode,
    RasterSource, StoredOperation, TileComputeEngine,
};
use parking_lot::Mutex;
use request_tracker::{FailedTile, QueueMode, RequestTracker, TileHandler};
use slotmap::SlotMap;
use thiserror::Error;
use tile_protocol::{
    ComputeError, Epoch, ImageId, PixelRect, TileBuffer, TileCoordinate, TileGrid, TileJob,
};
use tile_scheduler::{SchedulerStats, TileScheduler};
use tiles::{TileKey, TileStore, TileStoreStats};
use tracing::{debug, info, warn};

mod config;

pub use config::{ConfigError, DEFAULT_TILE_SIZE, SessionConfig};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown image {0:?}")]
    UnknownImage(ImageId),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("malformed edit stack: {0}")]
    EditStack(#[from] serde_json::Error),
}

struct ImageDocument {
    graph: OperationGraph,
    epoch: Epoch,
}

/// Owns the images of one document and renders their tiles.
///
/// Tiles are delivered through [`TileHandler`]s on worker threads. A handler
/// may call back into the session, but the session must not be dropped from
/// inside a handler.
///
/// Tiles already requested by a live request of the same image and epoch
/// are not scheduled twice. They are delivered to the request that first
/// asked for them, so a later caller hears only about tiles it was the
/// first to request.
pub struct EditingSession {
    config: SessionConfig,
    // Never held while calling into the tracker.
    images: Mutex<SlotMap<ImageId, ImageDocument>>,
    store: Arc<TileStore>,
    engine: Arc<TileComputeEngine>,
    scheduler: Arc<TileScheduler>,
    tracker: RequestTracker,
}

impl EditingSession {
    pub fn new(config: SessionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let scheduler = Arc::new(TileScheduler::start(config.scheduler)?);
        let tracker = RequestTracker::new(config.tracker, scheduler.clone());
        info!(
            tile_size = config.tile_size,
            workers = config.scheduler.worker_count,
            capacity_bytes = config.store.capacity_bytes,
            "editing session started"
        );
        Ok(Self {
            config,
            images: Mutex::new(SlotMap::with_key()),
            store: Arc::new(TileStore::new(config.store)),
            engine: Arc::new(TileComputeEngine::new(config.mask_cache_entries)),
            scheduler,
            tracker,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn open_image(&self, source: Arc<dyn RasterSource>) -> ImageId {
        let (width, height) = source.bounds();
        let graph = OperationGraph::new(source, self.config.tile_size);
        let image = self.images.lock().insert(ImageDocument {
            graph,
            epoch: Epoch::default(),
        });
        info!(image = ?image, width, height, "image opened");
        image
    }

    /// Disposes `image`: its requests are cancelled and its tiles released.
    pub fn close_image(&self, image: ImageId) -> Result<(), SessionError> {
        self.images
            .lock()
            .remove(image)
            .ok_or(SessionError::UnknownImage(image))?;
        let cancelled = self.tracker.cancel_image(image);
        let released = self.store.remove_tiles(image);
        info!(image = ?image, cancelled, released, "image closed");
        Ok(())
    }

    pub fn epoch(&self, image: ImageId) -> Result<Epoch, SessionError> {
        self.with_document(image, |document| document.epoch)
    }

    pub fn grid(&self, image: ImageId) -> Result<TileGrid, SessionError> {
        self.with_document(image, |document| document.graph.grid())
    }

    pub fn operations(&self, image: ImageId) -> Result<Vec<OperationNode>, SessionError> {
        self.with_document(image, |document| document.graph.nodes().to_vec())
    }

    pub fn add_operation(&self, image: ImageId, kind: OperationKind) -> Result<NodeId, SessionError> {
        self.edit(image, |graph| Ok((graph.add(kind), true)))
    }

    /// Returns false, leaving the epoch alone, when `kind` equals the
    /// node's current parameters.
    pub fn update_operation(
        &self,
        image: ImageId,
        node: NodeId,
        kind: OperationKind,
    ) -> Result<bool, SessionError> {
        self.edit(image, |graph| {
            let changed = graph.update(node, kind)?;
            Ok((changed, changed))
        })
    }

    pub fn remove_operation(
        &self,
        image: ImageId,
        node: NodeId,
    ) -> Result<OperationNode, SessionError> {
        self.edit(image, |graph| Ok((graph.remove(node)?, true)))
    }

    pub fn set_operation_enabled(
        &self,
        image: ImageId,
        node: NodeId,
        enabled: bool,
    ) -> Result<bool, SessionError> {
        self.edit(image, |graph| {
            let changed = graph.set_enabled(node, enabled)?;
            Ok((changed, changed))
        })
    }

    /// The operation list of `image` as JSON, for saving with the document.
    pub fn edit_stack_json(&self, image: ImageId) -> Result<String, SessionError> {
        let stack = self.with_document(image, |document| document.graph.edit_stack())?;
        Ok(serde_json::to_string_pretty(&stack)?)
    }

    /// Replaces every operation of `image` with a saved edit stack.
    pub fn apply_edit_stack_json(
        &self,
        image: ImageId,
        json: &str,
    ) -> Result<Vec<NodeId>, SessionError> {
        let stack: Vec<StoredOperation> = serde_json::from_str(json)?;
        self.edit(image, |graph| Ok((graph.replace_operations(stack), true)))
    }

    /// Queues tiles of the current epoch of `image`; returns how many were
    /// newly scheduled. Coordinates outside the image are ignored.
    ///
    /// See [`RequestTracker::queue_tiles`] for the blocking and delivery
    /// rules of each [`QueueMode`].
    pub fn queue_tiles(
        &self,
        image: ImageId,
        coords: &[TileCoordinate],
        mode: QueueMode,
        handler: Arc<dyn TileHandler>,
    ) -> Result<usize, SessionError> {
        let snapshot = self.snapshot(image)?;
        let grid = snapshot.grid();
        let inside: Vec<TileCoordinate> = coords
            .iter()
            .copied()
            .filter(|coord| grid.contains(*coord))
            .collect();
        if inside.len() < coords.len() {
            warn!(
                image = ?image,
                ignored = coords.len() - inside.len(),
                "ignoring tiles outside the image"
            );
        }

        let make_job = |coord: TileCoordinate| {
            let store = Arc::clone(&self.store);
            let engine = Arc::clone(&self.engine);
            let snapshot = Arc::clone(&snapshot);
            TileJob::new(coord, move || render_tile(&store, &engine, &snapshot, coord))
        };
        Ok(self.tracker.queue_tiles(
            image,
            snapshot.epoch(),
            &inside,
            mode,
            make_job,
            handler,
        ))
    }

    /// Paints the tiles under `viewport` synchronously, then prefetches the
    /// ring of tiles around it. Returns how many visible tiles were painted
    /// for this call.
    pub fn queue_viewport(
        &self,
        image: ImageId,
        viewport: PixelRect,
        handler: Arc<dyn TileHandler>,
    ) -> Result<usize, SessionError> {
        let grid = self.grid(image)?;
        let visible = grid.tiles_in_rect(&viewport);
        let painted = self.queue_tiles(
            image,
            &visible,
            QueueMode::Synchronous,
            Arc::clone(&handler),
        )?;
        let ring = grid.prefetch_ring(&viewport, 1);
        let prefetched = self.queue_tiles(image, &ring, QueueMode::Prefetch, handler)?;
        debug!(image = ?image, painted, prefetched, "viewport queued");
        Ok(painted)
    }

    pub fn pending_tiles(&self, image: ImageId, epoch: Epoch) -> usize {
        self.tracker.pending_tiles(image, epoch)
    }

    pub fn cancel_tiles(&self, image: ImageId, epoch: Epoch) -> usize {
        self.tracker.cancel_tiles(image, epoch)
    }

    /// A tile of the current epoch, if it is still cached.
    pub fn cached_tile(
        &self,
        image: ImageId,
        coord: TileCoordinate,
    ) -> Result<Option<TileBuffer>, SessionError> {
        let epoch = self.epoch(image)?;
        Ok(self.store.get(&TileKey::new(image, epoch, coord)))
    }

    /// Drops the cached tiles of `image`; they are recomputed on demand.
    pub fn evict_cached_tiles(&self, image: ImageId) -> Result<u64, SessionError> {
        self.epoch(image)?;
        Ok(self.store.evict_all(image))
    }

    pub fn recent_failures(&self) -> Vec<FailedTile> {
        self.tracker.recent_failures()
    }

    pub fn store_stats(&self) -> TileStoreStats {
        self.store.stats()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    fn with_document<T>(
        &self,
        image: ImageId,
        read: impl FnOnce(&ImageDocument) -> T,
    ) -> Result<T, SessionError> {
        let images = self.images.lock();
        let document = images.get(image).ok_or(SessionError::UnknownImage(image))?;
        Ok(read(document))
    }

    fn snapshot(&self, image: ImageId) -> Result<Arc<GraphSnapshot>, SessionError> {
        let mut images = self.images.lock();
        let document = images
            .get_mut(image)
            .ok_or(SessionError::UnknownImage(image))?;
        Ok(document.graph.snapshot(image, document.epoch))
    }

    /// Applies `change` to the graph of `image`. When it reports an
    /// effective change the epoch moves on, and requests and tiles of every
    /// older epoch are dropped. A request queued from a snapshot taken just
    /// before an earlier edit can still be live at an older epoch.
    fn edit<T>(
        &self,
        image: ImageId,
        change: impl FnOnce(&mut OperationGraph) -> Result<(T, bool), GraphError>,
    ) -> Result<T, SessionError> {
        let (result, current) = {
            let mut images = self.images.lock();
            let document = images
                .get_mut(image)
                .ok_or(SessionError::UnknownImage(image))?;
            let (result, changed) = change(&mut document.graph)?;
            if !changed {
                return Ok(result);
            }
            document.epoch = document.epoch.next();
            (result, document.epoch)
        };

        let cancelled = self.tracker.cancel_superseded(image, current);
        let evicted = self.store.evict_superseded(image, current);
        debug!(
            image = ?image,
            epoch = current.0,
            cancelled,
            evicted,
            "image edited"
        );
        Ok(result)
    }
}

impl Drop for EditingSession {
    fn drop(&mut self) {
        // Workers hold the tracker; join them before it goes away.
        self.scheduler.shutdown();
        info!("editing session closed");
    }
}

fn render_tile(
    store: &TileStore,
    engine: &TileComputeEngine,
    snapshot: &GraphSnapshot,
    coord: TileCoordinate,
) -> Result<TileBuffer, ComputeError> {
    let key = TileKey::new(snapshot.image(), snapshot.epoch(), coord);
    if let Some(buffer) = store.get(&key) {
        return Ok(buffer);
    }
    let buffer = engine.compute(snapshot, coord)?;
    if let Err(error) = store.put(key, buffer.clone()) {
        warn!(image = ?key.image, %coord, %error, "computed tile not cached");
    }
    Ok(buffer)
}
