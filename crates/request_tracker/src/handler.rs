use tile_protocol::{ComputeError, Epoch, ImageId, TileBuffer};

/// How a batch of tiles is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueMode {
    /// The caller blocks until every accepted tile was delivered.
    Synchronous,
    /// Returns at once; tiles arrive through the handler.
    Asynchronous,
    /// Speculative read-ahead. Any later queue call cancels it.
    Prefetch,
}

impl QueueMode {
    pub fn is_synchronous(self) -> bool {
        self == QueueMode::Synchronous
    }

    pub fn is_prefetch(self) -> bool {
        self == QueueMode::Prefetch
    }
}

/// What a handler learns about the request a tile was delivered for.
#[derive(Debug, Clone, Copy)]
pub struct PaintContext<'a> {
    image: ImageId,
    epoch: Epoch,
    mode: QueueMode,
    buffer: Option<&'a TileBuffer>,
}

impl<'a> PaintContext<'a> {
    pub(crate) fn new(
        image: ImageId,
        epoch: Epoch,
        mode: QueueMode,
        buffer: Option<&'a TileBuffer>,
    ) -> Self {
        Self {
            image,
            epoch,
            mode,
            buffer,
        }
    }

    pub fn image(&self) -> ImageId {
        self.image
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn is_synchronous(&self) -> bool {
        self.mode.is_synchronous()
    }

    pub fn is_prefetch(&self) -> bool {
        self.mode.is_prefetch()
    }

    /// The computed tile; `None` when reporting a failure.
    pub fn buffer(&self) -> Option<&'a TileBuffer> {
        self.buffer
    }
}

/// Consumer callback for delivered tiles.
///
/// Called on a worker thread with the tracker locked. A handler may call
/// back into the tracker from that thread, but must not block on another
/// thread that uses the tracker.
///
/// A handler is only told about tiles its own request scheduled. Tiles that
/// were dropped as duplicates of an in-flight request are delivered to that
/// request's handler, never to this one.
pub trait TileHandler: Send + Sync {
    fn handle(&self, tile_x: u32, tile_y: u32, context: &PaintContext<'_>);

    /// The tile stays pending; draw a placeholder or re-queue it.
    fn failed(&self, tile_x: u32, tile_y: u32, context: &PaintContext<'_>, error: &ComputeError) {
        let _ = (tile_x, tile_y, context, error);
    }
}

impl<F> TileHandler for F
where
    F: Fn(u32, u32, &PaintContext<'_>) + Send + Sync,
{
    fn handle(&self, tile_x: u32, tile_y: u32, context: &PaintContext<'_>) {
        self(tile_x, tile_y, context)
    }
}
