use std::fmt;
use std::sync::Arc;

use static_assertions::assert_impl_all;
use thiserror::Error;

mod grid;

pub use grid::{PixelRect, TileGrid};

/// Interleaved RGB, 16 bits per channel.
pub const CHANNELS: usize = 3;

slotmap::new_key_type! {
    pub struct ImageId;
}

/// Version counter of an image's editing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Self {
        Epoch(self.0.checked_add(1).expect("epoch counter overflow"))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "epoch {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileCoordinate {
    pub tile_x: u32,
    pub tile_y: u32,
}

impl TileCoordinate {
    pub const fn new(tile_x: u32, tile_y: u32) -> Self {
        Self { tile_x, tile_y }
    }
}

impl From<(u32, u32)> for TileCoordinate {
    fn from((tile_x, tile_y): (u32, u32)) -> Self {
        Self { tile_x, tile_y }
    }
}

impl fmt::Display for TileCoordinate {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "({}, {})", self.tile_x, self.tile_y)
    }
}

/// Computed tile pixels.
///
/// Samples are shared, never mutated after construction, so a reader can
/// never observe a partially written buffer. Cloning only bumps a refcount.
#[derive(Clone, PartialEq, Eq)]
pub struct TileBuffer {
    width: u32,
    height: u32,
    samples: Arc<[u16]>,
}

impl TileBuffer {
    pub fn from_samples(width: u32, height: u32, samples: Vec<u16>) -> Result<Self, ComputeError> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|pixels| pixels.checked_mul(CHANNELS))
            .ok_or_else(|| ComputeError::Format(format!("tile {width}x{height} too large")))?;
        if samples.len() != expected {
            return Err(ComputeError::Format(format!(
                "tile {width}x{height} expects {expected} samples, got {}",
                samples.len()
            )));
        }
        Ok(Self {
            width,
            height,
            samples: samples.into(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn samples(&self) -> &[u16] {
        &self.samples
    }

    pub fn byte_len(&self) -> usize {
        self.samples.len() * std::mem::size_of::<u16>()
    }

    pub fn sample(&self, x: u32, y: u32) -> Option<[u16; CHANNELS]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = ((y as usize) * (self.width as usize) + x as usize) * CHANNELS;
        Some([
            self.samples[offset],
            self.samples[offset + 1],
            self.samples[offset + 2],
        ])
    }

    /// True when both handles share the same pixel storage.
    pub fn shares_storage(&self, other: &TileBuffer) -> bool {
        Arc::ptr_eq(&self.samples, &other.samples)
    }
}

impl fmt::Debug for TileBuffer {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TileBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// Scheduler-assigned handle for one submitted job batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobPriority {
    Interactive,
    Prefetch,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComputeError {
    #[error("tile {coord} lies outside the {tiles_per_row}x{tiles_per_column} tile grid")]
    TileOutOfBounds {
        coord: TileCoordinate,
        tiles_per_row: u32,
        tiles_per_column: u32,
    },
    #[error("upstream data unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("numeric error in {operation}: {message}")]
    Numeric {
        operation: &'static str,
        message: String,
    },
    #[error("malformed pixel data: {0}")]
    Format(String),
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),
    #[error("tile kernel panicked: {0}")]
    KernelPanicked(String),
}

impl ComputeError {
    /// Errors worth a second attempt by the scheduler.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ComputeError::UpstreamUnavailable(_) | ComputeError::ResourceExhausted(_)
        )
    }
}

pub type ComputeFn = Arc<dyn Fn() -> Result<TileBuffer, ComputeError> + Send + Sync>;

#[derive(Clone)]
pub struct TileJob {
    pub coord: TileCoordinate,
    pub compute: ComputeFn,
}

impl TileJob {
    pub fn new(
        coord: TileCoordinate,
        compute: impl Fn() -> Result<TileBuffer, ComputeError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            coord,
            compute: Arc::new(compute),
        }
    }
}

impl fmt::Debug for TileJob {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TileJob")
            .field("coord", &self.coord)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct TileJobBatch {
    pub priority: JobPriority,
    pub jobs: Vec<TileJob>,
}

/// Completion side of the scheduler seam.
///
/// Workers know nothing about requests; they report through the handle
/// returned by [`TileJobSink::submit`].
pub trait TileComputationListener: Send + Sync {
    fn tile_computed(&self, handle: RequestHandle, coord: TileCoordinate, buffer: &TileBuffer);

    fn tile_failed(&self, handle: RequestHandle, coord: TileCoordinate, error: &ComputeError);

    fn tile_cancelled(&self, handle: RequestHandle, coord: TileCoordinate) {
        let _ = (handle, coord);
    }
}

/// Submission side of the scheduler seam.
pub trait TileJobSink: Send + Sync {
    fn submit(
        &self,
        batch: TileJobBatch,
        listener: Arc<dyn TileComputationListener>,
    ) -> RequestHandle;

    /// Drops not-yet-started jobs of `handle`; `None` cancels the whole batch.
    fn cancel(&self, handle: RequestHandle, coords: Option<&[TileCoordinate]>);
}

assert_impl_all!(TileBuffer: Send, Sync);
assert_impl_all!(TileJob: Send, Sync);
assert_impl_all!(ImageId: Send, Sync, Copy);
