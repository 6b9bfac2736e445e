use std::sync::Arc;

use tile_protocol::{CHANNELS, ComputeError, PixelRect};

/// Decoded pixels of an image, as produced by the file decoders.
///
/// Implementations must be safe to read concurrently from worker threads.
pub trait RasterSource: Send + Sync {
    fn bounds(&self) -> (u32, u32);

    /// Interleaved RGB16 samples of `rect`, row-major, `rect` fully inside
    /// [`RasterSource::bounds`].
    fn read_region(&self, rect: PixelRect) -> Result<Vec<u16>, ComputeError>;
}

#[derive(Debug, Clone)]
pub struct MemoryRaster {
    width: u32,
    height: u32,
    samples: Arc<[u16]>,
}

impl MemoryRaster {
    pub fn new(width: u32, height: u32, samples: Vec<u16>) -> Result<Self, ComputeError> {
        let expected = width as usize * height as usize * CHANNELS;
        if samples.len() != expected {
            return Err(ComputeError::Format(format!(
                "raster {width}x{height} expects {expected} samples, got {}",
                samples.len()
            )));
        }
        Ok(Self {
            width,
            height,
            samples: samples.into(),
        })
    }

    pub fn from_fn(width: u32, height: u32, mut pixel: impl FnMut(u32, u32) -> [u16; 3]) -> Self {
        let mut samples = Vec::with_capacity(width as usize * height as usize * CHANNELS);
        for y in 0..height {
            for x in 0..width {
                samples.extend_from_slice(&pixel(x, y));
            }
        }
        Self {
            width,
            height,
            samples: samples.into(),
        }
    }
}

impl RasterSource for MemoryRaster {
    fn bounds(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn read_region(&self, rect: PixelRect) -> Result<Vec<u16>, ComputeError> {
        if rect.right() > self.width as u64 || rect.bottom() > self.height as u64 {
            return Err(ComputeError::UpstreamUnavailable(format!(
                "region {rect:?} outside raster {}x{}",
                self.width, self.height
            )));
        }
        let row_len = rect.width as usize * CHANNELS;
        let mut out = Vec::with_capacity(row_len * rect.height as usize);
        for y in rect.y..rect.y + rect.height {
            let start = (y as usize * self.width as usize + rect.x as usize) * CHANNELS;
            out.extend_from_slice(&self.samples[start..start + row_len]);
        }
        Ok(out)
    }
}
