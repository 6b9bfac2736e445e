use tile_protocol::{CHANNELS, ComputeError, PixelRect, TileBuffer};

pub(crate) const SAMPLE_MAX: f32 = 65535.0;

/// Floating point working copy of a pixel rect, interleaved RGB.
#[derive(Debug, Clone)]
pub(crate) struct Region {
    pub rect: PixelRect,
    pub samples: Vec<f32>,
}

impl Region {
    pub fn from_u16(rect: PixelRect, raw: &[u16]) -> Result<Self, ComputeError> {
        let expected = rect.width as usize * rect.height as usize * CHANNELS;
        if raw.len() != expected {
            return Err(ComputeError::Format(format!(
                "upstream region {rect:?} delivered {} samples, expected {expected}",
                raw.len()
            )));
        }
        Ok(Self {
            rect,
            samples: raw.iter().map(|sample| *sample as f32).collect(),
        })
    }

    pub fn width(&self) -> usize {
        self.rect.width as usize
    }

    pub fn height(&self) -> usize {
        self.rect.height as usize
    }

    pub fn pixels(&self) -> impl Iterator<Item = &[f32]> {
        self.samples.chunks_exact(CHANNELS)
    }

    pub fn pixels_mut(&mut self) -> impl Iterator<Item = &mut [f32]> {
        self.samples.chunks_exact_mut(CHANNELS)
    }

    /// Quantizes the part of the region covered by `target`.
    pub fn crop_to_tile(&self, target: PixelRect, operation: &'static str) -> Result<TileBuffer, ComputeError> {
        let offset_x = (target.x - self.rect.x) as usize;
        let offset_y = (target.y - self.rect.y) as usize;
        let mut out = Vec::with_capacity(target.width as usize * target.height as usize * CHANNELS);
        for row in 0..target.height as usize {
            let start = ((offset_y + row) * self.width() + offset_x) * CHANNELS;
            let end = start + target.width as usize * CHANNELS;
            for value in &self.samples[start..end] {
                if !value.is_finite() {
                    return Err(ComputeError::Numeric {
                        operation,
                        message: format!("non-finite sample {value} in tile output"),
                    });
                }
                out.push(value.round().clamp(0.0, SAMPLE_MAX) as u16);
            }
        }
        TileBuffer::from_samples(target.width, target.height, out)
    }
}

/// Single-channel plane with clamped (border copy) addressing.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Plane {
    pub width: usize,
    pub height: usize,
    pub values: Vec<f32>,
}

impl Plane {
    pub fn at(&self, x: isize, y: isize) -> f32 {
        let x = x.clamp(0, self.width as isize - 1) as usize;
        let y = y.clamp(0, self.height as isize - 1) as usize;
        self.values[y * self.width + x]
    }

    /// Separable gaussian blur with kernel radius `ceil(3 * sigma)`.
    pub fn gaussian_blur(&self, sigma: f32) -> Plane {
        if sigma <= 0.0 || self.values.is_empty() {
            return self.clone();
        }
        let radius = (sigma * 3.0).ceil() as isize;
        let weights: Vec<f32> = (-radius..=radius)
            .map(|offset| (-(offset * offset) as f32 / (2.0 * sigma * sigma)).exp())
            .collect();
        let total: f32 = weights.iter().sum();
        let weights: Vec<f32> = weights.into_iter().map(|weight| weight / total).collect();

        let mut horizontal = vec![0.0; self.values.len()];
        for y in 0..self.height {
            for x in 0..self.width {
                horizontal[y * self.width + x] = weights
                    .iter()
                    .enumerate()
                    .map(|(index, weight)| {
                        weight * self.at(x as isize + index as isize - radius, y as isize)
                    })
                    .sum();
            }
        }
        let horizontal = Plane {
            width: self.width,
            height: self.height,
            values: horizontal,
        };
        let mut vertical = vec![0.0; self.values.len()];
        for y in 0..self.height {
            for x in 0..self.width {
                vertical[y * self.width + x] = weights
                    .iter()
                    .enumerate()
                    .map(|(index, weight)| {
                        weight * horizontal.at(x as isize, y as isize + index as isize - radius)
                    })
                    .sum();
            }
        }
        Plane {
            width: self.width,
            height: self.height,
            values: vertical,
        }
    }
}
