use serde::{Deserialize, Serialize};

use crate::TileCoordinate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    pub fn intersect(&self, other: &PixelRect) -> Option<PixelRect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 as u64 || y1 <= y0 as u64 {
            return None;
        }
        Some(PixelRect {
            x: x0,
            y: y0,
            width: (x1 - x0 as u64) as u32,
            height: (y1 - y0 as u64) as u32,
        })
    }

    /// Grows the rect by `margin` on every side, clipped to `0..bounds`.
    pub fn expand_within(&self, margin: u32, bounds: (u32, u32)) -> PixelRect {
        let x0 = self.x.saturating_sub(margin);
        let y0 = self.y.saturating_sub(margin);
        let x1 = (self.right() + margin as u64).min(bounds.0 as u64);
        let y1 = (self.bottom() + margin as u64).min(bounds.1 as u64);
        PixelRect {
            x: x0,
            y: y0,
            width: x1.saturating_sub(x0 as u64) as u32,
            height: y1.saturating_sub(y0 as u64) as u32,
        }
    }
}

/// Fixed-size tile decomposition of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileGrid {
    width: u32,
    height: u32,
    tile_size: u32,
}

impl TileGrid {
    pub fn new(width: u32, height: u32, tile_size: u32) -> Self {
        assert!(tile_size > 0, "tile_size must be at least 1");
        Self {
            width,
            height,
            tile_size,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn bounds(&self) -> PixelRect {
        PixelRect::new(0, 0, self.width, self.height)
    }

    pub fn tiles_per_row(&self) -> u32 {
        self.width.div_ceil(self.tile_size)
    }

    pub fn tiles_per_column(&self) -> u32 {
        self.height.div_ceil(self.tile_size)
    }

    pub fn tile_count(&self) -> usize {
        self.tiles_per_row() as usize * self.tiles_per_column() as usize
    }

    pub fn contains(&self, coord: TileCoordinate) -> bool {
        coord.tile_x < self.tiles_per_row() && coord.tile_y < self.tiles_per_column()
    }

    /// Pixel rect covered by `coord`; edge tiles are clipped to the image.
    pub fn tile_rect(&self, coord: TileCoordinate) -> Option<PixelRect> {
        if !self.contains(coord) {
            return None;
        }
        let unclipped = PixelRect::new(
            coord.tile_x * self.tile_size,
            coord.tile_y * self.tile_size,
            self.tile_size,
            self.tile_size,
        );
        unclipped.intersect(&self.bounds())
    }

    /// Tiles intersecting `rect`, in row-major order.
    pub fn tiles_in_rect(&self, rect: &PixelRect) -> Vec<TileCoordinate> {
        let Some((x0, y0, x1, y1)) = self.tile_span(rect) else {
            return Vec::new();
        };
        let mut tiles = Vec::with_capacity(((x1 - x0 + 1) * (y1 - y0 + 1)) as usize);
        for tile_y in y0..=y1 {
            for tile_x in x0..=x1 {
                tiles.push(TileCoordinate::new(tile_x, tile_y));
            }
        }
        tiles
    }

    /// Tiles within `rings` tiles of `rect` that do not intersect it.
    pub fn prefetch_ring(&self, rect: &PixelRect, rings: u32) -> Vec<TileCoordinate> {
        let Some((x0, y0, x1, y1)) = self.tile_span(rect) else {
            return Vec::new();
        };
        let outer_x0 = x0.saturating_sub(rings);
        let outer_y0 = y0.saturating_sub(rings);
        let outer_x1 = x1.saturating_add(rings).min(self.tiles_per_row() - 1);
        let outer_y1 = y1.saturating_add(rings).min(self.tiles_per_column() - 1);
        let mut tiles = Vec::new();
        for tile_y in outer_y0..=outer_y1 {
            for tile_x in outer_x0..=outer_x1 {
                let inside = (x0..=x1).contains(&tile_x) && (y0..=y1).contains(&tile_y);
                if !inside {
                    tiles.push(TileCoordinate::new(tile_x, tile_y));
                }
            }
        }
        tiles
    }

    fn tile_span(&self, rect: &PixelRect) -> Option<(u32, u32, u32, u32)> {
        let clipped = rect.intersect(&self.bounds())?;
        let x0 = clipped.x / self.tile_size;
        let y0 = clipped.y / self.tile_size;
        let x1 = ((clipped.right() - 1) / self.tile_size as u64) as u32;
        let y1 = ((clipped.bottom() - 1) / self.tile_size as u64) as u32;
        Some((x0, y0, x1, y1))
    }
}
