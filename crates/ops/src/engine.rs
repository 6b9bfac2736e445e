use tile_protocol::{ComputeError, TileBuffer, TileCoordinate};
use tracing::trace;

use crate::graph::GraphSnapshot;
use crate::mask_cache::{DEFAULT_MASK_CACHE_ENTRIES, MaskCache};
use crate::region::Region;

/// Computes tiles from graph snapshots.
///
/// `compute` depends only on its arguments; the mask cache shortcuts work
/// but never changes results.
#[derive(Debug)]
pub struct TileComputeEngine {
    masks: MaskCache,
}

impl Default for TileComputeEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MASK_CACHE_ENTRIES)
    }
}

impl TileComputeEngine {
    pub fn new(mask_capacity: usize) -> Self {
        Self {
            masks: MaskCache::new(mask_capacity),
        }
    }

    pub fn mask_cache(&self) -> &MaskCache {
        &self.masks
    }

    pub fn compute(
        &self,
        snapshot: &GraphSnapshot,
        coord: TileCoordinate,
    ) -> Result<TileBuffer, ComputeError> {
        let grid = snapshot.grid();
        let tile = grid
            .tile_rect(coord)
            .ok_or(ComputeError::TileOutOfBounds {
                coord,
                tiles_per_row: grid.tiles_per_row(),
                tiles_per_column: grid.tiles_per_column(),
            })?;
        let working = tile.expand_within(snapshot.margin(), (grid.width(), grid.height()));
        let raw = snapshot.source().read_region(working)?;
        let mut region = Region::from_u16(working, &raw)?;

        let mut last = "source";
        for operation in snapshot.operations() {
            operation.apply(&mut region, &self.masks)?;
            last = operation.name();
        }
        trace!(
            image = ?snapshot.image(),
            epoch = snapshot.epoch().0,
            %coord,
            "computed tile"
        );
        region.crop_to_tile(tile, last)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use slotmap::SlotMap;
    use tile_protocol::{Epoch, ImageId, PixelRect};

    use super::*;
    use crate::graph::OperationGraph;
    use crate::kind::{
        ColorBalanceParams, NoiseReductionParams, OperationKind, ToneMapperParams, VibranceParams,
    };
    use crate::source::{MemoryRaster, RasterSource};

    fn image_id() -> ImageId {
        let mut images: SlotMap<ImageId, ()> = SlotMap::with_key();
        images.insert(())
    }

    fn gradient(width: u32, height: u32) -> Arc<MemoryRaster> {
        Arc::new(MemoryRaster::from_fn(width, height, |x, y| {
            let noise = (x * 7919 + y * 104729) % 97 * 40;
            [
                (x * 900 + noise) as u16,
                (y * 1100) as u16,
                (40000 - x * 300 - y * 200) as u16,
            ]
        }))
    }

    fn chain(graph: &mut OperationGraph) {
        graph.add(OperationKind::NoiseReduction(NoiseReductionParams { level: 2 }));
        graph.add(OperationKind::ToneMapper(ToneMapperParams {
            depth: 8.0,
            ..ToneMapperParams::default()
        }));
        graph.add(OperationKind::ColorBalance(ColorBalanceParams {
            red: 2.0,
            ..ColorBalanceParams::default()
        }));
        graph.add(OperationKind::Vibrance(VibranceParams { amount: 40.0 }));
    }

    #[test]
    fn tile_outside_grid_is_rejected() {
        let mut graph = OperationGraph::new(gradient(20, 20), 8);
        let snapshot = graph.snapshot(image_id(), Epoch(0));
        let error = TileComputeEngine::default()
            .compute(&snapshot, TileCoordinate::new(3, 0))
            .unwrap_err();
        assert!(matches!(
            error,
            ComputeError::TileOutOfBounds {
                tiles_per_row: 3,
                tiles_per_column: 3,
                ..
            }
        ));
    }

    #[test]
    fn empty_chain_copies_source_pixels() {
        let source = gradient(20, 12);
        let mut graph = OperationGraph::new(source.clone(), 8);
        let snapshot = graph.snapshot(image_id(), Epoch(0));
        let tile = TileComputeEngine::default()
            .compute(&snapshot, TileCoordinate::new(2, 1))
            .expect("tile");
        assert_eq!((tile.width(), tile.height()), (4, 4));
        let expected = source.read_region(PixelRect::new(16, 8, 4, 4)).expect("read");
        assert_eq!(tile.samples(), expected.as_slice());
    }

    #[test]
    fn recompute_is_identical() {
        let mut graph = OperationGraph::new(gradient(48, 40), 16);
        chain(&mut graph);
        let snapshot = graph.snapshot(image_id(), Epoch(1));
        let engine = TileComputeEngine::default();
        let first = engine.compute(&snapshot, TileCoordinate::new(1, 1)).expect("first");
        engine.mask_cache().invalidate_all();
        let second = engine.compute(&snapshot, TileCoordinate::new(1, 1)).expect("second");
        assert_eq!(first.samples(), second.samples());
        assert!(!first.shares_storage(&second));
    }

    #[test]
    fn tiles_agree_with_whole_image_at_seams() {
        let source = gradient(48, 40);
        let image = image_id();
        let mut tiled = OperationGraph::new(source.clone(), 16);
        let mut whole = OperationGraph::new(source, 64);
        chain(&mut tiled);
        chain(&mut whole);
        let engine = TileComputeEngine::default();
        let full = engine
            .compute(&whole.snapshot(image, Epoch(0)), TileCoordinate::new(0, 0))
            .expect("full");
        let tiled = tiled.snapshot(image, Epoch(0));

        for coord in tiled.grid().tiles_in_rect(&tiled.grid().bounds()) {
            let tile = engine.compute(&tiled, coord).expect("tile");
            let rect = tiled.grid().tile_rect(coord).expect("rect");
            for y in 0..rect.height {
                for x in 0..rect.width {
                    let alone = tile.sample(x, y).expect("tile sample");
                    let within = full.sample(rect.x + x, rect.y + y).expect("full sample");
                    for (a, b) in alone.iter().zip(within) {
                        assert!(a.abs_diff(b) <= 1, "{coord} at ({x}, {y}): {a} vs {b}");
                    }
                }
            }
        }
    }

    struct Unreadable;

    impl RasterSource for Unreadable {
        fn bounds(&self) -> (u32, u32) {
            (32, 32)
        }

        fn read_region(&self, _: PixelRect) -> Result<Vec<u16>, ComputeError> {
            Err(ComputeError::UpstreamUnavailable("decoder closed".to_owned()))
        }
    }

    #[test]
    fn upstream_failure_is_reported() {
        let mut graph = OperationGraph::new(Arc::new(Unreadable), 16);
        let snapshot = graph.snapshot(image_id(), Epoch(0));
        let error = TileComputeEngine::default()
            .compute(&snapshot, TileCoordinate::new(0, 0))
            .unwrap_err();
        assert!(error.is_transient());
    }
}
