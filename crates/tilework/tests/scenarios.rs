use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use ops::{
    MemoryRaster, OperationKind, RasterSource, ToneMapperParams, VibranceParams,
};
use request_tracker::{PaintContext, QueueMode, TileHandler, TrackerConfig};
use tile_protocol::{ComputeError, Epoch, PixelRect, TileCoordinate};
use tilework::{EditingSession, SessionConfig};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Painted {
        coord: TileCoordinate,
        epoch: Epoch,
        prefetch: bool,
    },
    Failed(TileCoordinate, ComputeError),
}

struct Recorder {
    events: Sender<Event>,
}

impl TileHandler for Recorder {
    fn handle(&self, tile_x: u32, tile_y: u32, context: &PaintContext<'_>) {
        let _ = self.events.send(Event::Painted {
            coord: TileCoordinate::new(tile_x, tile_y),
            epoch: context.epoch(),
            prefetch: context.is_prefetch(),
        });
    }

    fn failed(&self, tile_x: u32, tile_y: u32, _: &PaintContext<'_>, error: &ComputeError) {
        let _ = self
            .events
            .send(Event::Failed(TileCoordinate::new(tile_x, tile_y), error.clone()));
    }
}

fn recorder() -> (Arc<Recorder>, Receiver<Event>) {
    let (events, received) = unbounded();
    (Arc::new(Recorder { events }), received)
}

fn collect(received: &Receiver<Event>, count: usize) -> Vec<Event> {
    (0..count)
        .map(|_| received.recv_timeout(WAIT).expect("event in time"))
        .collect()
}

fn painted_tiles(events: &[Event]) -> Vec<TileCoordinate> {
    let mut tiles: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Event::Painted { coord, .. } => Some(*coord),
            Event::Failed(..) => None,
        })
        .collect();
    tiles.sort_unstable();
    tiles
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::yield_now();
    }
}

fn tiles(raw: &[(u32, u32)]) -> Vec<TileCoordinate> {
    raw.iter().copied().map(TileCoordinate::from).collect()
}

fn session(workers: usize) -> EditingSession {
    let mut config = SessionConfig {
        tile_size: 16,
        tracker: TrackerConfig {
            synchronous_timeout_ms: WAIT.as_millis() as u64,
            ..TrackerConfig::default()
        },
        ..SessionConfig::default()
    };
    config.scheduler.worker_count = workers;
    config.scheduler.max_attempts = 1;
    EditingSession::new(config).expect("session")
}

fn gradient() -> MemoryRaster {
    MemoryRaster::from_fn(64, 64, |x, y| {
        [(x * 900) as u16, (y * 900) as u16, ((x + y) * 400) as u16]
    })
}

/// Blocks its first read until released.
struct GatedRaster {
    inner: MemoryRaster,
    armed: AtomicBool,
    started: Sender<()>,
    gate: Receiver<()>,
}

impl RasterSource for GatedRaster {
    fn bounds(&self) -> (u32, u32) {
        self.inner.bounds()
    }

    fn read_region(&self, rect: PixelRect) -> Result<Vec<u16>, ComputeError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            let _ = self.started.try_send(());
            let _ = self.gate.recv();
        }
        self.inner.read_region(rect)
    }
}

fn gated_gradient() -> (Arc<dyn RasterSource>, Sender<()>, Receiver<()>) {
    let (release, gate) = bounded(0);
    let (started, started_rx) = bounded(1);
    let source = GatedRaster {
        inner: gradient(),
        armed: AtomicBool::new(true),
        started,
        gate,
    };
    (Arc::new(source), release, started_rx)
}

struct CorruptRaster;

impl RasterSource for CorruptRaster {
    fn bounds(&self) -> (u32, u32) {
        (32, 32)
    }

    fn read_region(&self, _: PixelRect) -> Result<Vec<u16>, ComputeError> {
        Err(ComputeError::Format("corrupt strip".to_owned()))
    }
}

#[test]
fn synchronous_paint_delivers_every_tile_before_returning() {
    let session = session(2);
    let image = session.open_image(Arc::new(gradient()));
    let (handler, received) = recorder();

    let accepted = session
        .queue_tiles(
            image,
            &tiles(&[(0, 0), (0, 1), (1, 0)]),
            QueueMode::Synchronous,
            handler,
        )
        .expect("queue");

    assert_eq!(accepted, 3);
    let events: Vec<Event> = received.try_iter().collect();
    assert_eq!(painted_tiles(&events), tiles(&[(0, 0), (0, 1), (1, 0)]));
    assert!(events.iter().all(|event| matches!(
        event,
        Event::Painted { epoch: Epoch(0), prefetch: false, .. }
    )));
    assert_eq!(session.pending_tiles(image, Epoch(0)), 0);
    let cached = session
        .cached_tile(image, TileCoordinate::new(0, 1))
        .expect("image")
        .expect("cached");
    assert_eq!((cached.width(), cached.height()), (16, 16));
    assert_eq!(cached.sample(0, 0), Some([0, 14400, 6400]));
}

#[test]
fn prefetch_is_replaced_by_synchronous_paint() {
    let session = session(1);
    let (source, release, started) = gated_gradient();
    let image = session.open_image(source);
    let (blocker, blocked) = recorder();
    let (handler, received) = recorder();

    session
        .queue_tiles(image, &tiles(&[(0, 0)]), QueueMode::Asynchronous, blocker)
        .expect("queue blocker");
    started.recv_timeout(WAIT).expect("worker busy");
    let prefetched = session
        .queue_tiles(
            image,
            &tiles(&[(2, 2)]),
            QueueMode::Prefetch,
            handler.clone(),
        )
        .expect("queue prefetch");
    assert_eq!(prefetched, 1);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            wait_until(|| session.scheduler_stats().submitted == 4);
            release.send(()).expect("release worker");
        });
        let accepted = session
            .queue_tiles(
                image,
                &tiles(&[(2, 2), (3, 3)]),
                QueueMode::Synchronous,
                handler,
            )
            .expect("queue paint");
        assert_eq!(accepted, 2);
    });

    let events: Vec<Event> = received.try_iter().collect();
    assert_eq!(painted_tiles(&events), tiles(&[(2, 2), (3, 3)]));
    assert!(events.iter().all(|event| matches!(
        event,
        Event::Painted { prefetch: false, .. }
    )));
    wait_until(|| session.scheduler_stats().cancelled == 1);
    assert_eq!(session.scheduler_stats().submitted, 4);
    assert!(received.try_recv().is_err());
    assert_eq!(painted_tiles(&collect(&blocked, 1)), tiles(&[(0, 0)]));
}

#[test]
fn edit_cancels_requests_of_the_superseded_epoch() {
    let session = session(1);
    let (source, release, started) = gated_gradient();
    let image = session.open_image(source);
    let (stale, stale_events) = recorder();

    session
        .queue_tiles(image, &tiles(&[(0, 0)]), QueueMode::Asynchronous, stale)
        .expect("queue");
    started.recv_timeout(WAIT).expect("tile running");
    session
        .add_operation(
            image,
            OperationKind::Vibrance(VibranceParams { amount: 25.0 }),
        )
        .expect("edit");
    assert_eq!(session.epoch(image).expect("epoch"), Epoch(1));
    assert_eq!(session.pending_tiles(image, Epoch(0)), 0);
    release.send(()).expect("release worker");

    let (fresh, fresh_events) = recorder();
    session
        .queue_tiles(image, &tiles(&[(0, 0)]), QueueMode::Synchronous, fresh)
        .expect("queue fresh");

    assert_eq!(
        fresh_events.try_recv().ok(),
        Some(Event::Painted {
            coord: TileCoordinate::new(0, 0),
            epoch: Epoch(1),
            prefetch: false,
        })
    );
    assert!(stale_events.try_recv().is_err());
    // The superseded result was computed but never stored.
    let stats = session.store_stats();
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.entries, 1);
}

#[test]
fn evicted_tile_recomputes_identically() {
    let session = session(2);
    let image = session.open_image(Arc::new(gradient()));
    session
        .add_operation(image, OperationKind::ToneMapper(ToneMapperParams::default()))
        .expect("tone mapper");
    session
        .add_operation(image, OperationKind::Vibrance(VibranceParams { amount: 40.0 }))
        .expect("vibrance");
    let coord = TileCoordinate::new(1, 1);
    let (handler, _received) = recorder();

    session
        .queue_tiles(image, &[coord], QueueMode::Synchronous, handler.clone())
        .expect("first paint");
    let first = session
        .cached_tile(image, coord)
        .expect("image")
        .expect("cached");

    assert!(session.evict_cached_tiles(image).expect("evict") > 0);
    assert!(session.cached_tile(image, coord).expect("image").is_none());

    session
        .queue_tiles(image, &[coord], QueueMode::Synchronous, handler)
        .expect("second paint");
    let second = session
        .cached_tile(image, coord)
        .expect("image")
        .expect("cached");
    assert_eq!(first, second);
    assert!(!first.shares_storage(&second));
}

#[test]
fn viewport_paints_visible_tiles_then_prefetches_the_ring() {
    let session = session(2);
    let image = session.open_image(Arc::new(gradient()));
    let (handler, received) = recorder();

    let painted = session
        .queue_viewport(image, PixelRect::new(16, 16, 16, 16), handler)
        .expect("viewport");
    assert_eq!(painted, 1);

    let events = collect(&received, 9);
    assert_eq!(
        events[0],
        Event::Painted {
            coord: TileCoordinate::new(1, 1),
            epoch: Epoch(0),
            prefetch: false,
        }
    );
    assert!(events[1..].iter().all(|event| matches!(
        event,
        Event::Painted { prefetch: true, .. }
    )));
    assert_eq!(
        painted_tiles(&events[1..]),
        tiles(&[
            (0, 0),
            (0, 1),
            (0, 2),
            (1, 0),
            (1, 2),
            (2, 0),
            (2, 1),
            (2, 2)
        ])
    );
}

#[test]
fn failed_tile_is_reported_and_stays_pending() {
    let session = session(1);
    let image = session.open_image(Arc::new(CorruptRaster));
    let (handler, received) = recorder();

    session
        .queue_tiles(image, &tiles(&[(1, 1)]), QueueMode::Asynchronous, handler)
        .expect("queue");

    let error = ComputeError::Format("corrupt strip".to_owned());
    assert_eq!(
        collect(&received, 1),
        vec![Event::Failed(TileCoordinate::new(1, 1), error.clone())]
    );
    assert_eq!(session.pending_tiles(image, Epoch(0)), 1);
    let failures = session.recent_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].coord, TileCoordinate::new(1, 1));
    assert_eq!(failures[0].error, error);

    assert_eq!(session.cancel_tiles(image, Epoch(0)), 1);
    assert_eq!(session.pending_tiles(image, Epoch(0)), 0);
}

#[test]
fn tiles_outside_the_image_are_ignored() {
    let session = session(1);
    let image = session.open_image(Arc::new(gradient()));
    let (handler, received) = recorder();

    let accepted = session
        .queue_tiles(
            image,
            &tiles(&[(3, 3), (4, 0), (0, 9)]),
            QueueMode::Synchronous,
            handler,
        )
        .expect("queue");

    assert_eq!(accepted, 1);
    assert_eq!(painted_tiles(&received.try_iter().collect::<Vec<_>>()), tiles(&[(3, 3)]));
}

#[test]
fn closing_an_image_drops_its_requests_and_tiles() {
    let session = session(1);
    let (source, release, started) = gated_gradient();
    let image = session.open_image(source);
    let (handler, received) = recorder();

    session
        .queue_tiles(
            image,
            &tiles(&[(0, 0), (1, 0)]),
            QueueMode::Asynchronous,
            handler,
        )
        .expect("queue");
    started.recv_timeout(WAIT).expect("tile running");
    session.close_image(image).expect("close");
    release.send(()).expect("release worker");

    wait_until(|| {
        let stats = session.scheduler_stats();
        stats.completed + stats.cancelled == 2
    });
    assert!(received.try_recv().is_err());
    assert_eq!(session.store_stats().entries, 0);
    assert_eq!(session.pending_tiles(image, Epoch(0)), 0);
}
