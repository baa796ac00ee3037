//! Composite gestures that need iterative probing
//!
//! Each gesture moves through `Idle -> Attempting -> Succeeded | Failed`.
//! Termination is decided by comparing visual snapshots of the element.

use crate::host::{DragPath, ElementHandle, Host};
use std::fmt;
use std::time::Duration;
use synctap_common::{
    Error, NormalizedPoint, Rect, Result, ScrollDirection, ScrollEdge, Snapshot, Speed,
};
use tracing::{debug, info, warn};

/// Press duration before an edge swipe starts moving
const EDGE_SWIPE_PRESS: Duration = Duration::from_millis(50);

/// Default hold before releasing a long-press drag
pub const DEFAULT_DRAG_HOLD: Duration = Duration::from_millis(1000);

/// Progress of a gesture
#[derive(Debug, Clone, PartialEq)]
pub enum GesturePhase {
    Idle,
    Attempting { swipes: u32 },
    Succeeded { swipes: u32 },
    Failed(String),
}

impl fmt::Display for GesturePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GesturePhase::Idle => write!(f, "idle"),
            GesturePhase::Attempting { swipes } => write!(f, "attempting ({} swipes)", swipes),
            GesturePhase::Succeeded { swipes } => write!(f, "succeeded after {} swipes", swipes),
            GesturePhase::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Element a gesture acts on, with the facts needed for error context
#[derive(Debug, Clone)]
pub struct GestureTarget {
    pub handle: ElementHandle,
    pub identifier: String,
    pub frame: Rect,
}

impl GestureTarget {
    /// Read the current frame of a resolved element
    pub fn new<H: Host + ?Sized>(host: &H, handle: ElementHandle, identifier: &str) -> Self {
        let frame = host
            .properties(handle)
            .map(|props| props.frame)
            .unwrap_or_else(Rect::unconstrained);

        Self {
            handle,
            identifier: identifier.to_string(),
            frame,
        }
    }

    fn not_scrollable(&self) -> Error {
        Error::ElementNotScrollable {
            identifier: self.identifier.clone(),
            frame: self.frame,
        }
    }
}

/// Normalized end point of a swipe that drags content towards `edge`
fn edge_target(edge: ScrollEdge, start: NormalizedPoint) -> NormalizedPoint {
    match edge {
        ScrollEdge::Bottom => NormalizedPoint::new(start.x, 0.0),
        ScrollEdge::Top => NormalizedPoint::new(start.x, 1.0),
        ScrollEdge::Right => NormalizedPoint::new(0.0, start.y),
        ScrollEdge::Left => NormalizedPoint::new(1.0, start.y),
    }
}

/// Iterative swipe towards one edge of a scrollable element
pub struct ScrollToEdge<'a, H: Host + ?Sized> {
    host: &'a H,
    target: GestureTarget,
    edge: ScrollEdge,
    start: NormalizedPoint,
    max_swipes: u32,
    phase: GesturePhase,
}

impl<'a, H: Host + ?Sized> ScrollToEdge<'a, H> {
    pub fn new(
        host: &'a H,
        target: GestureTarget,
        edge: ScrollEdge,
        start: NormalizedPoint,
        max_swipes: u32,
    ) -> Self {
        Self {
            host,
            target,
            edge,
            start: start.or(NormalizedPoint::CENTER),
            max_swipes,
            phase: GesturePhase::Idle,
        }
    }

    pub fn phase(&self) -> &GesturePhase {
        &self.phase
    }

    fn swipe_path(&self) -> DragPath {
        let frame = self.target.frame;
        DragPath {
            from: frame.point_at(self.start),
            to: frame.point_at(edge_target(self.edge, self.start)),
            press: EDGE_SWIPE_PRESS,
            velocity: Speed::Fast.velocity(),
            hold: Duration::ZERO,
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot::of(&self.host.snapshot(self.target.handle))
    }

    fn fail(&mut self, error: Error) -> Result<u32> {
        warn!("Scroll to {} edge of `{}` failed: {}", self.edge, self.target.identifier, error);
        self.phase = GesturePhase::Failed(error.to_string());
        Err(error)
    }

    /// Swipe until two consecutive snapshots match; returns the swipe count
    pub fn run(&mut self) -> Result<u32> {
        if !self.host.is_hittable(self.target.handle) {
            let error = self.target.not_scrollable();
            return self.fail(error);
        }

        let path = self.swipe_path();
        let mut last = self.snapshot();

        for swipe in 1..=self.max_swipes {
            self.phase = GesturePhase::Attempting { swipes: swipe };
            debug!(
                "Swipe #{} towards {} edge of `{}`",
                swipe, self.edge, self.target.identifier
            );

            self.host.press_and_drag(path);
            let current = self.snapshot();
            debug!("Snapshot after swipe #{}: {}", swipe, current);

            if current == last {
                if swipe == 1 {
                    let error = self.target.not_scrollable();
                    return self.fail(error);
                }

                self.phase = GesturePhase::Succeeded { swipes: swipe };
                info!(
                    "Reached {} edge of `{}` after {} swipes",
                    self.edge, self.target.identifier, swipe
                );
                return Ok(swipe);
            }

            last = current;
        }

        let error = Error::ScrollEdgeNotReached {
            identifier: self.target.identifier.clone(),
            edge: self.edge.to_string(),
            swipes: self.max_swipes,
        };
        self.fail(error)
    }
}

/// One slow swipe moving content by `offset` points in `direction`
pub fn scroll_by_offset<H: Host + ?Sized>(
    host: &H,
    target: &GestureTarget,
    direction: ScrollDirection,
    offset: f64,
    start: NormalizedPoint,
) -> Result<()> {
    if !host.is_hittable(target.handle) {
        return Err(target.not_scrollable());
    }

    let swipe = direction.swipe_direction();
    let screen = host.screen_size();
    let extent = if swipe.is_vertical() {
        screen.height
    } else {
        screen.width
    };
    let magnitude = if extent > 0.0 {
        (offset / extent).min(1.0)
    } else {
        0.0
    };

    let start = start.or(NormalizedPoint::CENTER);
    let (dx, dy) = swipe.unit();
    let end = NormalizedPoint::new(start.x + dx * magnitude, start.y + dy * magnitude);

    let before = Snapshot::of(&host.snapshot(target.handle));
    debug!(
        "Scrolling `{}` {:?} by {} ({:.3} of screen)",
        target.identifier, direction, offset, magnitude
    );

    host.press_and_drag(DragPath {
        from: target.frame.point_at(start),
        to: target.frame.point_at(end),
        press: EDGE_SWIPE_PRESS,
        velocity: Speed::Slow.velocity(),
        hold: Duration::ZERO,
    });

    let after = Snapshot::of(&host.snapshot(target.handle));
    if before == after {
        return Err(target.not_scrollable());
    }
    Ok(())
}

/// Long-press on the source element and drag to a point on the target
#[derive(Debug, Clone)]
pub struct LongPressDrag {
    pub start: NormalizedPoint,
    pub end: NormalizedPoint,
    pub duration: Duration,
    pub speed: Speed,
    pub hold: Duration,
}

impl LongPressDrag {
    pub fn perform<H: Host + ?Sized>(
        &self,
        host: &H,
        source: &GestureTarget,
        target: &GestureTarget,
    ) -> Result<()> {
        if !host.is_hittable(source.handle) {
            return Err(Error::ElementNotHittable {
                identifier: source.identifier.clone(),
                frame: source.frame,
            });
        }

        let path = DragPath {
            from: source.frame.point_at(self.start.or(NormalizedPoint::CENTER)),
            to: target.frame.point_at(self.end.or(NormalizedPoint::CENTER)),
            press: self.duration,
            velocity: self.speed.velocity(),
            hold: self.hold,
        };

        debug!(
            "Long press `{}` for {:?}, drag to `{}` at {:?}",
            source.identifier, self.duration, target.identifier, self.speed
        );
        host.press_and_drag(path);
        Ok(())
    }
}
