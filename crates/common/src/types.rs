//! Core types for synctap

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::Error;

// ============================================================================
// Geometry
// ============================================================================

/// Point in screen coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Size in screen points
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// Axis-aligned rectangle in screen coordinates.
///
/// A NaN component marks the axis it belongs to as unconstrained. Hint frames
/// sent by the driver use this to say "any position along this axis".
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A frame with every axis unconstrained
    pub const fn unconstrained() -> Self {
        Self::new(f64::NAN, f64::NAN, f64::NAN, f64::NAN)
    }

    /// Build from `[x, y, width, height]`, where `None` stands for NaN
    pub fn from_components(components: &[Option<f64>]) -> Option<Self> {
        match components {
            [x, y, w, h] => Some(Self::new(
                x.unwrap_or(f64::NAN),
                y.unwrap_or(f64::NAN),
                w.unwrap_or(f64::NAN),
                h.unwrap_or(f64::NAN),
            )),
            _ => None,
        }
    }

    /// `[x, y, width, height]` as sent on the wire
    pub fn components(&self) -> [f64; 4] {
        [self.x, self.y, self.width, self.height]
    }

    pub fn min_x(&self) -> f64 {
        self.x
    }

    pub fn max_x(&self) -> f64 {
        self.x + self.width
    }

    pub fn min_y(&self) -> f64 {
        self.y
    }

    pub fn max_y(&self) -> f64 {
        self.y + self.height
    }

    /// Area, zero for empty or non-finite rectangles
    pub fn area(&self) -> f64 {
        if !self.is_finite() || self.width <= 0.0 || self.height <= 0.0 {
            return 0.0;
        }
        self.width * self.height
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.width.is_finite() && self.height.is_finite()
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.min_x()
            && point.x <= self.max_x()
            && point.y >= self.min_y()
            && point.y <= self.max_y()
    }

    /// Overlapping region, `None` when the rectangles only touch or are apart
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let min_x = self.min_x().max(other.min_x());
        let max_x = self.max_x().min(other.max_x());
        let min_y = self.min_y().max(other.min_y());
        let max_y = self.max_y().min(other.max_y());

        if max_x > min_x && max_y > min_y {
            Some(Rect::new(min_x, min_y, max_x - min_x, max_y - min_y))
        } else {
            None
        }
    }

    /// Overlap area divided by the average area of both rectangles
    pub fn intersection_ratio(&self, other: &Rect) -> f64 {
        let Some(overlap) = self.intersection(other) else {
            return 0.0;
        };

        let average = (self.area() + other.area()) / 2.0;
        if average <= 0.0 {
            return 0.0;
        }

        overlap.area() / average
    }

    /// Replace unconstrained axes with the extent of `reference` on that axis
    pub fn constrained_to(&self, reference: &Rect) -> Rect {
        let mut rect = *self;

        if rect.x.is_nan() || rect.width.is_nan() {
            rect.x = reference.x;
            rect.width = reference.width;
        }

        if rect.y.is_nan() || rect.height.is_nan() {
            rect.y = reference.y;
            rect.height = reference.height;
        }

        rect
    }

    /// Screen point at a normalized offset within this rectangle
    pub fn point_at(&self, offset: NormalizedPoint) -> Point {
        Point::new(
            self.x + self.width * offset.x,
            self.y + self.height * offset.y,
        )
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{{{}, {}}}, {{{}, {}}}}}",
            self.x, self.y, self.width, self.height
        )
    }
}

/// Offset inside an element, each axis in `0.0..=1.0`
///
/// NaN means "not specified", which resolves to the centre of the axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPoint {
    pub x: f64,
    pub y: f64,
}

impl NormalizedPoint {
    pub const CENTER: NormalizedPoint = NormalizedPoint { x: 0.5, y: 0.5 };

    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn from_options(x: Option<f64>, y: Option<f64>) -> Self {
        Self::new(x.unwrap_or(f64::NAN), y.unwrap_or(f64::NAN))
    }

    /// Fill unspecified axes from `fallback`
    pub fn or(self, fallback: NormalizedPoint) -> Self {
        Self {
            x: if self.x.is_nan() { fallback.x } else { self.x },
            y: if self.y.is_nan() { fallback.y } else { self.y },
        }
    }
}

impl Default for NormalizedPoint {
    fn default() -> Self {
        Self::new(f64::NAN, f64::NAN)
    }
}

// ============================================================================
// Element description
// ============================================================================

/// What the driver knows about an element it wants to act on
#[derive(Debug, Clone, PartialEq)]
pub struct ElementDescriptor {
    pub identifier: String,
    pub hint_frame: Rect,
}

impl ElementDescriptor {
    pub fn new(identifier: impl Into<String>, hint_frame: Rect) -> Self {
        Self {
            identifier: identifier.into(),
            hint_frame,
        }
    }
}

impl fmt::Display for ElementDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` at {}", self.identifier, self.hint_frame)
    }
}

/// Accessibility trait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccessibilityTrait {
    None,
    Button,
    Link,
    Image,
    SearchField,
    KeyboardKey,
    StaticText,
    Header,
    TabBar,
    SummaryElement,
    Selected,
    NotEnabled,
    Adjustable,
    AllowsDirectInteraction,
    UpdatesFrequently,
    CausesPageTurn,
    PlaysSound,
    StartsMediaSession,
}

impl FromStr for AccessibilityTrait {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(|_| {
            Error::InvalidParameterType {
                action: "findElementsByTraits".to_string(),
                reason: format!("unknown accessibility trait `{}`", s),
            }
        })
    }
}

// ============================================================================
// Gestures
// ============================================================================

/// Edge a scroll-to-edge action travels towards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollEdge {
    Top,
    Bottom,
    Left,
    Right,
}

impl fmt::Display for ScrollEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScrollEdge::Top => write!(f, "top"),
            ScrollEdge::Bottom => write!(f, "bottom"),
            ScrollEdge::Left => write!(f, "left"),
            ScrollEdge::Right => write!(f, "right"),
        }
    }
}

/// Direction the content should move into view from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    /// Finger movement that scrolls content in this direction
    pub fn swipe_direction(self) -> SwipeDirection {
        match self {
            ScrollDirection::Up => SwipeDirection::Down,
            ScrollDirection::Down => SwipeDirection::Up,
            ScrollDirection::Left => SwipeDirection::Right,
            ScrollDirection::Right => SwipeDirection::Left,
        }
    }
}

/// Direction of finger movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwipeDirection {
    Up,
    Down,
    Left,
    Right,
}

impl SwipeDirection {
    pub fn is_vertical(self) -> bool {
        matches!(self, SwipeDirection::Up | SwipeDirection::Down)
    }

    /// Unit vector in screen coordinates (y grows downwards)
    pub fn unit(self) -> (f64, f64) {
        match self {
            SwipeDirection::Up => (0.0, -1.0),
            SwipeDirection::Down => (0.0, 1.0),
            SwipeDirection::Left => (-1.0, 0.0),
            SwipeDirection::Right => (1.0, 0.0),
        }
    }
}

/// Velocity tier for drag gestures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speed {
    Slow,
    Fast,
}

impl Speed {
    /// Numeric velocity handed to the host gesture primitive
    pub fn velocity(self) -> f64 {
        match self {
            Speed::Slow => 0.1,
            Speed::Fast => 0.5,
        }
    }
}

impl Default for Speed {
    fn default() -> Self {
        Self::Fast
    }
}

/// Visual snapshot of an element, compared by content digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    digest: String,
}

impl Snapshot {
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self {
            digest: hex::encode(hasher.finalize()),
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.digest[..12])
    }
}

// ============================================================================
// Session state
// ============================================================================

/// Synchronization settings, replaced as a whole on every update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// Timers scheduled further out than this are not tracked
    pub max_timer_wait_ms: Option<f64>,

    /// Regular expressions for URLs whose requests never block idleness
    pub blacklisted_url_patterns: Option<Vec<String>>,

    #[serde(default = "default_true")]
    pub synchronization_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_timer_wait_ms: None,
            blacklisted_url_patterns: None,
            synchronization_enabled: true,
        }
    }
}

/// Connection state of the driver link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Ready,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Ready => write!(f, "ready"),
        }
    }
}
