//! Tolerance rectangles and the feedback zones they classify CoP into.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A closed interval. Constructed bounds are reordered so `min <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64)", into = "(f64, f64)")]
pub struct Span {
    /// Lower bound, inclusive
    pub min: f64,
    /// Upper bound, inclusive
    pub max: f64,
}

impl Span {
    /// The interval between `a` and `b`, in either order.
    pub fn new(a: f64, b: f64) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    /// Whether `v` lies in the interval, bounds included.
    pub fn contains(&self, v: f64) -> bool {
        self.min <= v && v <= self.max
    }
}

impl From<(f64, f64)> for Span {
    fn from((a, b): (f64, f64)) -> Self {
        Span::new(a, b)
    }
}

impl From<Span> for (f64, f64) {
    fn from(span: Span) -> Self {
        (span.min, span.max)
    }
}

/// An axis-aligned rectangle in CoP space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    /// Medial-lateral extent
    pub x: Span,
    /// Anterior-posterior extent
    pub y: Span,
}

impl Rect {
    /// A rectangle from its X and Y ranges.
    pub fn new(x: (f64, f64), y: (f64, f64)) -> Self {
        Self {
            x: x.into(),
            y: y.into(),
        }
    }

    /// Whether `(x, y)` lies inside or on the edge.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.x.contains(x) && self.y.contains(y)
    }
}

/// Where a CoP reading falls relative to a phase's tolerances.
///
/// The numeric codes are what the HMD receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Zone {
    /// Outside both rectangles, or on an axis inside the red one
    Outside,
    /// Inside the green rectangle
    Green,
    /// Red rectangle, x > 0 and y > 0
    FrontRight,
    /// Red rectangle, x < 0 and y > 0
    FrontLeft,
    /// Red rectangle, x > 0 and y < 0
    BackRight,
    /// Red rectangle, x < 0 and y < 0
    BackLeft,
    /// Sentinel sent when balance is lost
    Lost,
}

impl Zone {
    /// The number sent to the HMD.
    pub fn code(self) -> i32 {
        match self {
            Zone::Outside => 0,
            Zone::Green => 1,
            Zone::FrontRight => 3,
            Zone::FrontLeft => 4,
            Zone::BackRight => 5,
            Zone::BackLeft => 6,
            Zone::Lost => 7,
        }
    }

    /// Everything except [`Zone::Outside`] may be reported.
    pub fn is_reportable(self) -> bool {
        self != Zone::Outside
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// The green and red rectangles of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    /// Target area
    pub green: Rect,
    /// Wider area that still counts as balanced
    pub red: Rect,
}

impl Tolerance {
    /// Tolerances from the green and red rectangles.
    pub fn new(green: Rect, red: Rect) -> Self {
        Self { green, red }
    }

    /// Green wins over red; inside red the quadrant picks the zone.
    pub fn classify(&self, x: f64, y: f64) -> Zone {
        if self.green.contains(x, y) {
            return Zone::Green;
        }
        if !self.red.contains(x, y) {
            return Zone::Outside;
        }
        if x > 0.0 && y > 0.0 {
            Zone::FrontRight
        } else if x < 0.0 && y > 0.0 {
            Zone::FrontLeft
        } else if x > 0.0 && y < 0.0 {
            Zone::BackRight
        } else if x < 0.0 && y < 0.0 {
            Zone::BackLeft
        } else {
            Zone::Outside
        }
    }
}
