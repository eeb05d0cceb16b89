//! The balance-exercise program and the engine that runs it.

mod catalog;
mod runner;
mod zone;

pub use catalog::{
    Catalog, CatalogError, CyclingRule, ExerciseDefinition, LegsUsed, ZonePhase,
};
pub use runner::{EngineSettings, ExerciseEngine, ExerciseOutcome, ExerciseRun, ProgramState};
pub use zone::{Rect, Span, Tolerance, Zone};

use crate::sensor_link::SockSide;

/// The latest center of pressure per foot.
pub trait CopSource: Send + Sync {
    /// Calibrated CoP of `side`, or `None` while that sock has no reading.
    /// The engine classifies a missing reading as [`Zone::Outside`].
    fn cop(&self, side: SockSide) -> Option<(f64, f64)>;
}
