//! The exercise program: definitions, phases and repeat groups.
//!
//! The built-in catalog is the standard nine-exercise protocol. A catalog
//! can also be read from a RON file with the same shape.

use super::zone::{Rect, Tolerance};
use crate::sensor_link::SockSide;

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

/// Which feet an exercise evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegsUsed {
    Left,
    Right,
    Both,
}

impl LegsUsed {
    /// The evaluated feet, left first.
    pub fn feet(self) -> &'static [SockSide] {
        match self {
            LegsUsed::Left => &[SockSide::Left],
            LegsUsed::Right => &[SockSide::Right],
            LegsUsed::Both => &[SockSide::Left, SockSide::Right],
        }
    }

    pub fn uses(self, side: SockSide) -> bool {
        self.feet().contains(&side)
    }
}

impl fmt::Display for LegsUsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegsUsed::Left => write!(f, "left"),
            LegsUsed::Right => write!(f, "right"),
            LegsUsed::Both => write!(f, "both"),
        }
    }
}

fn yes() -> bool {
    true
}

/// A timed segment of an exercise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZonePhase {
    /// Seconds
    pub duration: u32,
    pub zones: Tolerance,
    /// When false the phase is a plain wait: no zones, no balance loss.
    #[serde(default = "yes")]
    pub check_cop: bool,
    /// Tolerances for the left foot, when they differ.
    #[serde(default)]
    pub left_zones: Option<Tolerance>,
}

impl ZonePhase {
    fn new(duration: u32, green: Rect, red: Rect) -> Self {
        Self {
            duration,
            zones: Tolerance::new(green, red),
            check_cop: true,
            left_zones: None,
        }
    }

    fn unchecked(mut self) -> Self {
        self.check_cop = false;
        self
    }

    fn with_left(mut self, green: Rect, red: Rect) -> Self {
        self.left_zones = Some(Tolerance::new(green, red));
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.duration))
    }

    /// The tolerances that apply to `side`.
    pub fn zones_for(&self, side: SockSide) -> &Tolerance {
        match (side, &self.left_zones) {
            (SockSide::Left, Some(left)) => left,
            _ => &self.zones,
        }
    }
}

/// Alternating-phase scheduling used by the lunge and lateral-jump drills.
///
/// Phase 0 runs once, then phases 1 and 2 alternate for `repetitions`
/// phases, then phase 3 (if any) runs as a final unchecked wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CyclingRule {
    pub repetitions: u32,
    /// Blank the opposite foot on the tick a foot reports: right after a
    /// left report in phase 2, left after a right report in phase 1.
    #[serde(default)]
    pub suppress_cross_talk: bool,
}

/// An immutable exercise template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseDefinition {
    pub repetition_id: u32,
    pub name: String,
    pub legs_used: LegsUsed,
    /// Seconds of introduction shown the first time through
    pub intro: u32,
    /// Seconds of demonstration shown the first time through
    pub demo: u32,
    /// Seconds both feet must hold still before each set
    pub preparation_cop: u32,
    /// Seconds the exercise runs for
    pub timing_cop: u32,
    /// Seconds of rest after each run
    pub release: u32,
    pub sets: u32,
    pub zone_sequence: Vec<ZonePhase>,
    /// Pause after the configuration message so the HMD can show the text.
    #[serde(default)]
    pub lead_in_ms: u64,
    /// Pause before the exercise timer starts.
    #[serde(default)]
    pub settle_ms: u64,
    #[serde(default)]
    pub cycling: Option<CyclingRule>,
}

impl ExerciseDefinition {
    pub fn timing(&self) -> Duration {
        Duration::from_secs(u64::from(self.timing_cop))
    }

    pub fn lead_in(&self) -> Duration {
        Duration::from_millis(self.lead_in_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Problems loading a catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("could not read exercise catalog {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse exercise catalog: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("invalid exercise catalog: {0}")]
    Invalid(String),
}

/// The ordered exercise program plus its repeat groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub exercises: Vec<ExerciseDefinition>,
    /// After the keyed exercise, replay the listed ones once per program.
    #[serde(default)]
    pub repeat_groups: BTreeMap<u32, Vec<u32>>,
}

impl Catalog {
    /// Parse a RON catalog and check it.
    pub fn from_ron(text: &str) -> Result<Self, CatalogError> {
        let catalog: Catalog = ron::from_str(text)?;
        catalog.validated()
    }

    pub fn from_path(path: &Path) -> Result<Self, CatalogError> {
        let text = fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ron(&text)
    }

    /// Serialize as pretty RON, in the shape [`Catalog::from_ron`] reads.
    pub fn to_ron(&self) -> Result<String, ron::Error> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
    }

    pub fn get(&self, repetition_id: u32) -> Option<&ExerciseDefinition> {
        self.exercises
            .iter()
            .find(|e| e.repetition_id == repetition_id)
    }

    fn validated(mut self) -> Result<Self, CatalogError> {
        if self.exercises.is_empty() {
            return Err(CatalogError::Invalid("no exercises".into()));
        }
        for exercise in &mut self.exercises {
            exercise.sets = exercise.sets.max(1);
            if exercise.zone_sequence.is_empty() {
                return Err(CatalogError::Invalid(format!(
                    "exercise {} has no phases",
                    exercise.repetition_id
                )));
            }
            if exercise.cycling.is_some() && exercise.zone_sequence.len() < 3 {
                return Err(CatalogError::Invalid(format!(
                    "cycling exercise {} needs at least three phases",
                    exercise.repetition_id
                )));
            }
        }
        for (trigger, group) in &self.repeat_groups {
            if let Some(missing) = std::iter::once(trigger)
                .chain(group)
                .find(|id| self.get(**id).is_none())
            {
                return Err(CatalogError::Invalid(format!(
                    "repeat group {} names unknown exercise {}",
                    trigger, missing
                )));
            }
        }
        Ok(self)
    }

    /// The standard balance-training program.
    pub fn builtin() -> Self {
        let r = Rect::new;
        let phase = |d, g: Rect, red: Rect| ZonePhase::new(d, g, red);

        let exercises = vec![
            ExerciseDefinition {
                repetition_id: 1,
                name: "Single-Leg Stance - Right Leg".into(),
                legs_used: LegsUsed::Right,
                intro: 4,
                demo: 4,
                preparation_cop: 3,
                timing_cop: 30,
                release: 3,
                sets: 1,
                zone_sequence: vec![phase(
                    30,
                    r((-0.5, 0.5), (-0.7, 0.7)),
                    r((-1.5, 1.5), (-4.0, 4.1)),
                )],
                lead_in_ms: 0,
                settle_ms: 3000,
                cycling: None,
            },
            ExerciseDefinition {
                repetition_id: 2,
                name: "Single-Leg Stance - Left Leg".into(),
                legs_used: LegsUsed::Left,
                intro: 0,
                demo: 0,
                preparation_cop: 3,
                timing_cop: 30,
                release: 3,
                sets: 1,
                zone_sequence: vec![phase(
                    30,
                    r((0.5, -0.5), (-0.7, 0.7)),
                    r((-1.5, 1.5), (-4.0, 4.1)),
                )],
                lead_in_ms: 1000,
                settle_ms: 3000,
                cycling: None,
            },
            ExerciseDefinition {
                repetition_id: 3,
                name: "Squats With Toe Rise".into(),
                legs_used: LegsUsed::Both,
                intro: 0,
                demo: 6,
                preparation_cop: 6,
                timing_cop: 30,
                release: 2,
                sets: 2,
                zone_sequence: vec![
                    phase(3, r((0.0, 1.0), (-1.0, 1.0)), r((-0.8, 1.2), (-1.5, 1.5))),
                    phase(1, r((-1.0, 1.0), (-1.0, 1.0)), r((-1.5, 1.5), (-1.5, 1.5))),
                    phase(1, r((0.5, 1.0), (1.0, 3.0)), r((-0.2, 1.5), (0.0, 4.0))),
                    phase(1, r((-1.0, 1.0), (-1.0, 1.0)), r((-1.5, 1.5), (-1.5, 2.0))),
                ],
                lead_in_ms: 2000,
                settle_ms: 0,
                cycling: None,
            },
            ExerciseDefinition {
                repetition_id: 4,
                name: "Vertical Jumps".into(),
                legs_used: LegsUsed::Both,
                intro: 0,
                demo: 6,
                preparation_cop: 3,
                timing_cop: 30,
                release: 2,
                sets: 2,
                zone_sequence: vec![
                    phase(2, r((-1.0, 1.0), (-1.0, 1.0)), r((-1.5, 1.5), (-1.5, 1.5))),
                    phase(2, r((-1.0, 1.0), (-1.0, 1.0)), r((-1.5, 1.5), (-1.5, 1.5))),
                    // airborne
                    phase(1, r((-1.0, 1.0), (0.2, 0.8)), r((-1.5, 1.5), (0.0, 1.0))).unchecked(),
                    phase(1, r((-1.0, 1.0), (0.2, 0.5)), r((-1.5, 1.5), (0.0, 1.0))),
                ],
                lead_in_ms: 2000,
                settle_ms: 0,
                cycling: None,
            },
            ExerciseDefinition {
                repetition_id: 5,
                name: "Squats Walking Lunges - Both Leg".into(),
                legs_used: LegsUsed::Both,
                intro: 1,
                demo: 3,
                preparation_cop: 3,
                timing_cop: 49,
                release: 2,
                sets: 2,
                zone_sequence: vec![
                    phase(1, r((-0.5, 0.5), (-1.0, 1.0)), r((-2.0, 2.0), (-4.0, 4.0))),
                    phase(2, r((-0.5, 0.5), (-2.0, 2.0)), r((-1.5, 1.5), (-5.0, 5.0))),
                    phase(2, r((-0.5, 1.5), (0.3, 3.0)), r((-2.0, 2.0), (0.0, 3.0)))
                        .with_left(r((-1.5, 1.5), (0.3, 5.5)), r((-2.0, 2.0), (0.0, 4.0))),
                    phase(8, r((-0.5, 1.5), (1.0, 2.0)), r((-2.0, 2.0), (0.0, 1.0))).unchecked(),
                ],
                lead_in_ms: 0,
                settle_ms: 0,
                cycling: Some(CyclingRule {
                    repetitions: 20,
                    suppress_cross_talk: false,
                }),
            },
            ExerciseDefinition {
                repetition_id: 6,
                name: "Jumping - Lateral Jumps Both".into(),
                legs_used: LegsUsed::Both,
                intro: 1,
                demo: 3,
                preparation_cop: 3,
                timing_cop: 29,
                release: 2,
                sets: 2,
                zone_sequence: vec![
                    phase(1, r((-1.0, 1.0), (-1.0, 1.0)), r((-2.0, 2.0), (-4.0, 4.0))),
                    phase(2, r((-1.5, 1.5), (0.5, 1.9)), r((-2.0, 2.0), (0.0, 4.0))),
                    phase(2, r((-0.7, 0.7), (-4.0, 4.0)), r((-1.5, 1.5), (-4.0, 4.0)))
                        .with_left(r((-1.0, 1.0), (0.2, 1.9)), r((-1.5, 1.5), (0.0, 4.0))),
                ],
                lead_in_ms: 0,
                settle_ms: 0,
                cycling: Some(CyclingRule {
                    repetitions: 20,
                    suppress_cross_talk: true,
                }),
            },
            ExerciseDefinition {
                repetition_id: 7,
                name: "Squats - One-leg Squats Right".into(),
                legs_used: LegsUsed::Right,
                intro: 0,
                demo: 5,
                preparation_cop: 3,
                timing_cop: 50,
                release: 2,
                sets: 1,
                zone_sequence: vec![
                    phase(3, r((-1.0, 0.8), (-1.5, 1.5)), r((-2.0, 1.2), (-3.0, 3.0))),
                    phase(2, r((-0.8, 0.8), (-0.8, 0.8)), r((-1.5, 1.5), (-1.5, 1.5))),
                ],
                lead_in_ms: 2500,
                settle_ms: 0,
                cycling: None,
            },
            ExerciseDefinition {
                repetition_id: 8,
                name: "Squats - One-leg Squats Left".into(),
                legs_used: LegsUsed::Left,
                intro: 0,
                demo: 0,
                preparation_cop: 3,
                timing_cop: 50,
                release: 2,
                sets: 1,
                zone_sequence: vec![
                    phase(3, r((-1.0, 0.8), (-1.5, 1.5)), r((-2.0, 1.2), (-3.0, 3.0))),
                    phase(2, r((-0.8, 0.8), (-0.8, 0.8)), r((-1.5, 1.5), (-1.5, 1.5))),
                ],
                lead_in_ms: 1000,
                settle_ms: 0,
                cycling: None,
            },
            ExerciseDefinition {
                repetition_id: 9,
                name: "Jumping - Box Jumps".into(),
                legs_used: LegsUsed::Both,
                intro: 1,
                demo: 3,
                preparation_cop: 3,
                timing_cop: 30,
                release: 2,
                sets: 2,
                zone_sequence: vec![
                    phase(2, r((-0.8, 0.8), (-0.8, 0.8)), r((-1.5, 1.5), (-1.5, 1.5))),
                    phase(28, r((-1.5, 1.5), (-3.0, 3.0)), r((-2.0, 2.0), (-3.5, 3.5))),
                ],
                lead_in_ms: 0,
                settle_ms: 0,
                cycling: None,
            },
        ];

        Catalog {
            exercises,
            repeat_groups: BTreeMap::from([(2, vec![1, 2]), (8, vec![7, 8])]),
        }
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}
