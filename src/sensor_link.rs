//! Turns one sock's serial bytes into filtered pressures and center of
//! pressure (CoP), and owns the sock's calibration.
//!
//! The four pressure pads sit at fixed anatomical positions. Their raw
//! readings are resistances, so the link works in conductance (`1/raw`),
//! smooths the four channels, and takes the pressure-weighted centroid.

use crate::clock::{CancelToken, Clock};
use crate::packet::{PacketScanner, RawFrame};

use log::{debug, info, warn};
use nom::{
    bytes::complete::tag_no_case,
    character::complete::{space0, u32},
    combinator::all_consuming,
    sequence::{delimited, preceded},
    IResult,
};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

/// Number of pressure pads per sock.
pub const CHANNELS: usize = 4;

/// Command that asks the firmware for its module number.
pub const IDENTITY_QUERY: &str = "BTS6?";

const IDENTITY_LABEL: &str = "Register 6 value:";
const FILTER_RADIUS: usize = 2;

const RIGHT_OFFSETS: [usize; CHANNELS] = [30, 32, 38, 40];
const LEFT_OFFSETS: [usize; CHANNELS] = [44, 32, 38, 40];
const X_POSITIONS: [f64; CHANNELS] = [3.0, -3.0, 3.0, -3.0];
const Y_POSITIONS: [f64; CHANNELS] = [4.0, 4.0, -4.0, -4.0];

/// Which foot a sock is worn on.
///
/// Each side carries its own pressure-pad byte offsets and X sign
/// convention; a link picks one once the module identity is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SockSide {
    /// Odd module numbers
    Left,
    /// Even module numbers
    Right,
}

impl SockSide {
    /// Odd module numbers are left socks, even are right socks.
    pub fn from_module_number(module_number: u32) -> Self {
        if module_number % 2 != 0 {
            SockSide::Left
        } else {
            SockSide::Right
        }
    }

    /// Frame offsets of the four big-endian pressure magnitudes.
    pub fn sensor_offsets(self) -> [usize; CHANNELS] {
        match self {
            SockSide::Left => LEFT_OFFSETS,
            SockSide::Right => RIGHT_OFFSETS,
        }
    }

    /// Pad X coordinates; the right sock mirrors the left.
    pub fn x_positions(self) -> [f64; CHANNELS] {
        match self {
            SockSide::Left => X_POSITIONS,
            SockSide::Right => X_POSITIONS.map(|x| -x),
        }
    }

    /// Pad Y coordinates, identical for both feet.
    pub fn y_positions(self) -> [f64; CHANNELS] {
        Y_POSITIONS
    }

    /// Both sides, left first.
    pub fn both() -> [SockSide; 2] {
        [SockSide::Left, SockSide::Right]
    }
}

impl fmt::Display for SockSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SockSide::Left => write!(f, "Left"),
            SockSide::Right => write!(f, "Right"),
        }
    }
}

fn register_six(s: &str) -> IResult<&str, u32> {
    all_consuming(preceded(
        tag_no_case(IDENTITY_LABEL),
        delimited(space0, u32, space0),
    ))(s)
}

/// Find the module number in a firmware response to [`IDENTITY_QUERY`].
///
/// The response may carry other lines; the first line containing
/// `Register 6 value: <n>` wins.
pub fn parse_module_number(response: &str) -> Option<u32> {
    let label = IDENTITY_LABEL.to_ascii_lowercase();
    response
        .lines()
        .map(str::trim)
        .filter_map(|line| {
            let at = line.to_ascii_lowercase().find(&label)?;
            register_six(&line[at..]).ok().map(|(_, n)| n)
        })
        .next()
}

/// Conductance of one channel; a zero reading means no contact.
fn conductance(raw: u16) -> f64 {
    if raw > 0 {
        1.0 / raw as f64
    } else {
        0.0
    }
}

/// Symmetric weighted moving average across the channels.
///
/// Neighbours within [`FILTER_RADIUS`] contribute with weight
/// `1 / (distance + 1)`.
pub fn smooth(raw: &[f64; CHANNELS]) -> [f64; CHANNELS] {
    std::array::from_fn(|i| {
        let lo = i.saturating_sub(FILTER_RADIUS);
        let hi = (i + FILTER_RADIUS).min(CHANNELS - 1);
        let (sum, weights) = (lo..=hi).fold((0.0, 0.0), |(sum, weights), j| {
            let weight = 1.0 / (i.abs_diff(j) + 1) as f64;
            (sum + raw[j] * weight, weights + weight)
        });
        sum / weights
    })
}

/// Pressure-weighted centroid minus `offset`, or `None` when nothing presses.
pub fn centroid(
    pressures: &[f64; CHANNELS],
    side: SockSide,
    offset: (f64, f64),
) -> Option<(f64, f64)> {
    let total: f64 = pressures.iter().sum();
    if total <= 0.0 {
        return None;
    }
    let weighted = |coords: [f64; CHANNELS]| -> f64 {
        pressures.iter().zip(coords).map(|(p, c)| p * c).sum::<f64>() / total
    };
    Some((
        weighted(side.x_positions()) - offset.0,
        weighted(side.y_positions()) - offset.1,
    ))
}

/// CoP plus the pressures it was computed from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CopReading {
    /// Calibrated CoP X, 0 when nothing presses
    pub x: f64,
    /// Calibrated CoP Y, 0 when nothing presses
    pub y: f64,
    /// Filtered channel conductances
    pub pressures: [f64; CHANNELS],
}

/// Timing of a calibration pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    /// Length of the sampling pass
    pub duration: Duration,
    /// Interval between samples
    pub tick: Duration,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            tick: Duration::from_millis(100),
        }
    }
}

/// Total-pressure range seen during the last successful calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureBounds {
    /// Lowest total pressure sampled
    pub min: f64,
    /// Highest total pressure sampled
    pub max: f64,
}

#[derive(Debug, Default)]
struct LinkState {
    identity: Option<(u32, SockSide)>,
    pressures: [f64; CHANNELS],
    left_offset: (f64, f64),
    right_offset: (f64, f64),
    bounds: Option<PressureBounds>,
}

impl LinkState {
    fn side(&self) -> SockSide {
        self.identity.map(|(_, side)| side).unwrap_or(SockSide::Right)
    }

    fn offset(&self, side: SockSide) -> (f64, f64) {
        match side {
            SockSide::Left => self.left_offset,
            SockSide::Right => self.right_offset,
        }
    }
}

/// Decoder and CoP estimator for one sock.
///
/// Shared between the serial reader thread (which feeds bytes) and whoever
/// calibrates or queries it; the filtered pressures live under one lock.
#[derive(Debug, Default)]
pub struct SensorLink {
    scanner: Mutex<PacketScanner>,
    state: Mutex<LinkState>,
}

impl SensorLink {
    /// A link with no identity and zero calibration.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Feed serial bytes; returns every valid frame with the CoP it produced.
    pub fn ingest(&self, bytes: &[u8]) -> Vec<(RawFrame, CopReading)> {
        let frames = self
            .scanner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .feed(bytes);

        frames
            .into_iter()
            .map(|frame| {
                let reading = self.update_from(&frame);
                (frame, reading)
            })
            .collect()
    }

    fn update_from(&self, frame: &RawFrame) -> CopReading {
        let mut state = self.state();
        let side = state.side();

        let raw = side
            .sensor_offsets()
            .map(|offset| conductance(frame.magnitude_at(offset).unwrap_or(0)));
        state.pressures = smooth(&raw);

        let (x, y) = match centroid(&state.pressures, side, state.offset(side)) {
            Some(cop) => cop,
            None => {
                debug!("No valid pressure detected, CoP remains at (0,0)");
                (0.0, 0.0)
            }
        };

        CopReading {
            x,
            y,
            pressures: state.pressures,
        }
    }

    /// Record the module number reported by the firmware.
    ///
    /// Only the first identity sticks; later calls return the known side.
    pub fn set_identity(&self, module_number: u32) -> SockSide {
        let mut state = self.state();
        if let Some((_, side)) = state.identity {
            return side;
        }
        let side = SockSide::from_module_number(module_number);
        state.identity = Some((module_number, side));
        info!("Module {} identified as {} sock", module_number, side);
        side
    }

    /// Module number and side, once retrieved.
    pub fn identity(&self) -> Option<(u32, SockSide)> {
        self.state().identity
    }

    /// The active side; right until the identity says otherwise.
    pub fn side(&self) -> SockSide {
        self.state().side()
    }

    /// A copy of the current filtered pressures.
    pub fn pressures(&self) -> [f64; CHANNELS] {
        self.state().pressures
    }

    /// Calibration offset stored for `side`.
    pub fn offset(&self, side: SockSide) -> (f64, f64) {
        self.state().offset(side)
    }

    /// Pressure bounds from the last successful calibration.
    pub fn bounds(&self) -> Option<PressureBounds> {
        self.state().bounds
    }

    /// Total pressure scaled into the calibrated range, if calibrated.
    pub fn normalized_pressure(&self, total: f64) -> Option<f64> {
        self.bounds()
            .map(|PressureBounds { min, max }| (total - min) / (max - min))
    }

    /// Sample the current pressures for `settings.duration` and store the
    /// mean uncalibrated CoP as `side`'s offset.
    ///
    /// Returns false, leaving earlier offsets untouched, when no tick saw all
    /// four pads loaded, when total pressure never varied, or on
    /// cancellation.
    pub fn calibrate(
        &self,
        side: SockSide,
        settings: CalibrationSettings,
        clock: &dyn Clock,
        cancel: &CancelToken,
    ) -> bool {
        info!("Calibrating {} sock for {:?}", side, settings.duration);

        let mut min = f64::MAX;
        let mut max = f64::MIN;
        let (mut sum_x, mut sum_y) = (0.0, 0.0);
        let mut samples = 0u32;
        let started = clock.now();

        while clock.now() - started < settings.duration {
            {
                let state = self.state();
                let total: f64 = state.pressures.iter().sum();
                if total > 0.0 && state.pressures.iter().all(|p| *p > 0.0) {
                    if let Some((x, y)) = centroid(&state.pressures, side, (0.0, 0.0)) {
                        min = min.min(total);
                        max = max.max(total);
                        sum_x += x;
                        sum_y += y;
                        samples += 1;
                    }
                }
            }

            if clock.pause(settings.tick, cancel).is_err() {
                warn!("Calibration of {} sock cancelled", side);
                return false;
            }
        }

        if samples == 0 || max - min <= 0.0 {
            warn!(
                "Calibration of {} sock failed: {} valid samples, pressure range {:.6}",
                side,
                samples,
                if samples == 0 { 0.0 } else { max - min }
            );
            return false;
        }

        let offset = (sum_x / samples as f64, sum_y / samples as f64);
        let mut state = self.state();
        match side {
            SockSide::Left => state.left_offset = offset,
            SockSide::Right => state.right_offset = offset,
        }
        state.bounds = Some(PressureBounds { min, max });
        info!(
            "{} foot offset X: {:.4}, Y: {:.4} (Pmin {:.6}, Pmax {:.6})",
            side, offset.0, offset.1, min, max
        );
        true
    }
}
